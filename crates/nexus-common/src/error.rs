//! Common error types for Quantum Nexus.

use thiserror::Error;

/// Result type alias using the workspace error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for identity and session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Identity or session used before `initialize`.
    #[error("identity not initialized")]
    NotInitialized,

    /// The operation needs a known location but none has been set.
    #[error("location not available")]
    NoLocation,

    /// Inbound payload could not be parsed as a peer message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Signature did not verify against the sender's key.
    #[error("verification failure: {0}")]
    VerificationFailure(String),

    /// Caller supplied an out-of-range or otherwise unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Cryptographic operation failed (bad key encoding, etc.)
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The transport capability reported a failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a malformed-message error from any displayable type.
    pub fn malformed(msg: impl std::fmt::Display) -> Self {
        Self::MalformedMessage(msg.to_string())
    }

    /// Create a verification error from any displayable type.
    pub fn verification(msg: impl std::fmt::Display) -> Self {
        Self::VerificationFailure(msg.to_string())
    }

    /// Create an invalid-argument error from any displayable type.
    pub fn invalid_argument(msg: impl std::fmt::Display) -> Self {
        Self::InvalidArgument(msg.to_string())
    }

    /// Create a crypto error from any displayable type.
    pub fn crypto(msg: impl std::fmt::Display) -> Self {
        Self::Crypto(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a not found error from any displayable type.
    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}
