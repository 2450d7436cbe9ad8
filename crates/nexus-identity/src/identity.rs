//! Ed25519 identity keys and DID ids.
//!
//! A **DID id** is `did:quantum:` followed by the first 16 hex characters
//! of the Ed25519 public key. The public key itself travels as unpadded
//! base64url (32 bytes → 43 characters).
//!
//! # Example
//!
//! ```
//! use nexus_identity::identity::{IdentityKeypair, PublicIdentity};
//!
//! let keypair = IdentityKeypair::generate();
//! println!("DID: {}", keypair.did_id());
//!
//! let signature = keypair.sign(b"hello mesh");
//!
//! let public = PublicIdentity::from_encoded(&keypair.public_key_encoded()).unwrap();
//! assert!(public.verify(b"hello mesh", &signature));
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use nexus_common::{Did, Error, Result};
use rand::rngs::OsRng;
use std::fmt;

/// DID method prefix.
pub const DID_PREFIX: &str = "did:quantum:";

/// Number of hex characters of the public key kept in a DID id.
pub const DID_ID_HEX_LEN: usize = 16;

/// Derive the DID id for a raw public key.
pub fn derive_did_id(public_key: &[u8; 32]) -> String {
    let hex = hex::encode(public_key);
    format!("{DID_PREFIX}{}", &hex[..DID_ID_HEX_LEN])
}

/// Check that `did.id` is the id derived from `did.public_key` and return
/// the parsed key.
///
/// A remote DID whose id does not match its key must not be trusted to
/// verify messages claiming that id.
pub fn verify_did_binding(did: &Did) -> Result<PublicIdentity> {
    let public = PublicIdentity::from_encoded(&did.public_key)?;
    if public.did_id() != did.id {
        return Err(Error::verification(format!(
            "DID {} is not bound to its public key",
            did.id
        )));
    }
    Ok(public)
}

/// Ed25519 identity keypair.
///
/// The signing key never leaves this type except through [`Self::sign`].
pub struct IdentityKeypair {
    signing_key: SigningKey,
}

impl IdentityKeypair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from raw signing key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// The DID id bound to this keypair.
    pub fn did_id(&self) -> String {
        derive_did_id(self.signing_key.verifying_key().as_bytes())
    }

    /// Get the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.signing_key.verifying_key().as_bytes()
    }

    /// Public key in its wire encoding (unpadded base64url).
    pub fn public_key_encoded(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public_key_bytes())
    }

    /// Sign a message with this identity.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against this identity's public key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let sig = match Signature::from_slice(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.signing_key
            .verifying_key()
            .verify(message, &sig)
            .is_ok()
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKeypair({})", self.did_id())
    }
}

/// Public identity (verifying key only).
///
/// Used when you only need to verify signatures, not create them.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    verifying_key: VerifyingKey,
}

impl PublicIdentity {
    /// Create from raw public key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| Error::crypto(format!("invalid public key: {e}")))?;
        Ok(Self { verifying_key })
    }

    /// Parse the wire encoding produced by
    /// [`IdentityKeypair::public_key_encoded`].
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::crypto(format!("invalid base64url public key: {e}")))?;

        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::crypto(format!(
                "invalid public key length: expected 32 bytes, got {}",
                b.len()
            ))
        })?;

        Self::from_bytes(&bytes)
    }

    /// The DID id bound to this key.
    pub fn did_id(&self) -> String {
        derive_did_id(self.verifying_key.as_bytes())
    }

    /// Verify a signature. Returns `false` for malformed signatures.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let sig = match Signature::from_slice(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.verifying_key.verify(message, &sig).is_ok()
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({})", self.did_id())
    }
}
