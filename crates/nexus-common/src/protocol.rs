//! Wire types exchanged between peers and with the signaling relay.
//!
//! Everything here serializes to the JSON shape peers put on a data
//! channel: camelCase keys, epoch-millisecond timestamps, base64
//! signatures.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current time truncated to the millisecond precision used on the wire.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Kind of a peer message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    #[default]
    Text,
    Neural,
    Holographic,
    Emergency,
    TimeWarp,
}

/// A geographic position, possibly cloaked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    /// Reported accuracy in metres. Inflated 3x when cloaked.
    pub accuracy: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub cloaked: bool,
}

/// Affective annotation carried by `neural` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeuralState {
    /// In `[0, 1]`.
    pub emotional_resonance: f64,
    pub cognitive_state: String,
}

/// Optional per-message metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub unlock_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neural: Option<NeuralState>,
}

impl MessageMetadata {
    pub fn with_unlock_time(unlock_time: DateTime<Utc>) -> Self {
        Self {
            unlock_time: Some(unlock_time),
            ..Default::default()
        }
    }

    pub fn with_location(location: Location) -> Self {
        Self {
            location: Some(location),
            ..Default::default()
        }
    }

    pub fn with_neural(neural: NeuralState) -> Self {
        Self {
            neural: Some(neural),
            ..Default::default()
        }
    }
}

/// A signed (or unsigned) message as it travels between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    /// DID id of the author.
    pub sender: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "signature_base64"
    )]
    pub signature: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl PeerMessage {
    /// Serialize to the wire JSON shape.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::serialization)
    }

    /// Parse a raw data-channel payload.
    ///
    /// Anything that is not a well-formed peer message yields
    /// [`Error::MalformedMessage`].
    pub fn decode(raw: &str) -> Result<Self> {
        let message: PeerMessage = serde_json::from_str(raw).map_err(Error::malformed)?;

        if let Some(neural) = message.metadata.as_ref().and_then(|m| m.neural.as_ref()) {
            if !(0.0..=1.0).contains(&neural.emotional_resonance) {
                return Err(Error::malformed(format!(
                    "emotionalResonance {} outside [0, 1]",
                    neural.emotional_resonance
                )));
            }
        }

        Ok(message)
    }

    /// Instant at which a time-warp message becomes deliverable.
    pub fn unlock_time(&self) -> Option<DateTime<Utc>> {
        self.metadata.as_ref().and_then(|m| m.unlock_time)
    }

    /// Location attached to the message, if any.
    pub fn location(&self) -> Option<&Location> {
        self.metadata.as_ref().and_then(|m| m.location.as_ref())
    }

    /// Key under which a deferred time-warp message is stored:
    /// `sender:timestampMillis`.
    pub fn time_warp_key(&self) -> String {
        format!("{}:{}", self.sender, self.timestamp.timestamp_millis())
    }
}

/// The caller-supplied part of an outgoing message.
///
/// `sender`, `timestamp` and `signature` are filled in by the session
/// manager when the draft is sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageDraft {
    pub kind: MessageType,
    pub content: String,
    pub metadata: Option<MessageMetadata>,
}

impl MessageDraft {
    pub fn new(kind: MessageType, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MessageType::Text, content)
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Mutable bookkeeping attached to a DID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidMetadata {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
    pub reputation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// Public view of an identity: id, public key and metadata.
///
/// Never carries private key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Did {
    /// `did:quantum:<16 hex chars of the public key>`.
    pub id: String,
    /// Base64url (unpadded) Ed25519 public key.
    pub public_key: String,
    pub metadata: DidMetadata,
}

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Opaque negotiation blob produced by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate produced by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Envelope an external relay carries between peers during negotiation.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
#[allow(non_camel_case_types)]
pub enum SignalMessage {
    /// Offer from `from` to `target`, with the offerer's DID so the
    /// answerer learns the key that signs later messages.
    OFFER {
        from: String,
        target: String,
        sdp: SessionDescription,
        did: Did,
    },

    /// Answer from `from` back to the offerer.
    ANSWER {
        from: String,
        target: String,
        sdp: SessionDescription,
        did: Did,
    },

    /// ICE candidate, optionally tagged with the sender's location.
    CANDIDATE {
        from: String,
        target: String,
        candidate: IceCandidate,
        #[serde(default)]
        location: Option<Location>,
    },
}

impl SignalMessage {
    pub fn from(&self) -> &str {
        match self {
            SignalMessage::OFFER { from, .. }
            | SignalMessage::ANSWER { from, .. }
            | SignalMessage::CANDIDATE { from, .. } => from,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            SignalMessage::OFFER { target, .. }
            | SignalMessage::ANSWER { target, .. }
            | SignalMessage::CANDIDATE { target, .. } => target,
        }
    }
}

mod signature_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(signature: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match signature {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
