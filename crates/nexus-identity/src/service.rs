//! The identity service: one keypair, one DID, an optional location.
//!
//! State machine: `Uninitialized → Initialized`, one-way. The keypair and
//! DID id never change once created; only metadata (location, reputation,
//! `lastUpdated`) is mutated afterwards.

use chrono::{DateTime, Utc};
use nexus_common::{now_millis, Did, DidMetadata, Error, Location, Result};
use rand::Rng;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use crate::identity::{IdentityKeypair, PublicIdentity};

/// Maximum jitter, in degrees, added to each coordinate when cloaking.
/// Roughly 1 km of uncertainty.
pub const CLOAK_JITTER_DEGREES: f64 = 0.005;

/// Factor applied to the reported accuracy when cloaking.
pub const CLOAK_ACCURACY_FACTOR: f64 = 3.0;

/// Literal tag prefixed to emergency payloads before signing.
pub const EMERGENCY_TAG: &str = "EMERGENCY";

/// The exact byte sequence that gets signed: `content:timestampMillis`.
pub fn signing_input(content: &str, timestamp_ms: i64) -> String {
    format!("{content}:{timestamp_ms}")
}

/// Output of [`IdentityService::sign_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    pub signature: Vec<u8>,
    /// Millisecond precision; part of the signed bytes.
    pub timestamp: DateTime<Utc>,
}

/// Output of [`IdentityService::create_emergency_signal`].
#[derive(Debug, Clone, PartialEq)]
pub struct EmergencySignal {
    pub signal: Vec<u8>,
    pub location: Location,
    pub timestamp: DateTime<Utc>,
}

struct IdentityState {
    keypair: IdentityKeypair,
    did: RwLock<Did>,
}

/// Owns the local signing keypair and DID.
#[derive(Default)]
pub struct IdentityService {
    state: OnceCell<IdentityState>,
}

impl IdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the identity on first call and return the cached DID after.
    ///
    /// Concurrent first calls wait on the same initialization, so exactly
    /// one keypair is ever generated.
    pub async fn initialize(&self) -> Result<Did> {
        let state = self
            .state
            .get_or_init(|| async {
                let keypair = IdentityKeypair::generate();
                let now = now_millis();
                let did = Did {
                    id: keypair.did_id(),
                    public_key: keypair.public_key_encoded(),
                    metadata: DidMetadata {
                        created: now,
                        last_updated: now,
                        reputation: 0,
                        location: None,
                    },
                };
                info!(did = %did.id, "identity created");
                IdentityState {
                    keypair,
                    did: RwLock::new(did),
                }
            })
            .await;

        Ok(state.did.read().await.clone())
    }

    fn state(&self) -> Result<&IdentityState> {
        self.state.get().ok_or(Error::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized()
    }

    /// The local DID id.
    pub fn did_id(&self) -> Result<String> {
        Ok(self.state()?.keypair.did_id())
    }

    /// Snapshot of the current DID.
    pub async fn did(&self) -> Result<Did> {
        Ok(self.state()?.did.read().await.clone())
    }

    /// Current location, cloaked if it was set that way.
    pub async fn location(&self) -> Result<Option<Location>> {
        Ok(self.state()?.did.read().await.metadata.location)
    }

    /// Sign `content:timestampMillis` with the local key.
    pub fn sign_message(&self, content: &str) -> Result<SignedPayload> {
        let state = self.state()?;
        let timestamp = now_millis();
        let input = signing_input(content, timestamp.timestamp_millis());
        let signature = state.keypair.sign(input.as_bytes()).to_vec();
        Ok(SignedPayload {
            signature,
            timestamp,
        })
    }

    /// Check `signature` over `content:timestampMillis` under `public_key`.
    ///
    /// A signature that does not verify yields `Ok(false)`; only a
    /// malformed public key is an error.
    pub fn verify_message(
        &self,
        content: &str,
        signature: &[u8],
        timestamp: DateTime<Utc>,
        public_key: &str,
    ) -> Result<bool> {
        let public = PublicIdentity::from_encoded(public_key)?;
        let input = signing_input(content, timestamp.timestamp_millis());
        Ok(public.verify(input.as_bytes(), signature))
    }

    /// Record the current position.
    ///
    /// When `cloaked`, each coordinate gets independent jitter within
    /// `±CLOAK_JITTER_DEGREES` and accuracy is multiplied by
    /// `CLOAK_ACCURACY_FACTOR`. Returns the stored location.
    pub async fn update_location(
        &self,
        lat: f64,
        lng: f64,
        accuracy: f64,
        cloaked: bool,
    ) -> Result<Location> {
        let state = self.state()?;

        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(Error::invalid_argument(format!("latitude {lat} out of range")));
        }
        if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
            return Err(Error::invalid_argument(format!("longitude {lng} out of range")));
        }
        if !accuracy.is_finite() || accuracy < 0.0 {
            return Err(Error::invalid_argument(format!("accuracy {accuracy} is invalid")));
        }

        let now = now_millis();
        let location = if cloaked {
            Location {
                lat: cloak_coordinate(lat).clamp(-90.0, 90.0),
                lng: cloak_coordinate(lng),
                accuracy: accuracy * CLOAK_ACCURACY_FACTOR,
                timestamp: now,
                cloaked: true,
            }
        } else {
            Location {
                lat,
                lng,
                accuracy,
                timestamp: now,
                cloaked: false,
            }
        };

        let mut did = state.did.write().await;
        did.metadata.location = Some(location);
        did.metadata.last_updated = now;
        debug!(cloaked, "location updated");

        Ok(location)
    }

    /// Shift the reputation score by `delta` and return the new value.
    pub async fn adjust_reputation(&self, delta: i64) -> Result<i64> {
        let state = self.state()?;
        let mut did = state.did.write().await;
        did.metadata.reputation = did.metadata.reputation.saturating_add(delta);
        did.metadata.last_updated = now_millis();
        Ok(did.metadata.reputation)
    }

    /// Sign `EMERGENCY:<message>:<location json>` with the current location.
    pub async fn create_emergency_signal(&self, message: &str) -> Result<EmergencySignal> {
        let location = self.location().await?.ok_or(Error::NoLocation)?;
        let location_json = serde_json::to_string(&location).map_err(Error::serialization)?;

        let signed = self.sign_message(&format!("{EMERGENCY_TAG}:{message}:{location_json}"))?;

        Ok(EmergencySignal {
            signal: signed.signature,
            location,
            timestamp: signed.timestamp,
        })
    }
}

fn cloak_coordinate(coord: f64) -> f64 {
    coord + rand::thread_rng().gen_range(-CLOAK_JITTER_DEGREES..=CLOAK_JITTER_DEGREES)
}
