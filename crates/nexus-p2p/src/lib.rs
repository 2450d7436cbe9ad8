//! Peer session manager for Quantum Nexus.
//!
//! The manager owns every peer connection and data channel, signs outgoing
//! messages through the identity service, verifies and dispatches inbound
//! ones, and reports everything as [`SessionEvent`]s.
//!
//! # Design
//!
//! All session state lives in a single task (see `event_loop`). The
//! [`PeerSessionManager`] handle only sends commands to that task, so the
//! peer tables have exactly one mutator and need no locking. Transports
//! report connection activity through a [`transport::TransportSink`],
//! which the same task drains.
//!
//! Signaling is out of scope: offers, answers and candidates are emitted as
//! events (convertible to [`nexus_common::SignalMessage`]) for an external
//! relay to carry, and fed back in through
//! [`PeerSessionManager::apply_signal`].

#![forbid(unsafe_code)]

mod event_loop;

pub mod config;
pub mod events;
pub mod manager;
pub mod proximity;
pub mod transport;

pub use config::SessionConfig;
pub use events::{
    AnswerSignal, CandidateSignal, EmergencyValidation, EventStream, OfferSignal, SessionEvent,
};
pub use manager::{PeerSessionManager, SessionStats};
pub use proximity::{haversine_km, is_in_proximity, EARTH_RADIUS_KM};
pub use transport::memory::MemoryTransport;
pub use transport::{DataChannel, DataChannelOptions, PeerConnection, Transport};

#[cfg(feature = "webrtc-transport")]
pub use transport::webrtc::WebRtcTransport;
