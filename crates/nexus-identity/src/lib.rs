//! Identity service for Quantum Nexus.
//!
//! This crate provides:
//! - Ed25519 identity keys and DID ids derived from them
//! - Signing and verification of `content:timestampMillis` payloads
//! - A location record that can be cloaked with bounded jitter
//! - Signed emergency payloads bound to the current location
//!
//! # Design
//!
//! An [`IdentityService`] owns exactly one keypair for the life of the
//! process. The keypair is created lazily by [`IdentityService::initialize`]
//! behind a single-flight cell, so concurrent first calls still produce a
//! single identity.

#![forbid(unsafe_code)]

pub mod identity;
pub mod service;

pub use identity::{derive_did_id, verify_did_binding, IdentityKeypair, PublicIdentity};
pub use service::{signing_input, EmergencySignal, IdentityService, SignedPayload};
