//! Single-flight initialization and cross-service verification.

use std::collections::HashSet;
use std::sync::Arc;

use nexus_identity::{verify_did_binding, IdentityService};

/// Many concurrent first calls must agree on one identity.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_initialize_creates_one_identity() {
    let service = Arc::new(IdentityService::new());

    let mut handles = Vec::new();
    for _ in 0..32 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move { service.initialize().await.unwrap() }));
    }

    let mut ids = HashSet::new();
    let mut keys = HashSet::new();
    for handle in handles {
        let did = handle.await.unwrap();
        ids.insert(did.id);
        keys.insert(did.public_key);
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(keys.len(), 1);
    assert_eq!(service.did_id().unwrap(), ids.into_iter().next().unwrap());
}

/// A second service verifies what the first one signed, using only the
/// public DID.
#[tokio::test]
async fn test_remote_verification_with_published_did() {
    let alice = IdentityService::new();
    let bob = IdentityService::new();
    let alice_did = alice.initialize().await.unwrap();
    bob.initialize().await.unwrap();

    assert!(verify_did_binding(&alice_did).is_ok());

    let signed = alice.sign_message("meet at the fountain").unwrap();
    assert!(bob
        .verify_message(
            "meet at the fountain",
            &signed.signature,
            signed.timestamp,
            &alice_did.public_key
        )
        .unwrap());

    let bob_did = bob.did().await.unwrap();
    assert!(!bob
        .verify_message(
            "meet at the fountain",
            &signed.signature,
            signed.timestamp,
            &bob_did.public_key
        )
        .unwrap());
}
