//! End-to-end session behaviour over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nexus_common::{Error, MessageDraft, MessageType, SessionDescription, SignalMessage};
use nexus_identity::IdentityService;
use nexus_p2p::{
    EventStream, MemoryTransport, PeerSessionManager, SessionConfig, SessionEvent, SessionStats,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Forward negotiation events from `from` to `to`, as an external relay would.
fn relay(from: &PeerSessionManager, to: &PeerSessionManager) -> JoinHandle<()> {
    let mut events = from.subscribe();
    let local_id = from.peer_id().expect("initialized").to_string();
    let to = to.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(signal) = event.to_signal(&local_id) {
                let _ = to.apply_signal(signal).await;
            }
        }
    })
}

async fn next_matching(
    rx: &mut EventStream,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collect events up to and including the first one matching `pred`.
async fn collect_until(
    rx: &mut EventStream,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    next_matching(rx, |event| {
        seen.push(event.clone());
        pred(event)
    })
    .await;
    seen
}

fn is_message(content: &'static str) -> impl FnMut(&SessionEvent) -> bool {
    move |event| matches!(event, SessionEvent::Message(m) if m.content == content)
}

/// Fail if a message with `content` shows up within `window`.
async fn assert_no_message(rx: &mut EventStream, content: &'static str, window: Duration) {
    let mut pred = is_message(content);
    let late = timeout(window, async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return event;
            }
        }
        std::future::pending().await
    })
    .await;
    assert!(late.is_err(), "{content:?} was delivered again: {late:?}");
}

struct Pair {
    alice: PeerSessionManager,
    bob: PeerSessionManager,
    alice_id: String,
    bob_id: String,
    _relays: [JoinHandle<()>; 2],
}

async fn initialized_pair() -> Pair {
    let transport = Arc::new(MemoryTransport::new());
    let alice = PeerSessionManager::new(transport.clone(), SessionConfig::default());
    let bob = PeerSessionManager::new(transport, SessionConfig::default());
    let alice_id = alice.initialize().await.unwrap().id;
    let bob_id = bob.initialize().await.unwrap().id;
    let relays = [relay(&alice, &bob), relay(&bob, &alice)];

    Pair {
        alice,
        bob,
        alice_id,
        bob_id,
        _relays: relays,
    }
}

async fn connected_pair() -> Pair {
    let pair = initialized_pair().await;
    let mut alice_events = pair.alice.subscribe();
    let mut bob_events = pair.bob.subscribe();

    pair.alice.initialize_peer(&pair.bob_id).await.unwrap();

    let bob_id = pair.bob_id.clone();
    next_matching(&mut alice_events, |e| {
        *e == SessionEvent::PeerConnected(bob_id.clone())
    })
    .await;
    let alice_id = pair.alice_id.clone();
    next_matching(&mut bob_events, |e| {
        *e == SessionEvent::PeerConnected(alice_id.clone())
    })
    .await;
    pair
}

#[tokio::test]
async fn test_connect_and_exchange_message() {
    let pair = connected_pair().await;

    assert!(pair.alice.is_connected());
    assert_eq!(pair.alice.consensus_count(), 1);
    assert_eq!(pair.bob.consensus_count(), 1);
    assert_eq!(pair.alice.peer_id(), Some(pair.alice_id.as_str()));

    let stats = pair.alice.stats().await.unwrap();
    assert_eq!(stats.peers, 1);
    assert_eq!(stats.open_channels, 1);
    assert_eq!(stats.connected_peers, 1);

    let mut bob_events = pair.bob.subscribe();
    let sent = pair
        .alice
        .send_message(MessageDraft::text("hi"))
        .await
        .unwrap();
    assert!(sent.signature.is_some());

    match next_matching(&mut bob_events, is_message("hi")).await {
        SessionEvent::Message(received) => {
            assert_eq!(received.sender, pair.alice_id);
            assert_eq!(received.kind, MessageType::Text);
            assert_eq!(received, sent);
        }
        other => panic!("unexpected {other:?}"),
    }

    // And the other way round over the surfaced remote channel.
    let mut alice_events = pair.alice.subscribe();
    pair.bob
        .send_message(MessageDraft::text("hello back"))
        .await
        .unwrap();
    next_matching(&mut alice_events, is_message("hello back")).await;
}

#[tokio::test]
async fn test_slow_subscriber_misses_nothing() {
    let pair = connected_pair().await;
    let mut bob_events = pair.bob.subscribe();

    for i in 0..300 {
        pair.alice
            .send_message(MessageDraft::text(format!("burst {i}")))
            .await
            .unwrap();
    }
    // Let every message land before the subscriber reads anything.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut received = Vec::new();
    timeout(WAIT, async {
        while received.len() < 300 {
            match bob_events.recv().await {
                Some(SessionEvent::Message(m)) => received.push(m.content),
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for the burst");

    let expected: Vec<String> = (0..300).map(|i| format!("burst {i}")).collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_send_without_peers_still_returns_message() {
    let pair = initialized_pair().await;
    let sent = pair
        .alice
        .send_message(MessageDraft::text("alone"))
        .await
        .unwrap();
    assert_eq!(sent.sender, pair.alice_id);
    assert_eq!(pair.alice.consensus_count(), 0);
}

#[tokio::test]
async fn test_emergency_validated_only_nearby() {
    let pair = connected_pair().await;
    pair.alice
        .identity()
        .update_location(51.5007, -0.1246, 5.0, false)
        .await
        .unwrap();

    // About 0.5 km north.
    pair.bob
        .identity()
        .update_location(51.5052, -0.1246, 5.0, false)
        .await
        .unwrap();
    let mut bob_events = pair.bob.subscribe();
    pair.alice.send_emergency_signal("help").await.unwrap();

    let seen = collect_until(&mut bob_events, is_message("help")).await;
    let validation = seen
        .iter()
        .find_map(|e| match e {
            SessionEvent::EmergencyValidation(v) => Some(v.clone()),
            _ => None,
        })
        .expect("nearby emergency should be validated");
    assert_eq!(validation.peer_id, pair.alice_id);
    assert!(validation.validation);
    assert_eq!(validation.message.kind, MessageType::Emergency);

    // About 5 km north.
    pair.bob
        .identity()
        .update_location(51.5457, -0.1246, 5.0, false)
        .await
        .unwrap();
    pair.alice.send_emergency_signal("far away").await.unwrap();

    let seen = collect_until(&mut bob_events, is_message("far away")).await;
    assert!(!seen
        .iter()
        .any(|e| matches!(e, SessionEvent::EmergencyValidation(_))));
}

#[tokio::test]
async fn test_emergency_requires_location() {
    let pair = connected_pair().await;
    assert!(matches!(
        pair.alice.send_emergency_signal("help").await,
        Err(Error::NoLocation)
    ));
}

#[tokio::test]
async fn test_time_warp_in_past_delivers_immediately() {
    let pair = connected_pair().await;
    let mut bob_events = pair.bob.subscribe();

    pair.alice
        .send_time_warp_message("already open", Utc::now() - chrono::Duration::seconds(10))
        .await
        .unwrap();
    next_matching(&mut bob_events, is_message("already open")).await;
    assert_eq!(pair.bob.stats().await.unwrap().pending_time_warps, 0);
}

#[tokio::test]
async fn test_time_warp_in_future_is_held() {
    let pair = connected_pair().await;
    let mut bob_events = pair.bob.subscribe();

    let unlock_time = Utc::now() + chrono::Duration::milliseconds(400);
    pair.alice
        .send_time_warp_message("later", unlock_time)
        .await
        .unwrap();

    timeout(WAIT, async {
        while pair.bob.stats().await.unwrap().pending_time_warps == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message never became pending");
    let pending = pair.bob.pending_time_warps().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].content, "later");

    next_matching(&mut bob_events, is_message("later")).await;
    // The wire form truncates to milliseconds.
    assert!(Utc::now() >= unlock_time - chrono::Duration::milliseconds(1));
    assert_eq!(pair.bob.stats().await.unwrap().pending_time_warps, 0);

    assert_no_message(&mut bob_events, "later", Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_time_warp_survives_disconnect() {
    let pair = connected_pair().await;
    let mut bob_events = pair.bob.subscribe();

    pair.alice
        .send_time_warp_message("after", Utc::now() + chrono::Duration::milliseconds(300))
        .await
        .unwrap();
    timeout(WAIT, async {
        while pair.bob.stats().await.unwrap().pending_time_warps == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message never became pending");

    pair.bob.disconnect().await.unwrap();
    assert_eq!(pair.bob.stats().await.unwrap().pending_time_warps, 0);

    next_matching(&mut bob_events, is_message("after")).await;
}

#[tokio::test]
async fn test_disconnect_tears_down_both_sides() {
    let pair = connected_pair().await;
    let mut alice_events = pair.alice.subscribe();
    let mut bob_events = pair.bob.subscribe();

    pair.alice.disconnect().await.unwrap();

    next_matching(&mut alice_events, |e| *e == SessionEvent::Disconnected).await;
    assert_eq!(pair.alice.consensus_count(), 0);
    assert!(!pair.alice.is_connected());
    assert_eq!(pair.alice.stats().await.unwrap(), SessionStats::default());

    let alice_id = pair.alice_id.clone();
    next_matching(&mut bob_events, |e| {
        *e == SessionEvent::PeerDisconnected(alice_id.clone())
    })
    .await;
    assert_eq!(pair.bob.consensus_count(), 0);
    assert_eq!(pair.bob.stats().await.unwrap().peers, 0);

    // Sending to nobody is not an error.
    pair.alice
        .send_message(MessageDraft::text("anyone?"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reinitialize_peer_replaces_entry() {
    let pair = connected_pair().await;
    let mut alice_events = pair.alice.subscribe();
    let mut bob_events = pair.bob.subscribe();

    pair.alice.initialize_peer(&pair.bob_id).await.unwrap();

    let bob_id = pair.bob_id.clone();
    let seen = collect_until(&mut alice_events, |e| {
        *e == SessionEvent::PeerConnected(bob_id.clone())
    })
    .await;
    assert!(seen.contains(&SessionEvent::PeerDisconnected(pair.bob_id.clone())));

    let alice_id = pair.alice_id.clone();
    next_matching(&mut bob_events, |e| {
        *e == SessionEvent::PeerConnected(alice_id.clone())
    })
    .await;

    assert_eq!(pair.alice.consensus_count(), 1);
    assert_eq!(pair.alice.stats().await.unwrap().peers, 1);
    assert_eq!(pair.bob.stats().await.unwrap().peers, 1);

    pair.alice
        .send_message(MessageDraft::text("still here"))
        .await
        .unwrap();
    next_matching(&mut bob_events, is_message("still here")).await;
}

fn standalone() -> PeerSessionManager {
    PeerSessionManager::new(Arc::new(MemoryTransport::new()), SessionConfig::default())
}

#[tokio::test]
async fn test_operations_before_initialize() {
    let manager = standalone();

    assert_eq!(manager.peer_id(), None);
    assert!(matches!(
        manager.initialize_peer("did:quantum:0011223344556677").await,
        Err(Error::NotInitialized)
    ));
    assert!(matches!(
        manager.send_message(MessageDraft::text("hi")).await,
        Err(Error::NotInitialized)
    ));
}

#[tokio::test]
async fn test_initialize_peer_rejects_self() {
    let manager = standalone();
    let did = manager.initialize().await.unwrap();

    assert!(matches!(
        manager.initialize_peer(&did.id).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.initialize_peer("").await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_offer_with_mismatched_did_is_rejected() {
    let manager = standalone();
    manager.initialize().await.unwrap();

    let stranger = IdentityService::new();
    let stranger_did = stranger.initialize().await.unwrap();

    let result = manager
        .accept_offer(
            "did:quantum:ffffffffffffffff",
            SessionDescription::offer("memory-offer:unused"),
            stranger_did,
        )
        .await;
    assert!(matches!(result, Err(Error::VerificationFailure(_))));
}

#[tokio::test]
async fn test_signal_for_someone_else_is_rejected() {
    let pair = initialized_pair().await;
    let signal = SignalMessage::OFFER {
        from: pair.bob_id.clone(),
        target: "did:quantum:0000000000000000".to_string(),
        sdp: SessionDescription::offer("memory-offer:unused"),
        did: pair.bob.identity().did().await.unwrap(),
    };

    assert!(matches!(
        pair.alice.apply_signal(signal).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_answer_from_unknown_peer_is_not_found() {
    let pair = initialized_pair().await;
    let bob_did = pair.bob.identity().did().await.unwrap();

    let result = pair
        .alice
        .accept_answer(
            &pair.bob_id,
            SessionDescription::answer("memory-answer:unused"),
            bob_did,
        )
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}
