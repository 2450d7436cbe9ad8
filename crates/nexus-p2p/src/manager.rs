//! Public handle to a peer session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use nexus_common::{
    Did, Error, IceCandidate, MessageDraft, MessageMetadata, MessageType, PeerMessage, Result,
    SessionDescription, SignalMessage,
};
use nexus_identity::IdentityService;
use tokio::sync::{mpsc, oneshot};

use crate::config::SessionConfig;
use crate::event_loop::{self, Command, SessionActor};
use crate::events::{EventHub, EventStream};
use crate::transport::Transport;

/// Sizes of the session's internal tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Peer entries, including ones still negotiating.
    pub peers: usize,
    pub open_channels: usize,
    /// Size of the connected-peer roster.
    pub connected_peers: usize,
    pub pending_time_warps: usize,
}

/// Values the session task publishes for synchronous readers.
#[derive(Default)]
pub(crate) struct SessionStatus {
    pub(crate) peer_id: OnceLock<String>,
    pub(crate) connected: AtomicUsize,
}

/// Handle to a peer session.
///
/// Cloning the handle is cheap; every clone talks to the same session task.
/// The task stops once the last handle is dropped.
#[derive(Clone)]
pub struct PeerSessionManager {
    commands: mpsc::UnboundedSender<Command>,
    events: EventHub,
    identity: Arc<IdentityService>,
    status: Arc<SessionStatus>,
}

impl PeerSessionManager {
    /// Create a session with a fresh identity.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self::with_identity(transport, Arc::new(IdentityService::new()), config)
    }

    /// Create a session around an existing identity service.
    pub fn with_identity(
        transport: Arc<dyn Transport>,
        identity: Arc<IdentityService>,
        config: SessionConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let events = EventHub::default();
        let status = Arc::new(SessionStatus::default());

        let actor = SessionActor::new(
            config,
            transport,
            Arc::clone(&identity),
            events.clone(),
            Arc::clone(&status),
            link_tx,
            timer_tx,
        );
        tokio::spawn(event_loop::run(actor, command_rx, link_rx, timer_rx));

        Self {
            commands: command_tx,
            events,
            identity,
            status,
        }
    }

    /// Subscribe to session events. Each subscriber sees every event
    /// emitted after it subscribed, in order, however far behind it reads.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// The identity service backing this session.
    pub fn identity(&self) -> &Arc<IdentityService> {
        &self.identity
    }

    /// Local DID id, once initialized.
    pub fn peer_id(&self) -> Option<&str> {
        self.status.peer_id.get().map(String::as_str)
    }

    /// At least one data channel is open.
    pub fn is_connected(&self) -> bool {
        self.consensus_count() > 0
    }

    /// Size of the connected-peer roster.
    pub fn consensus_count(&self) -> usize {
        self.status.connected.load(Ordering::SeqCst)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| Error::internal("session task has stopped"))?;
        rx.await
            .map_err(|_| Error::internal("session task dropped the request"))?
    }

    /// Initialize the identity and adopt its DID id as the local peer id.
    pub async fn initialize(&self) -> Result<Did> {
        self.request(|reply| Command::Initialize { reply }).await
    }

    /// Open a connection and data channel towards `remote_id`.
    ///
    /// The offer is emitted later as [`crate::SessionEvent::Offer`], once
    /// the transport asks for negotiation. Calling this again for the same
    /// peer replaces the previous entry.
    pub async fn initialize_peer(&self, remote_id: &str) -> Result<()> {
        let remote_id = remote_id.to_string();
        self.request(|reply| Command::InitializePeer { remote_id, reply })
            .await
    }

    /// Answer an offer relayed from `remote_id`.
    pub async fn accept_offer(
        &self,
        remote_id: &str,
        offer: SessionDescription,
        remote_did: Did,
    ) -> Result<()> {
        let remote_id = remote_id.to_string();
        self.request(|reply| Command::AcceptOffer {
            remote_id,
            offer,
            did: remote_did,
            reply,
        })
        .await
    }

    /// Complete negotiation with the answer relayed from `remote_id`.
    pub async fn accept_answer(
        &self,
        remote_id: &str,
        answer: SessionDescription,
        remote_did: Did,
    ) -> Result<()> {
        let remote_id = remote_id.to_string();
        self.request(|reply| Command::AcceptAnswer {
            remote_id,
            answer,
            did: remote_did,
            reply,
        })
        .await
    }

    /// Hand a relayed candidate to the connection for `remote_id`.
    pub async fn add_ice_candidate(
        &self,
        remote_id: &str,
        candidate: IceCandidate,
    ) -> Result<()> {
        let remote_id = remote_id.to_string();
        self.request(|reply| Command::AddIceCandidate {
            remote_id,
            candidate,
            reply,
        })
        .await
    }

    /// Dispatch a relay envelope addressed to this peer.
    pub async fn apply_signal(&self, signal: SignalMessage) -> Result<()> {
        if let Some(local_id) = self.peer_id() {
            if signal.target() != local_id {
                return Err(Error::invalid_argument(format!(
                    "signal addressed to {}, not {local_id}",
                    signal.target()
                )));
            }
        }

        match signal {
            SignalMessage::OFFER { from, sdp, did, .. } => self.accept_offer(&from, sdp, did).await,
            SignalMessage::ANSWER { from, sdp, did, .. } => {
                self.accept_answer(&from, sdp, did).await
            }
            SignalMessage::CANDIDATE {
                from, candidate, ..
            } => self.add_ice_candidate(&from, candidate).await,
        }
    }

    /// Sign and broadcast a message to every open channel.
    ///
    /// Returns the message as sent.
    pub async fn send_message(&self, draft: MessageDraft) -> Result<PeerMessage> {
        self.request(|reply| Command::Send { draft, reply }).await
    }

    /// Broadcast an emergency carrying the current location.
    pub async fn send_emergency_signal(&self, text: &str) -> Result<PeerMessage> {
        let emergency = self.identity.create_emergency_signal(text).await?;
        self.send_message(
            MessageDraft::new(MessageType::Emergency, text)
                .with_metadata(MessageMetadata::with_location(emergency.location)),
        )
        .await
    }

    /// Broadcast a message receivers hold back until `unlock_time`.
    pub async fn send_time_warp_message(
        &self,
        text: &str,
        unlock_time: DateTime<Utc>,
    ) -> Result<PeerMessage> {
        self.send_message(
            MessageDraft::new(MessageType::TimeWarp, text)
                .with_metadata(MessageMetadata::with_unlock_time(unlock_time)),
        )
        .await
    }

    /// Close every connection and clear all tables.
    ///
    /// Time-warp timers already armed keep running and still deliver.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Time-warp messages received but not yet unlocked.
    pub async fn pending_time_warps(&self) -> Result<Vec<PeerMessage>> {
        self.request(|reply| Command::PendingTimeWarps { reply })
            .await
    }
}
