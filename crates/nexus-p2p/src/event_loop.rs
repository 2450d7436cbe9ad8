//! The session task.
//!
//! [`run`] is spawned by [`PeerSessionManager`](crate::PeerSessionManager)
//! and owns every peer table. It multiplexes:
//!
//! 1. **Commands** from manager handles, each answered over a oneshot.
//! 2. **Link events** reported by transports through their sinks.
//! 3. **Time-warp timers** that have come due.
//!
//! The loop exits once every manager handle has been dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nexus_common::{
    Did, Error, IceCandidate, MessageDraft, MessageType, PeerMessage, Result, SessionDescription,
};
use nexus_identity::{signing_input, verify_did_binding, IdentityService, PublicIdentity};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::events::{
    AnswerSignal, CandidateSignal, EmergencyValidation, EventHub, OfferSignal, SessionEvent,
};
use crate::manager::{SessionStats, SessionStatus};
use crate::proximity::{haversine_km, is_in_proximity};
use crate::transport::{
    DataChannel, LinkEvent, LinkId, PeerConnection, Transport, TransportEvent, TransportSink,
};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Command {
    Initialize {
        reply: Reply<Did>,
    },
    InitializePeer {
        remote_id: String,
        reply: Reply<()>,
    },
    AcceptOffer {
        remote_id: String,
        offer: SessionDescription,
        did: Did,
        reply: Reply<()>,
    },
    AcceptAnswer {
        remote_id: String,
        answer: SessionDescription,
        did: Did,
        reply: Reply<()>,
    },
    AddIceCandidate {
        remote_id: String,
        candidate: IceCandidate,
        reply: Reply<()>,
    },
    Send {
        draft: MessageDraft,
        reply: Reply<PeerMessage>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Stats {
        reply: Reply<SessionStats>,
    },
    PendingTimeWarps {
        reply: Reply<Vec<PeerMessage>>,
    },
}

/// A time-warp timer that has fired.
///
/// Carries its own copy of the message so delivery survives a
/// `disconnect` clearing the pending table.
pub(crate) struct TimeWarpDue {
    key: String,
    message: PeerMessage,
}

struct PeerEntry {
    link: LinkId,
    connection: Arc<dyn PeerConnection>,
    channel: Option<Arc<dyn DataChannel>>,
    /// Key learned during the handshake; signed messages must verify under it.
    remote: Option<PublicIdentity>,
}

pub(crate) struct SessionActor {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    identity: Arc<IdentityService>,
    events: EventHub,
    status: Arc<SessionStatus>,
    local_id: Option<String>,
    peers: HashMap<String, PeerEntry>,
    connected: HashSet<String>,
    /// Held time-warp messages, reported by `pending_time_warps`.
    pending: HashMap<String, PeerMessage>,
    /// Keys whose timer has not fired yet. Outlives `disconnect`, so a
    /// message redelivered after a reconnect is never armed twice.
    armed: HashSet<String>,
    next_link: u64,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    timer_tx: mpsc::UnboundedSender<TimeWarpDue>,
}

/// Drive the session until every command sender is gone.
pub(crate) async fn run(
    mut actor: SessionActor,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut links: mpsc::UnboundedReceiver<LinkEvent>,
    mut timers: mpsc::UnboundedReceiver<TimeWarpDue>,
) {
    debug!("session event loop started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => actor.handle_command(command).await,
                None => break,
            },
            Some(event) = links.recv() => actor.handle_link_event(event).await,
            Some(due) = timers.recv() => actor.handle_time_warp_due(due),
        }
    }

    debug!("session event loop exited");
}

impl SessionActor {
    pub(crate) fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        identity: Arc<IdentityService>,
        events: EventHub,
        status: Arc<SessionStatus>,
        link_tx: mpsc::UnboundedSender<LinkEvent>,
        timer_tx: mpsc::UnboundedSender<TimeWarpDue>,
    ) -> Self {
        Self {
            config,
            transport,
            identity,
            events,
            status,
            local_id: None,
            peers: HashMap::new(),
            connected: HashSet::new(),
            pending: HashMap::new(),
            armed: HashSet::new(),
            next_link: 0,
            link_tx,
            timer_tx,
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { reply } => {
                let _ = reply.send(self.initialize().await);
            }
            Command::InitializePeer { remote_id, reply } => {
                let _ = reply.send(self.initialize_peer(&remote_id).await);
            }
            Command::AcceptOffer {
                remote_id,
                offer,
                did,
                reply,
            } => {
                let _ = reply.send(self.accept_offer(&remote_id, offer, did).await);
            }
            Command::AcceptAnswer {
                remote_id,
                answer,
                did,
                reply,
            } => {
                let _ = reply.send(self.accept_answer(&remote_id, answer, did).await);
            }
            Command::AddIceCandidate {
                remote_id,
                candidate,
                reply,
            } => {
                let _ = reply.send(self.add_ice_candidate(&remote_id, candidate).await);
            }
            Command::Send { draft, reply } => {
                let _ = reply.send(self.send(draft).await);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(Ok(()));
            }
            Command::Stats { reply } => {
                let _ = reply.send(Ok(self.stats()));
            }
            Command::PendingTimeWarps { reply } => {
                let pending = self.pending.values().cloned().collect();
                let _ = reply.send(Ok(pending));
            }
        }
    }

    async fn initialize(&mut self) -> Result<Did> {
        let did = self.identity.initialize().await?;
        if self.local_id.is_none() {
            info!(peer_id = %did.id, "session initialized");
            let _ = self.status.peer_id.set(did.id.clone());
            self.local_id = Some(did.id.clone());
        }
        Ok(did)
    }

    fn local_id(&self) -> Result<&str> {
        self.local_id.as_deref().ok_or(Error::NotInitialized)
    }

    fn check_remote_id(&self, remote_id: &str) -> Result<()> {
        let local_id = self.local_id()?;
        if remote_id.is_empty() {
            return Err(Error::invalid_argument("remote id is empty"));
        }
        if remote_id == local_id {
            return Err(Error::invalid_argument("cannot connect to self"));
        }
        Ok(())
    }

    async fn open_connection(
        &mut self,
        remote_id: &str,
    ) -> Result<(LinkId, Arc<dyn PeerConnection>)> {
        self.next_link += 1;
        let link = LinkId(self.next_link);
        let sink = TransportSink::new(link, remote_id, self.link_tx.clone());
        let connection = self.transport.connect(remote_id, sink).await?;
        Ok((link, connection))
    }

    async fn initialize_peer(&mut self, remote_id: &str) -> Result<()> {
        self.check_remote_id(remote_id)?;

        let (link, connection) = self.open_connection(remote_id).await?;
        let channel = match connection
            .create_data_channel(&self.config.channel_options())
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                close_quietly(remote_id, &connection).await;
                return Err(e);
            }
        };

        self.register(
            remote_id,
            PeerEntry {
                link,
                connection,
                channel: Some(channel),
                remote: None,
            },
        )
        .await;
        info!(remote_id, %link, "peer connection initiated");
        Ok(())
    }

    async fn accept_offer(
        &mut self,
        remote_id: &str,
        offer: SessionDescription,
        did: Did,
    ) -> Result<()> {
        self.check_remote_id(remote_id)?;
        let remote = verify_remote_did(remote_id, &did)?;

        let (link, connection) = self.open_connection(remote_id).await?;
        let answer = match connection.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                close_quietly(remote_id, &connection).await;
                return Err(e);
            }
        };

        self.register(
            remote_id,
            PeerEntry {
                link,
                connection,
                channel: None,
                remote: Some(remote),
            },
        )
        .await;

        let local_did = self.identity.did().await?;
        info!(remote_id, %link, "offer accepted");
        self.emit(SessionEvent::Answer(AnswerSignal {
            answer,
            remote_id: remote_id.to_string(),
            did: local_did,
        }));
        Ok(())
    }

    async fn accept_answer(
        &mut self,
        remote_id: &str,
        answer: SessionDescription,
        did: Did,
    ) -> Result<()> {
        let remote = verify_remote_did(remote_id, &did)?;
        let entry = self
            .peers
            .get_mut(remote_id)
            .ok_or_else(|| Error::not_found(format!("no connection to {remote_id}")))?;
        entry.remote = Some(remote);
        let connection = Arc::clone(&entry.connection);

        connection.accept_answer(answer).await?;
        debug!(remote_id, "answer applied");
        Ok(())
    }

    async fn add_ice_candidate(&mut self, remote_id: &str, candidate: IceCandidate) -> Result<()> {
        let connection = self
            .peers
            .get(remote_id)
            .map(|entry| Arc::clone(&entry.connection))
            .ok_or_else(|| Error::not_found(format!("no connection to {remote_id}")))?;
        connection.add_ice_candidate(candidate).await
    }

    async fn send(&mut self, draft: MessageDraft) -> Result<PeerMessage> {
        let sender = self.local_id()?.to_string();
        let signed = self.identity.sign_message(&draft.content)?;
        let message = PeerMessage {
            kind: draft.kind,
            content: draft.content,
            sender,
            timestamp: signed.timestamp,
            signature: Some(signed.signature),
            metadata: draft.metadata,
        };
        let wire = message.encode()?;

        let mut delivered = 0usize;
        for (remote_id, entry) in &self.peers {
            let Some(channel) = entry.channel.as_ref().filter(|c| c.is_open()) else {
                continue;
            };
            match channel.send_text(&wire).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(remote_id = %remote_id, %e, "failed to send message"),
            }
        }

        debug!(kind = ?message.kind, delivered, "message broadcast");
        Ok(message)
    }

    async fn disconnect(&mut self) {
        let peers = std::mem::take(&mut self.peers);
        for (remote_id, entry) in peers {
            teardown(&remote_id, entry).await;
        }
        self.connected.clear();
        self.pending.clear();
        self.sync_status();

        info!("session disconnected");
        self.emit(SessionEvent::Disconnected);
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            peers: self.peers.len(),
            open_channels: self
                .peers
                .values()
                .filter(|entry| entry.channel.as_ref().is_some_and(|c| c.is_open()))
                .count(),
            connected_peers: self.connected.len(),
            pending_time_warps: self.pending.len(),
        }
    }

    /// Install `entry` for `remote_id`, tearing down whatever it replaces.
    async fn register(&mut self, remote_id: &str, entry: PeerEntry) {
        if let Some(old) = self.peers.remove(remote_id) {
            info!(remote_id, old = %old.link, new = %entry.link, "replacing peer connection");
            teardown(remote_id, old).await;
            if self.connected.remove(remote_id) {
                self.sync_status();
                self.emit(SessionEvent::PeerDisconnected(remote_id.to_string()));
            }
        }
        self.peers.insert(remote_id.to_string(), entry);
    }

    // -----------------------------------------------------------------------
    // Link events
    // -----------------------------------------------------------------------

    async fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent {
            link,
            remote_id,
            event,
        } = event;

        let current = self.peers.get(&remote_id).map(|entry| entry.link);
        if current != Some(link) {
            debug!(remote_id = %remote_id, %link, ?event, "ignoring event from stale link");
            return;
        }

        match event {
            TransportEvent::NegotiationNeeded => self.send_offer(&remote_id).await,
            TransportEvent::IceCandidate(candidate) => {
                let location = self.identity.location().await.ok().flatten();
                self.emit(SessionEvent::IceCandidate(CandidateSignal {
                    candidate,
                    remote_id,
                    location,
                }));
            }
            TransportEvent::DataChannel(channel) => {
                debug!(remote_id = %remote_id, label = %channel.label(), "remote data channel");
                if let Some(entry) = self.peers.get_mut(&remote_id) {
                    entry.channel = Some(channel);
                }
            }
            TransportEvent::ChannelOpen => {
                if self.connected.insert(remote_id.clone()) {
                    self.sync_status();
                    info!(remote_id = %remote_id, "peer connected");
                    self.emit(SessionEvent::PeerConnected(remote_id));
                }
            }
            TransportEvent::ChannelMessage(data) => self.handle_inbound(&remote_id, data).await,
            TransportEvent::ChannelClosed => {
                if let Some(entry) = self.peers.remove(&remote_id) {
                    close_quietly(&remote_id, &entry.connection).await;
                }
                self.connected.remove(&remote_id);
                self.sync_status();
                info!(remote_id = %remote_id, "peer disconnected");
                self.emit(SessionEvent::PeerDisconnected(remote_id));
            }
        }
    }

    async fn send_offer(&mut self, remote_id: &str) {
        let Some(connection) = self
            .peers
            .get(remote_id)
            .map(|entry| Arc::clone(&entry.connection))
        else {
            return;
        };

        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(remote_id, %e, "failed to create offer");
                return;
            }
        };
        let did = match self.identity.did().await {
            Ok(did) => did,
            Err(e) => {
                warn!(remote_id, %e, "cannot attach identity to offer");
                return;
            }
        };

        self.emit(SessionEvent::Offer(OfferSignal {
            offer,
            remote_id: remote_id.to_string(),
            did,
        }));
    }

    async fn handle_inbound(&mut self, remote_id: &str, data: Bytes) {
        let raw = match std::str::from_utf8(&data) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(remote_id, %e, "dropping non-UTF-8 payload");
                return;
            }
        };
        let message = match PeerMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(remote_id, %e, "dropping malformed payload");
                return;
            }
        };
        if let Err(e) = self.authenticate(remote_id, &message) {
            warn!(remote_id, %e, "dropping unauthenticated message");
            return;
        }

        match message.kind {
            MessageType::Emergency => self.validate_emergency(remote_id, &message).await,
            MessageType::TimeWarp => {
                if let Some(unlock_time) = message.unlock_time().filter(|t| *t > Utc::now()) {
                    self.defer_time_warp(message, unlock_time);
                    return;
                }
            }
            _ => {}
        }

        self.emit(SessionEvent::Message(message));
    }

    /// Signed messages must come from the handshake key and name its DID
    /// as sender. Unsigned ones pass unless signatures are required.
    fn authenticate(&self, remote_id: &str, message: &PeerMessage) -> Result<()> {
        let Some(signature) = message.signature.as_deref() else {
            if self.config.require_signatures {
                return Err(Error::verification("message is unsigned"));
            }
            return Ok(());
        };

        let remote = self
            .peers
            .get(remote_id)
            .and_then(|entry| entry.remote.as_ref())
            .ok_or_else(|| Error::verification("no key known for peer"))?;

        if message.sender != remote.did_id() {
            return Err(Error::verification(format!(
                "sender {} does not own this connection",
                message.sender
            )));
        }

        let input = signing_input(&message.content, message.timestamp.timestamp_millis());
        if !remote.verify(input.as_bytes(), signature) {
            return Err(Error::verification("bad signature"));
        }
        Ok(())
    }

    async fn validate_emergency(&self, remote_id: &str, message: &PeerMessage) {
        let Some(theirs) = message.location() else {
            return;
        };
        let Ok(Some(ours)) = self.identity.location().await else {
            return;
        };

        let distance_km = haversine_km(&ours, theirs);
        if !is_in_proximity(&ours, theirs, self.config.proximity_radius_km) {
            debug!(remote_id, distance_km, "emergency out of range");
            return;
        }

        info!(remote_id, distance_km, "emergency corroborated by proximity");
        self.emit(SessionEvent::EmergencyValidation(EmergencyValidation {
            peer_id: remote_id.to_string(),
            message: message.clone(),
            validation: true,
        }));
    }

    fn defer_time_warp(&mut self, message: PeerMessage, unlock_time: DateTime<Utc>) {
        let key = message.time_warp_key();
        if !self.armed.insert(key.clone()) {
            debug!(key = %key, "time-warp message already armed");
            return;
        }

        let delay = (unlock_time - Utc::now()).to_std().unwrap_or_default();
        let due = TimeWarpDue {
            key: key.clone(),
            message: message.clone(),
        };
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(due);
        });

        debug!(key = %key, delay_ms = delay.as_millis() as u64, "time-warp message held");
        self.pending.insert(key, message);
    }

    fn handle_time_warp_due(&mut self, due: TimeWarpDue) {
        self.armed.remove(&due.key);
        self.pending.remove(&due.key);
        debug!(key = %due.key, "time-warp message unlocked");
        self.emit(SessionEvent::Message(due.message));
    }

    fn sync_status(&self) {
        self.status
            .connected
            .store(self.connected.len(), Ordering::SeqCst);
    }

    fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }
}

fn verify_remote_did(remote_id: &str, did: &Did) -> Result<PublicIdentity> {
    if did.id != remote_id {
        return Err(Error::verification(format!(
            "DID {} does not match peer {remote_id}",
            did.id
        )));
    }
    verify_did_binding(did)
}

async fn close_quietly(remote_id: &str, connection: &Arc<dyn PeerConnection>) {
    if let Err(e) = connection.close().await {
        warn!(remote_id, %e, "failed to close connection");
    }
}

async fn teardown(remote_id: &str, entry: PeerEntry) {
    if let Some(channel) = entry.channel {
        if let Err(e) = channel.close().await {
            warn!(remote_id, %e, "failed to close data channel");
        }
    }
    close_quietly(remote_id, &entry.connection).await;
}
