//! In-process transport.
//!
//! Connections created from clones of the same [`MemoryTransport`] share a
//! hub. An offer is an opaque token registered in the hub; accepting it
//! links the two connections, and accepting the answer opens every data
//! channel the offerer created, surfacing the remote ends to the answerer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use nexus_common::{Error, IceCandidate, Result, SdpType, SessionDescription};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    DataChannel, DataChannelOptions, PeerConnection, Transport, TransportEvent, TransportSink,
};

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";

type Hub = Arc<Mutex<HashMap<String, Arc<ConnectionInner>>>>;

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Hub,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers created but not yet answered.
    pub async fn pending_offers(&self) -> usize {
        self.hub.lock().await.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        remote_id: &str,
        sink: TransportSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        debug!(remote_id, link = %sink.link(), "memory connection created");
        Ok(Arc::new(MemoryConnection {
            hub: Arc::clone(&self.hub),
            inner: Arc::new(ConnectionInner {
                token: Uuid::new_v4().to_string(),
                sink,
                channels: Mutex::new(Vec::new()),
                remote: Mutex::new(None),
                candidates_received: AtomicUsize::new(0),
            }),
        }))
    }
}

struct ConnectionInner {
    token: String,
    sink: TransportSink,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    remote: Mutex<Option<Weak<ConnectionInner>>>,
    candidates_received: AtomicUsize,
}

impl ConnectionInner {
    fn emit_candidate(&self) {
        self.sink.emit(TransportEvent::IceCandidate(IceCandidate {
            candidate: format!("candidate:memory 1 udp 1 {} 0 typ host", self.token),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }));
    }

    async fn remote(&self) -> Option<Arc<ConnectionInner>> {
        self.remote.lock().await.as_ref().and_then(Weak::upgrade)
    }
}

struct MemoryConnection {
    hub: Hub,
    inner: Arc<ConnectionInner>,
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    async fn create_data_channel(
        &self,
        options: &DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>> {
        let channel = Arc::new(MemoryChannel::new(&options.label, self.inner.sink.clone()));

        let mut channels = self.inner.channels.lock().await;
        let first = channels.is_empty();
        channels.push(Arc::clone(&channel));
        drop(channels);

        if first {
            self.inner.sink.emit(TransportEvent::NegotiationNeeded);
        }
        Ok(channel as Arc<dyn DataChannel>)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.hub
            .lock()
            .await
            .insert(self.inner.token.clone(), Arc::clone(&self.inner));
        self.inner.emit_candidate();
        Ok(SessionDescription::offer(format!(
            "{OFFER_PREFIX}{}",
            self.inner.token
        )))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpType::Offer {
            return Err(Error::transport("expected an offer"));
        }
        let token = offer
            .sdp
            .strip_prefix(OFFER_PREFIX)
            .ok_or_else(|| Error::transport("unrecognised offer"))?;

        let initiator = self
            .hub
            .lock()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| Error::transport(format!("no pending offer {token}")))?;

        *self.inner.remote.lock().await = Some(Arc::downgrade(&initiator));
        *initiator.remote.lock().await = Some(Arc::downgrade(&self.inner));

        self.inner.emit_candidate();
        Ok(SessionDescription::answer(format!("{ANSWER_PREFIX}{token}")))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        if answer.kind != SdpType::Answer {
            return Err(Error::transport("expected an answer"));
        }
        let token = answer
            .sdp
            .strip_prefix(ANSWER_PREFIX)
            .ok_or_else(|| Error::transport("unrecognised answer"))?;
        if token != self.inner.token {
            return Err(Error::transport("answer does not match our offer"));
        }

        let remote = self
            .inner
            .remote()
            .await
            .ok_or_else(|| Error::transport("answer arrived before the offer was accepted"))?;
        self.hub.lock().await.remove(token);

        let channels = self.inner.channels.lock().await.clone();
        for local in channels {
            let counterpart = Arc::new(MemoryChannel::new(&local.label, remote.sink.clone()));
            *local.peer.lock().await = Some(Arc::downgrade(&counterpart));
            *counterpart.peer.lock().await = Some(Arc::downgrade(&local));
            remote.channels.lock().await.push(Arc::clone(&counterpart));

            let surfaced: Arc<dyn DataChannel> = counterpart.clone();
            remote.sink.emit(TransportEvent::DataChannel(surfaced));

            local.open.store(true, Ordering::SeqCst);
            counterpart.open.store(true, Ordering::SeqCst);
            self.inner.sink.emit(TransportEvent::ChannelOpen);
            remote.sink.emit(TransportEvent::ChannelOpen);
        }

        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !candidate.candidate.starts_with("candidate:memory") {
            return Err(Error::transport("foreign ICE candidate"));
        }
        self.inner.candidates_received.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let channels = std::mem::take(&mut *self.inner.channels.lock().await);
        for channel in channels {
            channel.close().await?;
        }
        self.hub.lock().await.remove(&self.inner.token);
        Ok(())
    }
}

struct MemoryChannel {
    label: String,
    open: AtomicBool,
    sink: TransportSink,
    peer: Mutex<Option<Weak<MemoryChannel>>>,
}

impl MemoryChannel {
    fn new(label: &str, sink: TransportSink) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            sink,
            peer: Mutex::new(None),
        }
    }

    async fn peer(&self) -> Option<Arc<MemoryChannel>> {
        self.peer.lock().await.as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::transport("data channel is not open"));
        }
        let peer = self
            .peer()
            .await
            .ok_or_else(|| Error::transport("data channel has no remote end"))?;
        peer.sink
            .emit(TransportEvent::ChannelMessage(Bytes::copy_from_slice(
                text.as_bytes(),
            )));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.sink.emit(TransportEvent::ChannelClosed);
            if let Some(peer) = self.peer().await {
                if peer.open.swap(false, Ordering::SeqCst) {
                    peer.sink.emit(TransportEvent::ChannelClosed);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LinkEvent, LinkId};
    use tokio::sync::mpsc;

    fn sink(link: u64, remote: &str) -> (TransportSink, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportSink::new(LinkId(link), remote, tx), rx)
    }

    fn options() -> DataChannelOptions {
        DataChannelOptions {
            label: "messageChannel".to_string(),
            ordered: true,
            max_retransmits: Some(3),
        }
    }

    #[tokio::test]
    async fn test_negotiation_opens_both_ends() {
        let transport = MemoryTransport::new();
        let (sink_a, mut rx_a) = sink(1, "bob");
        let (sink_b, mut rx_b) = sink(2, "alice");

        let alice = transport.connect("bob", sink_a).await.unwrap();
        let bob = transport.connect("alice", sink_b).await.unwrap();

        let channel_a = alice.create_data_channel(&options()).await.unwrap();
        assert!(matches!(
            rx_a.recv().await.unwrap().event,
            TransportEvent::NegotiationNeeded
        ));

        let offer = alice.create_offer().await.unwrap();
        assert_eq!(transport.pending_offers().await, 1);
        let answer = bob.accept_offer(offer).await.unwrap();
        alice.accept_answer(answer).await.unwrap();
        assert_eq!(transport.pending_offers().await, 0);

        assert!(channel_a.is_open());

        // alice: candidate, open
        assert!(matches!(
            rx_a.recv().await.unwrap().event,
            TransportEvent::IceCandidate(_)
        ));
        assert!(matches!(
            rx_a.recv().await.unwrap().event,
            TransportEvent::ChannelOpen
        ));

        // bob: candidate, remote channel, open
        assert!(matches!(
            rx_b.recv().await.unwrap().event,
            TransportEvent::IceCandidate(_)
        ));
        let channel_b = match rx_b.recv().await.unwrap().event {
            TransportEvent::DataChannel(ch) => ch,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(channel_b.label(), "messageChannel");
        assert!(matches!(
            rx_b.recv().await.unwrap().event,
            TransportEvent::ChannelOpen
        ));

        channel_a.send_text("ping").await.unwrap();
        match rx_b.recv().await.unwrap().event {
            TransportEvent::ChannelMessage(data) => assert_eq!(&data[..], b"ping"),
            other => panic!("unexpected {other:?}"),
        }

        channel_b.close().await.unwrap();
        assert!(!channel_a.is_open());
        assert!(matches!(
            rx_a.recv().await.unwrap().event,
            TransportEvent::ChannelClosed
        ));
        assert!(channel_a.send_text("late").await.is_err());
    }

    #[tokio::test]
    async fn test_answer_without_offer_fails() {
        let transport = MemoryTransport::new();
        let (sink_a, _rx_a) = sink(1, "bob");
        let alice = transport.connect("bob", sink_a).await.unwrap();

        let bogus = SessionDescription::answer("memory-answer:unknown");
        assert!(alice.accept_answer(bogus).await.is_err());
    }
}
