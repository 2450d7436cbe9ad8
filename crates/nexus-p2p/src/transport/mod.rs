//! Transport capability consumed by the session manager.
//!
//! A transport provides peer connections that can negotiate (offer,
//! answer, candidates) and open reliable, ordered data channels. It does
//! not relay signaling itself. Everything the transport observes
//! asynchronously is pushed into a [`TransportSink`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use nexus_common::{IceCandidate, Result, SessionDescription};
use tokio::sync::mpsc;

pub mod memory;
#[cfg(feature = "webrtc-transport")]
pub mod webrtc;

/// Generation of a peer entry.
///
/// Every call that (re)creates the entry for a remote id gets a fresh
/// link, so late events from a replaced connection can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Data channel parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelOptions {
    pub label: String,
    pub ordered: bool,
    /// `None` means fully reliable.
    pub max_retransmits: Option<u16>,
}

/// Something the transport observed on a connection.
pub enum TransportEvent {
    /// The connection wants an offer to be created.
    NegotiationNeeded,
    /// A local candidate to hand to the relay.
    IceCandidate(IceCandidate),
    /// The remote side opened a data channel on this connection.
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage(Bytes),
    ChannelClosed,
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            TransportEvent::IceCandidate(c) => write!(f, "IceCandidate({})", c.candidate),
            TransportEvent::DataChannel(ch) => write!(f, "DataChannel({})", ch.label()),
            TransportEvent::ChannelOpen => write!(f, "ChannelOpen"),
            TransportEvent::ChannelMessage(data) => {
                write!(f, "ChannelMessage({} bytes)", data.len())
            }
            TransportEvent::ChannelClosed => write!(f, "ChannelClosed"),
        }
    }
}

/// A [`TransportEvent`] tagged with the entry it belongs to.
#[derive(Debug)]
pub struct LinkEvent {
    pub link: LinkId,
    pub remote_id: String,
    pub event: TransportEvent,
}

/// Where a connection reports its events.
#[derive(Debug, Clone)]
pub struct TransportSink {
    link: LinkId,
    remote_id: Arc<str>,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl TransportSink {
    pub fn new(link: LinkId, remote_id: &str, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            link,
            remote_id: Arc::from(remote_id),
            tx,
        }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Report an event. Silently dropped once the session is gone.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(LinkEvent {
            link: self.link,
            remote_id: self.remote_id.to_string(),
            event,
        });
    }
}

/// Factory for peer connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a fresh connection towards `remote_id`, reporting into `sink`.
    async fn connect(&self, remote_id: &str, sink: TransportSink)
        -> Result<Arc<dyn PeerConnection>>;
}

/// One negotiated (or negotiating) connection to a remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open a locally initiated data channel.
    async fn create_data_channel(
        &self,
        options: &DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Install a remote offer and return the local answer.
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    /// Install the remote answer to an offer created earlier.
    async fn accept_answer(&self, answer: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Reliable, ordered message pipe to a peer.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
