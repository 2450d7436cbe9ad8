//! WebRTC transport backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use nexus_common::{Error, IceCandidate, Result, SdpType, SessionDescription};
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    DataChannel, DataChannelOptions, PeerConnection, Transport, TransportEvent, TransportSink,
};
use crate::config::SessionConfig;

fn rtc_err(e: webrtc::Error) -> Error {
    Error::transport(e)
}

/// Creates real peer connections through STUN/TURN.
pub struct WebRtcTransport {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcTransport {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(rtc_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice_servers })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        Self::new(config.ice_servers.clone())
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn connect(
        &self,
        remote_id: &str,
        sink: TransportSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(rtc_err)?);

        let negotiation_sink = sink.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let sink = negotiation_sink.clone();
            Box::pin(async move {
                sink.emit(TransportEvent::NegotiationNeeded);
            })
        }));

        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(TransportEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => debug!(%e, "failed to serialize local candidate"),
                }
            })
        }));

        let channel_sink = sink.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let sink = channel_sink.clone();
            Box::pin(async move {
                info!(label = channel.label(), remote_id = sink.remote_id(), "remote data channel");
                attach_channel_handlers(&channel, &sink);
                sink.emit(TransportEvent::DataChannel(Arc::new(WebRtcChannel { channel })));
            })
        }));

        debug!(remote_id, link = %sink.link(), "webrtc connection created");
        Ok(Arc::new(WebRtcConnection { pc, sink }))
    }
}

fn attach_channel_handlers(channel: &Arc<RTCDataChannel>, sink: &TransportSink) {
    let open_sink = sink.clone();
    channel.on_open(Box::new(move || {
        let sink = open_sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::ChannelOpen);
        })
    }));

    let message_sink = sink.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = message_sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::ChannelMessage(msg.data));
        })
    }));

    let close_sink = sink.clone();
    channel.on_close(Box::new(move || {
        let sink = close_sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::ChannelClosed);
        })
    }));
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    sink: TransportSink,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_data_channel(
        &self,
        options: &DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_retransmits: options.max_retransmits,
            ..Default::default()
        };
        let channel = self
            .pc
            .create_data_channel(&options.label, Some(init))
            .await
            .map_err(rtc_err)?;
        attach_channel_handlers(&channel, &self.sink);
        Ok(Arc::new(WebRtcChannel { channel }))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpType::Offer {
            return Err(Error::transport("expected an offer"));
        }
        let remote = RTCSessionDescription::offer(offer.sdp).map_err(rtc_err)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(rtc_err)?;

        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        if answer.kind != SdpType::Answer {
            return Err(Error::transport("expected an answer"));
        }
        let remote = RTCSessionDescription::answer(answer.sdp).map_err(rtc_err)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(rtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(rtc_err)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(rtc_err)
    }
}

struct WebRtcChannel {
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.channel
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(rtc_err)
    }

    async fn close(&self) -> Result<()> {
        self.channel.close().await.map_err(rtc_err)
    }
}
