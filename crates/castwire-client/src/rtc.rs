//! [`PeerEngine`] backed by the `webrtc` crate.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::engine::{
    DataChannel, EngineConfig, EngineError, EngineEventSink, IceCandidate, PeerConnectionState,
    PeerEngine, PeerEngineFactory, SdpKind, SessionDescription, TrackKind,
};
use crate::types::Role;

type ChannelMap = Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>;

/// Builds an [`RtcEngine`] per session.
#[derive(Debug, Default, Clone)]
pub struct RtcEngineFactory;

#[async_trait]
impl PeerEngineFactory for RtcEngineFactory {
    async fn create(
        &self,
        config: EngineConfig,
        events: EngineEventSink,
    ) -> Result<Box<dyn PeerEngine>, EngineError> {
        Ok(Box::new(RtcEngine::new(config, events).await?))
    }
}

pub struct RtcEngine {
    pc: Arc<RTCPeerConnection>,
    channels: ChannelMap,
    events: EngineEventSink,
}

impl RtcEngine {
    pub async fn new(config: EngineConfig, events: EngineEventSink) -> Result<Self, EngineError> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()
            .map_err(|e| EngineError::new("register_default_codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut m)
            .map_err(|e| EngineError::new("register_default_interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| EngineError::new("new_peer_connection", e))?,
        );

        if config.role == Role::Publisher {
            let kinds = [
                (config.media.video, RTPCodecType::Video),
                (config.media.audio, RTPCodecType::Audio),
            ];
            for (_, kind) in kinds.into_iter().filter(|(wanted, _)| *wanted) {
                pc.add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| EngineError::new("add_transceiver", e))?;
            }
            info!(
                "publisher transceivers: video={} audio={} ({}x{} @ {} bps)",
                config.media.video,
                config.media.audio,
                config.media.width,
                config.media.height,
                config.media.bitrate
            );
        }

        let channels: ChannelMap = Arc::new(Mutex::new(HashMap::new()));
        install_callbacks(&pc, &events, &channels);

        Ok(Self {
            pc,
            channels,
            events,
        })
    }
}

fn install_callbacks(pc: &Arc<RTCPeerConnection>, events: &EngineEventSink, channels: &ChannelMap) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = c else {
                debug!("ice gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.local_candidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                    sdp_mid: init.sdp_mid.unwrap_or_default(),
                }),
                Err(e) => warn!("failed to serialize local candidate: {}", e),
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            let state = match s {
                RTCPeerConnectionState::New => PeerConnectionState::New,
                RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
                RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
                _ => return,
            };
            sink.connection_state(state);
        })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let sink = sink.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                other => {
                    debug!("ignoring remote track of kind {:?}", other);
                    return;
                }
            };
            info!("remote {:?} track {}", kind, track.id());
            sink.remote_track(kind);
        })
    }));

    // The answering side receives the offerer's data channel here.
    let sink = events.clone();
    let map = channels.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let sink = sink.clone();
        let map = map.clone();
        Box::pin(async move {
            info!("remote data channel `{}` announced", dc.label());
            map.lock().await.insert(dc.label().to_string(), dc.clone());
            watch_data_channel(&dc, &sink);
        })
    }));
}

fn watch_data_channel(dc: &Arc<RTCDataChannel>, sink: &EngineEventSink) {
    let label = dc.label().to_string();

    let on_open = sink.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        let sink = on_open.clone();
        let label = open_label.clone();
        Box::pin(async move {
            sink.data_channel_open(DataChannel::new(label));
        })
    }));

    let on_message = sink.clone();
    let message_label = label.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = on_message.clone();
        let label = message_label.clone();
        Box::pin(async move {
            sink.data_channel_message(DataChannel::new(label), msg.data);
        })
    }));

    let on_close = sink.clone();
    dc.on_close(Box::new(move || {
        let sink = on_close.clone();
        let label = label.clone();
        Box::pin(async move {
            sink.data_channel_closed(DataChannel::new(label));
        })
    }));
}

fn to_rtc(desc: SessionDescription, operation: &str) -> Result<RTCSessionDescription, EngineError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| EngineError::new(operation, e))
}

#[async_trait]
impl PeerEngine for RtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::new("create_offer", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::new("create_answer", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let desc = to_rtc(desc, "set_local_description")?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| EngineError::new("set_local_description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let desc = to_rtc(desc, "set_remote_description")?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| EngineError::new("set_remote_description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: Some(candidate.sdp_mid),
                sdp_mline_index: Some(candidate.sdp_mline_index),
                username_fragment: None,
            })
            .await
            .map_err(|e| EngineError::new("add_ice_candidate", e))
    }

    async fn open_data_channel(&self, label: &str) -> Result<DataChannel, EngineError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| EngineError::new("create_data_channel", e))?;
        watch_data_channel(&dc, &self.events);
        self.channels.lock().await.insert(label.to_string(), dc);
        Ok(DataChannel::new(label))
    }

    async fn send(&self, channel: &DataChannel, data: Bytes) -> Result<(), EngineError> {
        let dc = self
            .channels
            .lock()
            .await
            .get(channel.label())
            .cloned()
            .ok_or_else(|| {
                EngineError::new("send", format!("unknown data channel `{}`", channel.label()))
            })?;
        dc.send(&data)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::new("send", e))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.channels.lock().await.clear();
        self.pc
            .close()
            .await
            .map_err(|e| EngineError::new("close", e))
    }
}
