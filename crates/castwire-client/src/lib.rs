//! Castwire client: signaling over WebSocket and offer/answer negotiation
//! against a pluggable peer-connection engine.
//!
//! A [`SessionClient`] runs one publish or play session at a time. The
//! [`PeerEngine`] trait is the only seam to the WebRTC stack; the default
//! `webrtc-engine` feature provides [`RtcEngineFactory`].

#![forbid(unsafe_code)]

pub mod engine;
pub mod events;
pub mod negotiation;
#[cfg(feature = "webrtc-engine")]
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod types;

pub use engine::{
    DataChannel, EngineConfig, EngineError, EngineEvent, EngineEventSink, IceCandidate,
    PeerConnectionState, PeerEngine, PeerEngineFactory, SdpKind, SessionDescription, StepOutcome,
    TrackKind,
};
pub use events::{ClientEvent, ClientEventKind, LogLevel};
pub use negotiation::{FailureReason, NegotiationState, NegotiationStep, SessionInput};
#[cfg(feature = "webrtc-engine")]
pub use rtc::{RtcEngine, RtcEngineFactory};
pub use session::SessionClient;
pub use signaling::{validate_signaling_url, ChannelEvent, ChannelState};
pub use types::{
    validate_stream_id, ClientConfig, MediaParams, Resolution, Role, SessionTag,
    DEFAULT_DATA_CHANNEL_LABEL, DEFAULT_STREAM_ID, DEFAULT_STUN_SERVER,
};
