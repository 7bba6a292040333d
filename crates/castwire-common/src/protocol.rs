//! Signaling wire protocol.
//!
//! Every message is one JSON object keyed by `command`. Fields that a command
//! does not use are omitted from the wire, never sent as `null`:
//!
//! ```text
//! { "command": "publish" | "play" | "stop", "streamId": "s", "video": true, "audio": false }
//! { "command": "start", "streamId": "s" }
//! { "command": "takeConfiguration", "streamId": "s", "type": "offer" | "answer", "sdp": "..." }
//! { "command": "takeCandidate", "streamId": "s", "candidate": "...", "label": 0, "id": "0" }
//! { "command": "error", "definition": "..." }
//! { "command": "notification", "definition": "...", "streamId": "s" }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const COMMAND_PUBLISH: &str = "publish";
pub const COMMAND_PLAY: &str = "play";
pub const COMMAND_STOP: &str = "stop";
pub const COMMAND_START: &str = "start";
pub const COMMAND_TAKE_CONFIGURATION: &str = "takeConfiguration";
pub const COMMAND_TAKE_CANDIDATE: &str = "takeCandidate";
pub const COMMAND_ERROR: &str = "error";
pub const COMMAND_NOTIFICATION: &str = "notification";

const SDP_TYPE_OFFER: &str = "offer";
const SDP_TYPE_ANSWER: &str = "answer";

/// A signaling message exchanged with the media server.
///
/// `session_id` is the caller-supplied stream id; it is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum SignalingMessage {
    /// Server is ready for the publisher's offer.
    Start { session_id: String },
    /// Request to publish a stream.
    Publish {
        session_id: String,
        video: bool,
        audio: bool,
    },
    /// Request to play a stream.
    Play {
        session_id: String,
        video: bool,
        audio: bool,
    },
    Offer { session_id: String, sdp: String },
    Answer { session_id: String, sdp: String },
    IceCandidate {
        session_id: String,
        candidate: String,
        sdp_mline_index: u16,
        sdp_mid: String,
    },
    Stop {
        session_id: String,
        video: bool,
        audio: bool,
    },
    /// Server-reported failure.
    Error { detail: String },
    /// Informational server event (`publish_started`, `play_finished`, ...).
    Notification {
        session_id: Option<String>,
        definition: String,
    },
}

impl SignalingMessage {
    /// The wire `command` this message is sent as.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Start { .. } => COMMAND_START,
            Self::Publish { .. } => COMMAND_PUBLISH,
            Self::Play { .. } => COMMAND_PLAY,
            Self::Offer { .. } | Self::Answer { .. } => COMMAND_TAKE_CONFIGURATION,
            Self::IceCandidate { .. } => COMMAND_TAKE_CANDIDATE,
            Self::Stop { .. } => COMMAND_STOP,
            Self::Error { .. } => COMMAND_ERROR,
            Self::Notification { .. } => COMMAND_NOTIFICATION,
        }
    }

    /// The stream id this message refers to, if the command carries one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Start { session_id }
            | Self::Publish { session_id, .. }
            | Self::Play { session_id, .. }
            | Self::Offer { session_id, .. }
            | Self::Answer { session_id, .. }
            | Self::IceCandidate { session_id, .. }
            | Self::Stop { session_id, .. } => Some(session_id),
            Self::Notification { session_id, .. } => session_id.as_deref(),
            Self::Error { .. } => None,
        }
    }
}

/// Flat wire shape shared by all commands.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    sdp_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    definition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<bool>,
}

fn required<T>(value: Option<T>, command: &str, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::protocol(format!("`{command}` is missing `{field}`")))
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = Error;

    fn try_from(wire: WireMessage) -> Result<Self> {
        let command = wire.command.as_str();
        let stream_id = || required(wire.stream_id.clone(), command, "streamId");

        match command {
            COMMAND_START => Ok(Self::Start {
                session_id: stream_id()?,
            }),
            COMMAND_PUBLISH => Ok(Self::Publish {
                session_id: stream_id()?,
                video: wire.video.unwrap_or(false),
                audio: wire.audio.unwrap_or(false),
            }),
            COMMAND_PLAY => Ok(Self::Play {
                session_id: stream_id()?,
                video: wire.video.unwrap_or(false),
                audio: wire.audio.unwrap_or(false),
            }),
            COMMAND_STOP => Ok(Self::Stop {
                session_id: stream_id()?,
                video: wire.video.unwrap_or(false),
                audio: wire.audio.unwrap_or(false),
            }),
            COMMAND_TAKE_CONFIGURATION => {
                let session_id = stream_id()?;
                let sdp = required(wire.sdp.clone(), command, "sdp")?;
                match required(wire.sdp_type.as_deref(), command, "type")? {
                    SDP_TYPE_OFFER => Ok(Self::Offer { session_id, sdp }),
                    SDP_TYPE_ANSWER => Ok(Self::Answer { session_id, sdp }),
                    other => Err(Error::protocol(format!(
                        "unsupported description type `{other}`"
                    ))),
                }
            }
            COMMAND_TAKE_CANDIDATE => Ok(Self::IceCandidate {
                session_id: stream_id()?,
                candidate: required(wire.candidate.clone(), command, "candidate")?,
                sdp_mline_index: required(wire.label, command, "label")?,
                sdp_mid: required(wire.id.clone(), command, "id")?,
            }),
            COMMAND_ERROR => Ok(Self::Error {
                detail: wire.definition.clone().unwrap_or_default(),
            }),
            COMMAND_NOTIFICATION => Ok(Self::Notification {
                session_id: wire.stream_id.clone(),
                definition: wire.definition.clone().unwrap_or_default(),
            }),
            other => Err(Error::protocol(format!("unknown command `{other}`"))),
        }
    }
}

impl From<SignalingMessage> for WireMessage {
    fn from(msg: SignalingMessage) -> Self {
        let command = msg.command().to_string();
        match msg {
            SignalingMessage::Start { session_id } => Self {
                command,
                stream_id: Some(session_id),
                ..Default::default()
            },
            SignalingMessage::Publish {
                session_id,
                video,
                audio,
            }
            | SignalingMessage::Play {
                session_id,
                video,
                audio,
            }
            | SignalingMessage::Stop {
                session_id,
                video,
                audio,
            } => Self {
                command,
                stream_id: Some(session_id),
                video: Some(video),
                audio: Some(audio),
                ..Default::default()
            },
            SignalingMessage::Offer { session_id, sdp } => Self {
                command,
                stream_id: Some(session_id),
                sdp_type: Some(SDP_TYPE_OFFER.to_string()),
                sdp: Some(sdp),
                ..Default::default()
            },
            SignalingMessage::Answer { session_id, sdp } => Self {
                command,
                stream_id: Some(session_id),
                sdp_type: Some(SDP_TYPE_ANSWER.to_string()),
                sdp: Some(sdp),
                ..Default::default()
            },
            SignalingMessage::IceCandidate {
                session_id,
                candidate,
                sdp_mline_index,
                sdp_mid,
            } => Self {
                command,
                stream_id: Some(session_id),
                candidate: Some(candidate),
                label: Some(sdp_mline_index),
                id: Some(sdp_mid),
                ..Default::default()
            },
            SignalingMessage::Error { detail } => Self {
                command,
                definition: Some(detail),
                ..Default::default()
            },
            SignalingMessage::Notification {
                session_id,
                definition,
            } => Self {
                command,
                stream_id: session_id,
                definition: Some(definition),
                ..Default::default()
            },
        }
    }
}

/// Encodes a message as a compact JSON text frame.
pub fn encode(msg: &SignalingMessage) -> Result<String> {
    serde_json::to_string(msg).map_err(Error::serialization)
}

/// Decodes a JSON text frame. Anything that is not a known command is a protocol error.
pub fn decode(text: &str) -> Result<SignalingMessage> {
    serde_json::from_str(text).map_err(Error::protocol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn wire(msg: &SignalingMessage) -> Value {
        serde_json::from_str(&encode(msg).unwrap()).unwrap()
    }

    #[test]
    fn test_publish_wire_shape() {
        let msg = SignalingMessage::Publish {
            session_id: "WebRTCTest".into(),
            video: true,
            audio: false,
        };
        assert_eq!(
            wire(&msg),
            json!({"command": "publish", "streamId": "WebRTCTest", "video": true, "audio": false})
        );
    }

    #[test]
    fn test_play_and_stop_carry_media_flags() {
        let msg = SignalingMessage::Play {
            session_id: "WebRTCTest".into(),
            video: false,
            audio: false,
        };
        assert_eq!(
            wire(&msg),
            json!({"command": "play", "streamId": "WebRTCTest", "video": false, "audio": false})
        );

        let msg = SignalingMessage::Stop {
            session_id: "WebRTCTest".into(),
            video: true,
            audio: false,
        };
        assert_eq!(
            wire(&msg),
            json!({"command": "stop", "streamId": "WebRTCTest", "video": true, "audio": false})
        );
    }

    #[test]
    fn test_unused_fields_are_omitted() {
        let text = encode(&SignalingMessage::Start {
            session_id: "s1".into(),
        })
        .unwrap();
        assert_eq!(text, r#"{"command":"start","streamId":"s1"}"#);
        assert!(!text.contains("null"));

        let text = encode(&SignalingMessage::Error {
            detail: "no_stream_exist".into(),
        })
        .unwrap();
        assert_eq!(text, r#"{"command":"error","definition":"no_stream_exist"}"#);
    }

    #[test]
    fn test_description_wire_shape() {
        let msg = SignalingMessage::Offer {
            session_id: "s1".into(),
            sdp: "v=0".into(),
        };
        assert_eq!(
            wire(&msg),
            json!({"command": "takeConfiguration", "streamId": "s1", "type": "offer", "sdp": "v=0"})
        );
    }

    #[test]
    fn test_candidate_wire_shape() {
        let msg = SignalingMessage::IceCandidate {
            session_id: "s1".into(),
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mline_index: 1,
            sdp_mid: "1".into(),
        };
        assert_eq!(
            wire(&msg),
            json!({
                "command": "takeCandidate",
                "streamId": "s1",
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
                "label": 1,
                "id": "1"
            })
        );
    }

    #[test]
    fn test_every_variant_survives_a_round_trip() {
        let messages = vec![
            SignalingMessage::Start {
                session_id: "a".into(),
            },
            SignalingMessage::Publish {
                session_id: "a".into(),
                video: false,
                audio: true,
            },
            SignalingMessage::Play {
                session_id: "a".into(),
                video: true,
                audio: false,
            },
            SignalingMessage::Offer {
                session_id: "a".into(),
                sdp: "v=0\r\n".into(),
            },
            SignalingMessage::Answer {
                session_id: "a".into(),
                sdp: "v=0\r\n".into(),
            },
            SignalingMessage::IceCandidate {
                session_id: "a".into(),
                candidate: "candidate:0".into(),
                sdp_mline_index: 0,
                sdp_mid: "0".into(),
            },
            SignalingMessage::Stop {
                session_id: "a".into(),
                video: false,
                audio: false,
            },
            SignalingMessage::Error {
                detail: "boom".into(),
            },
            SignalingMessage::Notification {
                session_id: None,
                definition: "publish_started".into(),
            },
        ];
        for msg in messages {
            let text = encode(&msg).unwrap();
            assert_eq!(decode(&text).unwrap(), msg, "{text}");
        }
    }

    #[test]
    fn test_decode_accepts_server_frames_with_extra_fields() {
        let msg = decode(
            r#"{"command":"takeConfiguration","streamId":"s1","type":"answer","sdp":"v=0","token":"","room":null}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SignalingMessage::Answer {
                session_id: "s1".into(),
                sdp: "v=0".into()
            }
        );
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(matches!(decode("not json"), Err(Error::Protocol(_))));
        assert!(matches!(decode("{}"), Err(Error::Protocol(_))));
        assert!(matches!(
            decode(r#"{"command":"dance","streamId":"s1"}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            decode(r#"{"command":"takeConfiguration","streamId":"s1","type":"pranswer","sdp":"x"}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            decode(r#"{"command":"takeCandidate","streamId":"s1","candidate":"c"}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            decode(r#"{"command":"start"}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_session_id_accessor() {
        let start = SignalingMessage::Start {
            session_id: "s9".into(),
        };
        assert_eq!(start.session_id(), Some("s9"));
        assert_eq!(start.command(), COMMAND_START);
        let err = SignalingMessage::Error {
            detail: String::new(),
        };
        assert_eq!(err.session_id(), None);
    }
}
