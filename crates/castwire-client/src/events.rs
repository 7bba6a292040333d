use bytes::Bytes;
use castwire_common::helpers::now_us;
use std::fmt;

use crate::engine::TrackKind;
use crate::negotiation::{FailureReason, NegotiationState};
use crate::types::{Role, SessionTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEventKind {
    /// Step-by-step trace of the negotiation (`name: detail`).
    Log {
        level: LogLevel,
        name: String,
        detail: String,
    },
    StateChanged {
        from: NegotiationState,
        to: NegotiationState,
    },
    /// The signaling socket is up.
    ChannelOpened,
    /// Local and remote descriptions are both applied.
    Opened,
    DataChannelOpen,
    /// Application data can be sent.
    DataReady,
    DataReceived(Bytes),
    RemoteTrack(TrackKind),
    Failed(FailureReason),
    Closed,
}

/// Timestamped notification from a session, for presentation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub timestamp_us: u64,
    pub session_id: String,
    pub role: Role,
    pub kind: ClientEventKind,
}

impl ClientEvent {
    pub(crate) fn new(tag: &SessionTag, role: Role, kind: ClientEventKind) -> Self {
        Self {
            timestamp_us: now_us(),
            session_id: tag.session_id.clone(),
            role,
            kind,
        }
    }

    pub fn level(&self) -> LogLevel {
        match &self.kind {
            ClientEventKind::Log { level, .. } => *level,
            ClientEventKind::Failed(_) => LogLevel::Error,
            _ => LogLevel::Log,
        }
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ClientEventKind::Log { name, detail, .. } if detail.is_empty() => write!(f, "{name}"),
            ClientEventKind::Log { name, detail, .. } => write!(f, "{name}: {detail}"),
            ClientEventKind::StateChanged { from, to } => write!(f, "state: {from} -> {to}"),
            ClientEventKind::ChannelOpened => write!(f, "signaling open"),
            ClientEventKind::Opened => write!(f, "negotiation complete"),
            ClientEventKind::DataChannelOpen => write!(f, "data channel open"),
            ClientEventKind::DataReady => write!(f, "data ready"),
            ClientEventKind::DataReceived(data) => {
                write!(f, "data received: \"{}\"", String::from_utf8_lossy(data))
            }
            ClientEventKind::RemoteTrack(kind) => write!(f, "remote track: {kind:?}"),
            ClientEventKind::Failed(reason) => write!(f, "failed: {reason}"),
            ClientEventKind::Closed => write!(f, "closed"),
        }
    }
}
