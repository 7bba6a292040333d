//! WebSocket signaling channel.
//!
//! The socket lives on its own task. Everything it observes is decoded there
//! and pushed, in receipt order, onto the owning session's input queue as a
//! [`ChannelEvent`]; the session applies those events one at a time.

use castwire_common::helpers::{env_bool, prefix_lines};
use castwire_common::{protocol, Error, Result, SignalingMessage};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use crate::negotiation::{InputSender, SessionInput};
use crate::types::SessionTag;

/// What the socket task reports to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Message(SignalingMessage),
    /// An inbound frame that is not a known signaling message. The channel stays open.
    ProtocolError(String),
    Closed,
    TransportError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriterCommand {
    Frame(String),
    Close,
}

/// Session-side handle of a signaling connection.
///
/// State only changes when the session applies a [`ChannelEvent`] (see
/// [`SignalingChannel::observe`]) or calls [`SignalingChannel::close`], so it
/// always agrees with what the session has seen.
pub struct SignalingChannel {
    url: String,
    state: ChannelState,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
    task: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Validates `url` and starts connecting on the current tokio runtime.
    pub(crate) fn open(url: &str, tag: SessionTag, inputs: InputSender) -> Result<Self> {
        validate_signaling_url(url)?;
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        info!("connecting to signaling endpoint {} for {}", url, tag);
        let task = tokio::spawn(run_socket(url.to_string(), tag, inputs, writer_rx));
        Ok(Self {
            url: url.to_string(),
            state: ChannelState::Connecting,
            writer: Some(writer_tx),
            task: Some(task),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Queues a message for the wire. Fails with `NotConnected` unless open.
    pub fn send(&self, msg: &SignalingMessage) -> Result<()> {
        if self.state != ChannelState::Open {
            return Err(Error::NotConnected);
        }
        let writer = self.writer.as_ref().ok_or(Error::NotConnected)?;
        let text = protocol::encode(msg)?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            let pretty = serde_json::to_string_pretty(msg).unwrap_or_else(|_| text.clone());
            debug!("signaling send:\n{}", prefix_lines(&pretty, "> "));
        }
        writer
            .send(WriterCommand::Frame(text))
            .map_err(|_| Error::NotConnected)
    }

    /// Releases the socket. Safe at any point, including before `Opened`.
    /// Returns `false` if the channel was already closed by this call earlier.
    pub fn close(&mut self) -> bool {
        let previous = self.state;
        self.state = ChannelState::Closed;
        let writer = self.writer.take();
        let task = self.task.take();
        if writer.is_none() && task.is_none() {
            return false;
        }

        // Only an open socket gets a close frame; a pending connect is aborted.
        let graceful = previous == ChannelState::Open
            && writer
                .map(|w| w.send(WriterCommand::Close).is_ok())
                .unwrap_or(false);
        if let Some(task) = task {
            if !graceful {
                task.abort();
            }
        }
        true
    }

    /// Applies the state change an inbound event implies.
    pub(crate) fn observe(&mut self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Opened if self.state == ChannelState::Connecting => {
                self.state = ChannelState::Open;
            }
            ChannelEvent::Closed | ChannelEvent::TransportError(_) => {
                self.state = ChannelState::Closed;
                self.writer = None;
                self.task = None;
            }
            _ => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<WriterCommand>) {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        (
            Self {
                url: String::new(),
                state: ChannelState::Connecting,
                writer: Some(writer_tx),
                task: None,
            },
            writer_rx,
        )
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_insecure_signaling_url(url: &Url) -> bool {
    url.scheme() == "ws"
}

/// Accepts `ws://` and `wss://` endpoints. Plain `ws://` is refused in
/// production unless `CASTWIRE_ALLOW_INSECURE_SIGNALING` is set.
pub fn validate_signaling_url(url: &str) -> Result<()> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(Error::config("signaling url is empty"));
    }
    let parsed =
        Url::parse(trimmed).map_err(|e| Error::config(format!("invalid signaling url: {e}")))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(Error::config(format!(
            "signaling url must use ws:// or wss://, got {}://",
            parsed.scheme()
        )));
    }

    let production = env_bool("CASTWIRE_ENVIRONMENT_PRODUCTION", false)
        || std::env::var("CASTWIRE_ENVIRONMENT")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);
    let allow_insecure = env_bool("CASTWIRE_ALLOW_INSECURE_SIGNALING", false);
    if is_insecure_signaling_url(&parsed) && production && !allow_insecure {
        return Err(Error::config(
            "refusing insecure ws:// signaling url in production; use wss:// or set CASTWIRE_ALLOW_INSECURE_SIGNALING=1",
        ));
    }
    Ok(())
}

fn decode_frame(text: &str) -> ChannelEvent {
    match protocol::decode(text) {
        Ok(msg) => ChannelEvent::Message(msg),
        Err(err) => {
            warn!("failed to parse signaling message: {}", err);
            ChannelEvent::ProtocolError(err.to_string())
        }
    }
}

async fn run_socket(
    url: String,
    tag: SessionTag,
    inputs: InputSender,
    mut writer_rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let emit = |event: ChannelEvent| {
        if inputs
            .send((tag.clone(), SessionInput::Channel(event)))
            .is_err()
        {
            debug!("signaling event for {} dropped: client gone", tag);
        }
    };

    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            warn!("signaling connect to {} failed: {}", url, e);
            emit(ChannelEvent::TransportError(e.to_string()));
            return;
        }
    };
    info!("connected to signaling endpoint {}", url);
    emit(ChannelEvent::Opened);

    let (mut write, mut read) = ws_stream.split();
    loop {
        tokio::select! {
            command = writer_rx.recv() => match command {
                Some(WriterCommand::Frame(text)) => {
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        warn!("signaling send failed: {}", e);
                        emit(ChannelEvent::TransportError(e.to_string()));
                        return;
                    }
                }
                Some(WriterCommand::Close) | None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    let _ = write.close().await;
                    debug!("signaling socket for {} closed locally", tag);
                    return;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    debug!("signaling recv:\n{}", prefix_lines(text.as_str(), "< "));
                    emit(decode_frame(text.as_str()));
                }
                Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => emit(decode_frame(text)),
                    Err(_) => emit(ChannelEvent::ProtocolError(
                        "binary signaling frame is not utf-8".to_string(),
                    )),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("signaling endpoint {} closed the connection", url);
                    emit(ChannelEvent::Closed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("signaling websocket error: {}", e);
                    emit(ChannelEvent::TransportError(e.to_string()));
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(rx: &mut mpsc::UnboundedReceiver<WriterCommand>) -> Vec<WriterCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    #[test]
    fn test_send_before_open_is_not_connected() {
        let (channel, mut rx) = SignalingChannel::detached();
        let msg = SignalingMessage::Play {
            session_id: "s1".into(),
            video: false,
            audio: false,
        };
        assert!(matches!(channel.send(&msg), Err(Error::NotConnected)));
        assert!(frames(&mut rx).is_empty());
    }

    #[test]
    fn test_send_after_open_writes_frame() {
        let (mut channel, mut rx) = SignalingChannel::detached();
        channel.observe(&ChannelEvent::Opened);
        assert_eq!(channel.state(), ChannelState::Open);
        channel
            .send(&SignalingMessage::Play {
                session_id: "s1".into(),
                video: false,
                audio: false,
            })
            .unwrap();
        assert_eq!(
            frames(&mut rx),
            vec![WriterCommand::Frame(
                r#"{"command":"play","streamId":"s1","video":false,"audio":false}"#.to_string()
            )]
        );
    }

    #[test]
    fn test_protocol_error_keeps_channel_open() {
        let (mut channel, _rx) = SignalingChannel::detached();
        channel.observe(&ChannelEvent::Opened);
        channel.observe(&decode_frame("{not json"));
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(matches!(decode_frame("{not json"), ChannelEvent::ProtocolError(_)));
    }

    #[test]
    fn test_send_after_closed_is_not_connected() {
        let (mut channel, _rx) = SignalingChannel::detached();
        channel.observe(&ChannelEvent::Opened);
        channel.observe(&ChannelEvent::TransportError("reset".into()));
        assert_eq!(channel.state(), ChannelState::Closed);
        let msg = SignalingMessage::Stop {
            session_id: "s1".into(),
            video: false,
            audio: false,
        };
        assert!(matches!(channel.send(&msg), Err(Error::NotConnected)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut channel, mut rx) = SignalingChannel::detached();
        channel.observe(&ChannelEvent::Opened);
        assert!(channel.close());
        assert_eq!(frames(&mut rx), vec![WriterCommand::Close]);
        assert!(!channel.close());
        assert!(frames(&mut rx).is_empty());
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_close_before_open() {
        let (mut channel, _rx) = SignalingChannel::detached();
        assert!(channel.close());
        assert_eq!(channel.state(), ChannelState::Closed);
        channel.observe(&ChannelEvent::Opened);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_validate_signaling_url() {
        assert!(validate_signaling_url("wss://ams.example.com:5443/WebRTCAppEE/websocket").is_ok());
        assert!(validate_signaling_url("ws://127.0.0.1:5080/WebRTCAppEE/websocket").is_ok());
        assert!(validate_signaling_url("").is_err());
        assert!(validate_signaling_url("https://ams.example.com").is_err());
        assert!(validate_signaling_url("not a url").is_err());
    }
}
