use bytes::Bytes;
use castwire_common::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::{EngineConfig, EngineHandle, PeerEngineFactory};
use crate::events::ClientEvent;
use crate::negotiation::{InputReceiver, InputSender, NegotiationState, Negotiator, SessionInput};
use crate::signaling::{validate_signaling_url, ChannelState, SignalingChannel};
use crate::types::{validate_stream_id, ClientConfig, MediaParams, Role, SessionTag};

/// One role's view of the signaling server: owns at most one live session.
///
/// Socket and engine tasks post into a single queue; nothing touches session
/// state until [`SessionClient::update`] or [`SessionClient::next_event`]
/// drains it, so all transitions happen on the caller's task.
pub struct SessionClient {
    config: ClientConfig,
    factory: Arc<dyn PeerEngineFactory>,
    inputs_tx: InputSender,
    inputs_rx: InputReceiver,
    epoch: u64,
    session: Option<Negotiator>,
    events: VecDeque<ClientEvent>,
}

impl SessionClient {
    pub fn new(config: ClientConfig, factory: Arc<dyn PeerEngineFactory>) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        Self {
            config,
            factory,
            inputs_tx,
            inputs_rx,
            epoch: 0,
            session: None,
            events: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Starts a new session. Must be called from within a tokio runtime.
    ///
    /// Fails with `AlreadyConnected` until the previous session is `Closed`,
    /// including after it has failed.
    pub fn connect(
        &mut self,
        role: Role,
        endpoint: &str,
        session_id: &str,
        media: MediaParams,
    ) -> Result<()> {
        match self.session.as_ref().map(|s| s.state()) {
            None | Some(NegotiationState::Closed) => {}
            Some(_) => return Err(Error::AlreadyConnected),
        }
        validate_stream_id(session_id)?;
        validate_signaling_url(endpoint)?;
        tokio::runtime::Handle::try_current()
            .map_err(|_| Error::internal("connect requires a running tokio runtime"))?;

        self.epoch += 1;
        let tag = SessionTag {
            session_id: session_id.to_string(),
            epoch: self.epoch,
        };
        info!("{} connecting {} to {}", role, tag, endpoint);

        let channel = SignalingChannel::open(endpoint, tag.clone(), self.inputs_tx.clone())?;
        let engine = EngineHandle::spawn(
            self.factory.clone(),
            EngineConfig {
                role,
                ice_servers: self.config.ice_servers.clone(),
                media,
            },
            tag.clone(),
            self.inputs_tx.clone(),
        );
        let negotiator = Negotiator::new(
            tag,
            role,
            media,
            self.config.data_channel_label.clone(),
            channel,
            engine,
        );
        self.session = Some(negotiator);
        self.collect_events();
        Ok(())
    }

    /// Tears down the live session, if any. Safe to call repeatedly.
    pub fn close(&mut self) -> bool {
        let closed = match self.session.as_mut() {
            Some(session) => session.close(),
            None => false,
        };
        self.collect_events();
        closed
    }

    /// Applies every input queued so far without waiting. Returns how many
    /// were applied to the live session.
    pub fn update(&mut self) -> usize {
        let mut applied = 0;
        while let Ok((tag, input)) = self.inputs_rx.try_recv() {
            if self.apply(tag, input) {
                applied += 1;
            }
        }
        applied
    }

    /// Waits for the next event, processing queued inputs as needed.
    /// Returns `None` once the session is finished and its events are drained.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            let live = self
                .session
                .as_ref()
                .map(|s| !s.state().is_terminal())
                .unwrap_or(false);
            if !live {
                return None;
            }
            let (tag, input) = self.inputs_rx.recv().await?;
            self.apply(tag, input);
        }
    }

    /// Queues application data. Only valid in `DataReady`.
    pub fn send_data(&mut self, data: impl Into<Bytes>) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::NotReady)?;
        let result = session.send_data(data.into());
        self.collect_events();
        result
    }

    pub fn state(&self) -> NegotiationState {
        self.session
            .as_ref()
            .map(|s| s.state().clone())
            .unwrap_or(NegotiationState::Idle)
    }

    pub fn channel_state(&self) -> Option<ChannelState> {
        self.session.as_ref().map(|s| s.channel_state())
    }

    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.role())
    }

    pub fn session_tag(&self) -> Option<&SessionTag> {
        self.session.as_ref().map(|s| s.tag())
    }

    /// Drains events gathered by `update`, `connect` and `close`.
    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    fn apply(&mut self, tag: SessionTag, input: SessionInput) -> bool {
        let Some(session) = self.session.as_mut() else {
            debug!("no session, discarding input for {}", tag);
            return false;
        };
        if session.tag() != &tag {
            debug!("discarding stale input for {} (live {})", tag, session.tag());
            return false;
        }
        session.handle(input);
        self.collect_events();
        true
    }

    fn collect_events(&mut self) {
        if let Some(session) = self.session.as_mut() {
            self.events.extend(session.take_events());
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        DataChannel, EngineError, EngineEventSink, IceCandidate, PeerEngine, SessionDescription,
    };
    use crate::events::ClientEventKind;
    use crate::negotiation::FailureReason;
    use crate::signaling::ChannelEvent;
    use async_trait::async_trait;
    use tokio::time::{timeout, Duration};

    struct IdleEngine;

    #[async_trait]
    impl PeerEngine for IdleEngine {
        async fn create_offer(&self) -> std::result::Result<SessionDescription, EngineError> {
            Ok(SessionDescription::offer("v=0"))
        }
        async fn create_answer(&self) -> std::result::Result<SessionDescription, EngineError> {
            Ok(SessionDescription::answer("v=0"))
        }
        async fn set_local_description(
            &self,
            _desc: SessionDescription,
        ) -> std::result::Result<(), EngineError> {
            Ok(())
        }
        async fn set_remote_description(
            &self,
            _desc: SessionDescription,
        ) -> std::result::Result<(), EngineError> {
            Ok(())
        }
        async fn add_ice_candidate(
            &self,
            _candidate: IceCandidate,
        ) -> std::result::Result<(), EngineError> {
            Ok(())
        }
        async fn open_data_channel(
            &self,
            label: &str,
        ) -> std::result::Result<DataChannel, EngineError> {
            Ok(DataChannel::new(label))
        }
        async fn send(
            &self,
            _channel: &DataChannel,
            _data: Bytes,
        ) -> std::result::Result<(), EngineError> {
            Ok(())
        }
        async fn close(&self) -> std::result::Result<(), EngineError> {
            Ok(())
        }
    }

    struct IdleFactory;

    #[async_trait]
    impl PeerEngineFactory for IdleFactory {
        async fn create(
            &self,
            _config: EngineConfig,
            _events: EngineEventSink,
        ) -> std::result::Result<Box<dyn PeerEngine>, EngineError> {
            Ok(Box::new(IdleEngine))
        }
    }

    fn client() -> SessionClient {
        SessionClient::new(ClientConfig::default(), Arc::new(IdleFactory))
    }

    /// An address nothing listens on.
    async fn refused_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}/WebRTCAppEE/websocket")
    }

    #[tokio::test]
    async fn test_connect_twice_is_already_connected() {
        let mut client = client();
        let endpoint = refused_endpoint().await;
        client
            .connect(Role::Publisher, &endpoint, "WebRTCTest", MediaParams::default())
            .unwrap();
        assert_eq!(client.state(), NegotiationState::ChannelConnecting);
        assert!(matches!(
            client.connect(Role::Publisher, &endpoint, "WebRTCTest", MediaParams::default()),
            Err(Error::AlreadyConnected)
        ));
        assert_eq!(client.session_tag().map(|t| t.epoch), Some(1));

        assert!(client.close());
        assert!(!client.close());
        client
            .connect(Role::Receiver, &endpoint, "WebRTCTest", MediaParams::default())
            .unwrap();
        assert_eq!(client.session_tag().map(|t| t.epoch), Some(2));
        assert_eq!(client.role(), Some(Role::Receiver));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_arguments() {
        let mut client = client();
        assert!(matches!(
            client.connect(
                Role::Publisher,
                "ws://127.0.0.1:5080/ws",
                "bad id",
                MediaParams::default()
            ),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            client.connect(
                Role::Publisher,
                "http://127.0.0.1:5080/ws",
                "WebRTCTest",
                MediaParams::default()
            ),
            Err(Error::Config(_))
        ));
        assert_eq!(client.state(), NegotiationState::Idle);
        assert!(client.take_events().is_empty());
    }

    #[test]
    fn test_connect_outside_runtime_fails() {
        let mut client = client();
        assert!(matches!(
            client.connect(
                Role::Publisher,
                "ws://127.0.0.1:5080/ws",
                "WebRTCTest",
                MediaParams::default()
            ),
            Err(Error::Internal(_))
        ));
        assert_eq!(client.state(), NegotiationState::Idle);
    }

    #[test]
    fn test_send_data_without_session_is_not_ready() {
        let mut client = client();
        assert!(matches!(
            client.send_data(Bytes::from_static(b"hello")),
            Err(Error::NotReady)
        ));
        assert_eq!(client.update(), 0);
    }

    #[tokio::test]
    async fn test_stale_inputs_are_discarded() {
        let mut client = client();
        let endpoint = refused_endpoint().await;
        client
            .connect(Role::Publisher, &endpoint, "WebRTCTest", MediaParams::default())
            .unwrap();
        let old_tag = client.session_tag().cloned().unwrap();
        client.close();
        client
            .connect(Role::Publisher, &endpoint, "WebRTCTest", MediaParams::default())
            .unwrap();
        let _ = client.take_events();

        assert!(!client.apply(old_tag.clone(), SessionInput::Channel(ChannelEvent::Opened)));
        assert_eq!(client.state(), NegotiationState::ChannelConnecting);
        assert!(client.take_events().is_empty());

        let live_tag = client.session_tag().cloned().unwrap();
        assert_ne!(live_tag, old_tag);
        assert!(client.apply(
            live_tag,
            SessionInput::Channel(ChannelEvent::TransportError("reset".into()))
        ));
        assert!(matches!(
            client.state(),
            NegotiationState::Failed(FailureReason::Transport(_))
        ));
        assert!(matches!(
            client.connect(Role::Publisher, &endpoint, "WebRTCTest", MediaParams::default()),
            Err(Error::AlreadyConnected)
        ));
        assert!(matches!(
            client.state(),
            NegotiationState::Failed(FailureReason::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_fails_session() {
        let mut client = client();
        let endpoint = refused_endpoint().await;
        client
            .connect(Role::Receiver, &endpoint, "WebRTCTest", MediaParams::default())
            .unwrap();

        let events = timeout(Duration::from_secs(10), async {
            let mut seen = Vec::new();
            while let Some(event) = client.next_event().await {
                seen.push(event);
            }
            seen
        })
        .await
        .expect("session did not fail");

        assert!(events
            .iter()
            .any(|e| matches!(e.kind, ClientEventKind::Failed(FailureReason::Transport(_)))));
        assert!(matches!(
            client.state(),
            NegotiationState::Failed(FailureReason::Transport(_))
        ));

        // A failed session still has to be closed before reconnecting.
        assert!(matches!(
            client.connect(Role::Receiver, &endpoint, "WebRTCTest", MediaParams::default()),
            Err(Error::AlreadyConnected)
        ));
        assert!(client.close());
        assert_eq!(client.state(), NegotiationState::Closed);
        client
            .connect(Role::Receiver, &endpoint, "WebRTCTest", MediaParams::default())
            .unwrap();
        assert_eq!(client.session_tag().map(|t| t.epoch), Some(2));
    }
}
