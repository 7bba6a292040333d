//! Peer-connection engine boundary.
//!
//! The negotiation code never talks to a WebRTC stack directly. It issues
//! [`EngineCommand`]s to a per-session worker task, which runs them one at a
//! time against a [`PeerEngine`] and posts each result back to the session's
//! input queue as a [`StepOutcome`]. Engine callbacks travel the same queue
//! through an [`EngineEventSink`].

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::negotiation::{InputSender, SessionInput};
use crate::types::{MediaParams, Role, SessionTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mline_index: u16,
    pub sdp_mid: String,
}

/// Handle to a data channel owned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataChannel {
    label: String,
}

impl DataChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A failed engine operation. `operation` names the call that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {message}")]
pub struct EngineError {
    pub operation: String,
    pub message: String,
}

impl EngineError {
    pub fn new(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

impl From<EngineError> for castwire_common::Error {
    fn from(err: EngineError) -> Self {
        castwire_common::Error::engine(err.operation, err.message)
    }
}

/// What an engine needs to build a peer connection for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub role: Role,
    pub ice_servers: Vec<String>,
    pub media: MediaParams,
}

/// Capabilities the negotiation drives. Implementations must not send
/// signaling traffic; they report through the [`EngineEventSink`] they were
/// created with.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), EngineError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;
    async fn open_data_channel(&self, label: &str) -> Result<DataChannel, EngineError>;
    async fn send(&self, channel: &DataChannel, data: Bytes) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

/// Builds one engine per session.
#[async_trait]
pub trait PeerEngineFactory: Send + Sync {
    async fn create(
        &self,
        config: EngineConfig,
        events: EngineEventSink,
    ) -> Result<Box<dyn PeerEngine>, EngineError>;
}

/// Callbacks raised by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(TrackKind),
    DataChannelOpen(DataChannel),
    DataChannelMessage { channel: DataChannel, data: Bytes },
    DataChannelClosed(DataChannel),
    ConnectionState(PeerConnectionState),
}

/// Where an engine reports its callbacks. Cheap to clone; safe to call from
/// any task. Events sent after the session is gone are dropped.
#[derive(Clone)]
pub struct EngineEventSink {
    tag: SessionTag,
    inputs: InputSender,
}

impl EngineEventSink {
    pub(crate) fn new(tag: SessionTag, inputs: InputSender) -> Self {
        Self { tag, inputs }
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(EngineEvent::LocalCandidate(candidate));
    }

    pub fn remote_track(&self, kind: TrackKind) {
        self.emit(EngineEvent::RemoteTrack(kind));
    }

    pub fn data_channel_open(&self, channel: DataChannel) {
        self.emit(EngineEvent::DataChannelOpen(channel));
    }

    pub fn data_channel_message(&self, channel: DataChannel, data: Bytes) {
        self.emit(EngineEvent::DataChannelMessage { channel, data });
    }

    pub fn data_channel_closed(&self, channel: DataChannel) {
        self.emit(EngineEvent::DataChannelClosed(channel));
    }

    pub fn connection_state(&self, state: PeerConnectionState) {
        self.emit(EngineEvent::ConnectionState(state));
    }

    fn emit(&self, event: EngineEvent) {
        if self
            .inputs
            .send((self.tag.clone(), SessionInput::Engine(event)))
            .is_err()
        {
            debug!("engine event for {} dropped: client gone", self.tag);
        }
    }
}

impl fmt::Debug for EngineEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEventSink")
            .field("tag", &self.tag)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EngineCommand {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    OpenDataChannel(String),
    Send { channel: DataChannel, data: Bytes },
}

/// Completion of one [`EngineCommand`], or of engine construction.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    EngineReady,
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    LocalApplied(SdpKind),
    RemoteApplied(SdpKind),
    CandidateAdded,
    DataChannelCreated(DataChannel),
    DataSent,
    Failed(EngineError),
}

/// Owning side of a session's engine worker.
pub(crate) struct EngineHandle {
    commands: Option<mpsc::UnboundedSender<EngineCommand>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl EngineHandle {
    /// Spawns the worker on the current tokio runtime.
    pub(crate) fn spawn(
        factory: Arc<dyn PeerEngineFactory>,
        config: EngineConfig,
        tag: SessionTag,
        inputs: InputSender,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(run_worker(
            factory,
            config,
            tag,
            inputs,
            commands_rx,
            shutdown_rx,
        ));
        Self {
            commands: Some(commands_tx),
            shutdown: Some(shutdown_tx),
        }
    }

    /// Queues a command. Returns `false` once the worker is shut down.
    pub(crate) fn submit(&self, command: EngineCommand) -> bool {
        match &self.commands {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Stops the worker; queued commands are discarded and the engine is closed.
    /// Returns `false` if already shut down.
    pub(crate) fn shutdown(&mut self) -> bool {
        let had_worker = self.commands.take().is_some();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        had_worker
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<EngineCommand>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        (
            Self {
                commands: Some(commands_tx),
                shutdown: None,
            },
            commands_rx,
        )
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(
    factory: Arc<dyn PeerEngineFactory>,
    config: EngineConfig,
    tag: SessionTag,
    inputs: InputSender,
    mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let post = |outcome: StepOutcome| {
        if inputs
            .send((tag.clone(), SessionInput::Step(outcome)))
            .is_err()
        {
            debug!("engine outcome for {} dropped: client gone", tag);
        }
    };

    let sink = EngineEventSink::new(tag.clone(), inputs.clone());
    let engine = tokio::select! {
        biased;
        _ = &mut shutdown => return,
        created = factory.create(config, sink) => match created {
            Ok(engine) => engine,
            Err(err) => {
                post(StepOutcome::Failed(err));
                return;
            }
        },
    };
    post(StepOutcome::EngineReady);

    loop {
        let command = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            command = commands.recv() => command,
        };
        let Some(command) = command else { break };

        let outcome = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            outcome = execute(engine.as_ref(), command) => outcome,
        };
        post(outcome);
    }

    if let Err(err) = engine.close().await {
        warn!("engine close for {} failed: {}", tag, err);
    }
    debug!("engine worker for {} stopped", tag);
}

async fn execute(engine: &dyn PeerEngine, command: EngineCommand) -> StepOutcome {
    let result = match command {
        EngineCommand::CreateOffer => engine.create_offer().await.map(StepOutcome::OfferCreated),
        EngineCommand::CreateAnswer => engine
            .create_answer()
            .await
            .map(StepOutcome::AnswerCreated),
        EngineCommand::SetLocal(desc) => {
            let kind = desc.kind;
            engine
                .set_local_description(desc)
                .await
                .map(|_| StepOutcome::LocalApplied(kind))
        }
        EngineCommand::SetRemote(desc) => {
            let kind = desc.kind;
            engine
                .set_remote_description(desc)
                .await
                .map(|_| StepOutcome::RemoteApplied(kind))
        }
        EngineCommand::AddCandidate(candidate) => engine
            .add_ice_candidate(candidate)
            .await
            .map(|_| StepOutcome::CandidateAdded),
        EngineCommand::OpenDataChannel(label) => engine
            .open_data_channel(&label)
            .await
            .map(StepOutcome::DataChannelCreated),
        EngineCommand::Send { channel, data } => engine
            .send(&channel, data)
            .await
            .map(|_| StepOutcome::DataSent),
    };
    result.unwrap_or_else(StepOutcome::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::{timeout, Duration};

    #[derive(Default)]
    struct Journal {
        calls: Mutex<Vec<String>>,
    }

    impl Journal {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    struct JournalEngine {
        journal: Arc<Journal>,
        reject_remote: bool,
    }

    #[async_trait]
    impl PeerEngine for JournalEngine {
        async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
            self.journal.record("create_offer");
            Ok(SessionDescription::offer("v=0 offer"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
            self.journal.record("create_answer");
            Ok(SessionDescription::answer("v=0 answer"))
        }
        async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
            self.journal.record(format!("set_local {}", desc.kind));
            Ok(())
        }
        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), EngineError> {
            if self.reject_remote {
                return Err(EngineError::new("set_remote_description", "bad sdp"));
            }
            self.journal.record(format!("set_remote {}", desc.kind));
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
            self.journal.record(format!("add_candidate {}", candidate.candidate));
            Ok(())
        }
        async fn open_data_channel(&self, label: &str) -> Result<DataChannel, EngineError> {
            self.journal.record(format!("open_data_channel {label}"));
            Ok(DataChannel::new(label))
        }
        async fn send(&self, channel: &DataChannel, _data: Bytes) -> Result<(), EngineError> {
            self.journal.record(format!("send {}", channel.label()));
            Ok(())
        }
        async fn close(&self) -> Result<(), EngineError> {
            self.journal.record("close");
            Ok(())
        }
    }

    struct JournalFactory {
        journal: Arc<Journal>,
        reject_remote: bool,
    }

    #[async_trait]
    impl PeerEngineFactory for JournalFactory {
        async fn create(
            &self,
            _config: EngineConfig,
            _events: EngineEventSink,
        ) -> Result<Box<dyn PeerEngine>, EngineError> {
            Ok(Box::new(JournalEngine {
                journal: self.journal.clone(),
                reject_remote: self.reject_remote,
            }))
        }
    }

    fn tag() -> SessionTag {
        SessionTag {
            session_id: "s1".into(),
            epoch: 1,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            role: Role::Publisher,
            ice_servers: vec![],
            media: MediaParams::default(),
        }
    }

    async fn next_outcome(
        rx: &mut mpsc::UnboundedReceiver<(SessionTag, SessionInput)>,
    ) -> StepOutcome {
        let (got_tag, input) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("queue closed");
        assert_eq!(got_tag, tag());
        match input {
            SessionInput::Step(outcome) => outcome,
            other => panic!("unexpected input {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_runs_commands_in_order() {
        let journal = Arc::new(Journal::default());
        let factory = Arc::new(JournalFactory {
            journal: journal.clone(),
            reject_remote: false,
        });
        let (inputs_tx, mut inputs_rx) = mpsc::unbounded_channel();
        let mut handle = EngineHandle::spawn(factory, config(), tag(), inputs_tx);

        assert!(handle.submit(EngineCommand::SetRemote(SessionDescription::answer("v=0"))));
        for n in 0..3 {
            assert!(handle.submit(EngineCommand::AddCandidate(IceCandidate {
                candidate: format!("c{n}"),
                sdp_mline_index: 0,
                sdp_mid: "0".into(),
            })));
        }

        assert_eq!(next_outcome(&mut inputs_rx).await, StepOutcome::EngineReady);
        assert_eq!(
            next_outcome(&mut inputs_rx).await,
            StepOutcome::RemoteApplied(SdpKind::Answer)
        );
        for _ in 0..3 {
            assert_eq!(next_outcome(&mut inputs_rx).await, StepOutcome::CandidateAdded);
        }

        assert!(handle.shutdown());
        assert!(!handle.shutdown());
        assert!(!handle.submit(EngineCommand::CreateOffer));

        timeout(Duration::from_secs(2), async {
            while !journal.calls.lock().unwrap().contains(&"close".to_string()) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("engine was not closed");

        let calls = journal.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "set_remote answer",
                "add_candidate c0",
                "add_candidate c1",
                "add_candidate c2",
                "close"
            ]
        );
    }

    #[tokio::test]
    async fn test_worker_reports_engine_failures() {
        let journal = Arc::new(Journal::default());
        let factory = Arc::new(JournalFactory {
            journal,
            reject_remote: true,
        });
        let (inputs_tx, mut inputs_rx) = mpsc::unbounded_channel();
        let handle = EngineHandle::spawn(factory, config(), tag(), inputs_tx);
        handle.submit(EngineCommand::SetRemote(SessionDescription::offer("v=0")));

        assert_eq!(next_outcome(&mut inputs_rx).await, StepOutcome::EngineReady);
        assert_eq!(
            next_outcome(&mut inputs_rx).await,
            StepOutcome::Failed(EngineError::new("set_remote_description", "bad sdp"))
        );
    }

    #[test]
    fn test_engine_error_converts_to_common_error() {
        let err: castwire_common::Error = EngineError::new("create_offer", "no codecs").into();
        assert_eq!(err.to_string(), "engine error in create_offer: no codecs");
    }
}
