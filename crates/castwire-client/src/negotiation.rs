//! Offer/answer negotiation for a single session.
//!
//! A [`Negotiator`] is only ever mutated through [`Negotiator::handle`] and
//! [`Negotiator::close`], one input at a time, by the session client that
//! drains the ordered input queue. Asynchronous engine work is tracked as an
//! outstanding step and resumed when its [`StepOutcome`] comes back.

use bytes::Bytes;
use castwire_common::helpers::sdp_preview;
use castwire_common::{Error, Result, SignalingMessage};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::{
    DataChannel, EngineCommand, EngineError, EngineEvent, EngineHandle, IceCandidate,
    PeerConnectionState, SdpKind, SessionDescription, StepOutcome,
};
use crate::events::{ClientEvent, ClientEventKind, LogLevel};
use crate::signaling::{ChannelEvent, ChannelState, SignalingChannel};
use crate::types::{MediaParams, Role, SessionTag};

pub(crate) type InputSender = mpsc::UnboundedSender<(SessionTag, SessionInput)>;
pub(crate) type InputReceiver = mpsc::UnboundedReceiver<(SessionTag, SessionInput)>;

/// Everything that can advance a session, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Channel(ChannelEvent),
    Engine(EngineEvent),
    Step(StepOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Transport(String),
    Protocol(String),
    Engine(EngineError),
    /// The server sent `error` or stopped the stream.
    Remote(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Transport(detail) => write!(f, "transport error: {detail}"),
            FailureReason::Protocol(detail) => write!(f, "protocol error: {detail}"),
            FailureReason::Engine(err) => write!(f, "engine error: {err}"),
            FailureReason::Remote(detail) => write!(f, "remote error: {detail}"),
        }
    }
}

impl From<FailureReason> for Error {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::Transport(detail) => Error::transport(detail),
            FailureReason::Protocol(detail) => Error::protocol(detail),
            FailureReason::Engine(err) => err.into(),
            FailureReason::Remote(detail) => Error::Protocol(format!("remote: {detail}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    SendingOffer,
    AwaitingOffer,
    AwaitingAnswer,
    ApplyingRemote,
    SendingAnswer,
    AwaitingDataChannel,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationStep::SendingOffer => "sending_offer",
            NegotiationStep::AwaitingOffer => "awaiting_offer",
            NegotiationStep::AwaitingAnswer => "awaiting_answer",
            NegotiationStep::ApplyingRemote => "applying_remote",
            NegotiationStep::SendingAnswer => "sending_answer",
            NegotiationStep::AwaitingDataChannel => "awaiting_data_channel",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    ChannelConnecting,
    ChannelOpen,
    AwaitingStart,
    Negotiating(NegotiationStep),
    DataReady,
    Closing,
    Closed,
    Failed(FailureReason),
}

impl NegotiationState {
    /// No further negotiation happens in these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationState::Closing | NegotiationState::Closed | NegotiationState::Failed(_)
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "idle"),
            NegotiationState::ChannelConnecting => write!(f, "channel_connecting"),
            NegotiationState::ChannelOpen => write!(f, "channel_open"),
            NegotiationState::AwaitingStart => write!(f, "awaiting_start"),
            NegotiationState::Negotiating(step) => write!(f, "negotiating({step})"),
            NegotiationState::DataReady => write!(f, "data_ready"),
            NegotiationState::Closing => write!(f, "closing"),
            NegotiationState::Closed => write!(f, "closed"),
            NegotiationState::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

/// Description work handed to the engine and not yet completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingStep {
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
}

impl fmt::Display for PendingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingStep::CreateOffer => write!(f, "create_offer"),
            PendingStep::CreateAnswer => write!(f, "create_answer"),
            PendingStep::SetLocal => write!(f, "set_local_description"),
            PendingStep::SetRemote => write!(f, "set_remote_description"),
        }
    }
}

/// State machine for one connect/close cycle.
pub struct Negotiator {
    tag: SessionTag,
    role: Role,
    media: MediaParams,
    data_channel_label: String,
    state: NegotiationState,
    channel: SignalingChannel,
    engine: EngineHandle,
    outstanding: Option<PendingStep>,
    local_description: Option<SessionDescription>,
    local_applied: bool,
    remote_applied: bool,
    data_channel: Option<DataChannel>,
    pending_candidates: VecDeque<IceCandidate>,
    events: Vec<ClientEvent>,
    closed: bool,
}

impl Negotiator {
    /// Takes ownership of an already-opening channel and a spawned engine worker.
    pub(crate) fn new(
        tag: SessionTag,
        role: Role,
        media: MediaParams,
        data_channel_label: String,
        channel: SignalingChannel,
        engine: EngineHandle,
    ) -> Self {
        let mut negotiator = Self {
            tag,
            role,
            media,
            data_channel_label,
            state: NegotiationState::Idle,
            channel,
            engine,
            outstanding: None,
            local_description: None,
            local_applied: false,
            remote_applied: false,
            data_channel: None,
            pending_candidates: VecDeque::new(),
            events: Vec::new(),
            closed: false,
        };
        negotiator.transition(NegotiationState::ChannelConnecting);
        negotiator
    }

    pub fn tag(&self) -> &SessionTag {
        &self.tag
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub(crate) fn take_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    /// Applies one input from the session's queue.
    pub(crate) fn handle(&mut self, input: SessionInput) {
        if self.closed {
            debug!("{}: input after close ignored: {:?}", self.tag, input);
            return;
        }
        match input {
            SessionInput::Channel(event) => {
                self.channel.observe(&event);
                if self.ignore_in_terminal("signaling event") {
                    return;
                }
                self.on_channel_event(event);
            }
            SessionInput::Engine(event) => {
                if self.ignore_in_terminal("engine event") {
                    return;
                }
                self.on_engine_event(event);
            }
            SessionInput::Step(outcome) => {
                if self.ignore_in_terminal("engine step") {
                    return;
                }
                self.on_step(outcome);
            }
        }
    }

    /// Sends application data on the open data channel.
    pub(crate) fn send_data(&mut self, data: Bytes) -> Result<()> {
        if self.state != NegotiationState::DataReady {
            return Err(Error::NotReady);
        }
        let channel = self.data_channel.clone().ok_or(Error::NotReady)?;
        debug!("{}: send {} bytes on {}", self.tag, data.len(), channel.label());
        if !self.engine.submit(EngineCommand::Send { channel, data }) {
            return Err(Error::internal("engine worker stopped"));
        }
        Ok(())
    }

    /// Tears the session down. Returns `false` if it was already closed.
    pub(crate) fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        let failed = matches!(self.state, NegotiationState::Failed(_));
        self.transition(NegotiationState::Closing);
        if !failed && self.channel.state() == ChannelState::Open {
            let stop = SignalingMessage::Stop {
                session_id: self.tag.session_id.clone(),
                video: self.media.video,
                audio: self.media.audio,
            };
            match self.channel.send(&stop) {
                Ok(()) => self.log("Send Stop Command", self.tag.session_id.clone()),
                Err(err) => debug!("{}: stop not sent: {}", self.tag, err),
            }
        }

        let dropped = self.pending_candidates.len();
        if dropped > 0 {
            debug!("{}: discarding {} queued candidates", self.tag, dropped);
        }
        self.pending_candidates.clear();
        self.outstanding = None;
        self.local_description = None;
        self.data_channel = None;
        self.engine.shutdown();
        self.channel.close();

        self.transition(NegotiationState::Closed);
        self.push(ClientEventKind::Closed);
        info!("{} {} closed", self.role, self.tag);
        true
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => self.on_channel_open(),
            ChannelEvent::Message(msg) => self.on_message(msg),
            ChannelEvent::ProtocolError(detail) => self.fail(FailureReason::Protocol(detail)),
            ChannelEvent::Closed => {
                if self.state == NegotiationState::DataReady {
                    self.warning("Signaling OnClose", "signaling closed after negotiation");
                } else {
                    self.fail(FailureReason::Transport(
                        "signaling channel closed during negotiation".to_string(),
                    ));
                }
            }
            ChannelEvent::TransportError(detail) => self.fail(FailureReason::Transport(detail)),
        }
    }

    fn on_channel_open(&mut self) {
        if self.state != NegotiationState::ChannelConnecting {
            warn!("{}: unexpected channel open in {}", self.tag, self.state);
            return;
        }
        self.log("Signaling OnOpen", self.channel.url().to_string());
        self.push(ClientEventKind::ChannelOpened);
        self.transition(NegotiationState::ChannelOpen);

        let session_id = self.tag.session_id.clone();
        let (msg, name) = match self.role {
            Role::Publisher => (
                SignalingMessage::Publish {
                    session_id: session_id.clone(),
                    video: self.media.video,
                    audio: self.media.audio,
                },
                "Send Publish Command",
            ),
            Role::Receiver => (
                SignalingMessage::Play {
                    session_id: session_id.clone(),
                    video: self.media.video,
                    audio: self.media.audio,
                },
                "Send Play Command",
            ),
        };
        if let Err(err) = self.channel.send(&msg) {
            self.fail(FailureReason::Transport(err.to_string()));
            return;
        }
        self.log(name, session_id);
        self.transition(NegotiationState::AwaitingStart);
    }

    fn on_message(&mut self, msg: SignalingMessage) {
        if let Some(id) = msg.session_id() {
            if id != self.tag.session_id {
                warn!(
                    "{}: ignoring `{}` for stream {}",
                    self.tag,
                    msg.command(),
                    id
                );
                self.warning("Ignored message", format!("`{}` for stream {id}", msg.command()));
                return;
            }
        }

        match msg {
            SignalingMessage::Start { .. } => self.on_start(),
            SignalingMessage::Offer { sdp, .. } => {
                self.on_remote_description(SessionDescription::offer(sdp))
            }
            SignalingMessage::Answer { sdp, .. } => {
                self.on_remote_description(SessionDescription::answer(sdp))
            }
            SignalingMessage::IceCandidate {
                candidate,
                sdp_mline_index,
                sdp_mid,
                ..
            } => self.on_remote_candidate(IceCandidate {
                candidate,
                sdp_mline_index,
                sdp_mid,
            }),
            SignalingMessage::Error { detail } => self.fail(FailureReason::Remote(detail)),
            SignalingMessage::Stop { .. } => {
                self.fail(FailureReason::Remote("stream stopped by server".to_string()))
            }
            SignalingMessage::Notification { definition, .. } => {
                self.log("Signaling OnNotification", definition)
            }
            SignalingMessage::Publish { .. } | SignalingMessage::Play { .. } => {
                self.fail(FailureReason::Protocol(format!(
                    "unexpected inbound `{}` command",
                    msg.command()
                )))
            }
        }
    }

    fn on_start(&mut self) {
        self.log("Signaling OnStart", "");
        if self.state != NegotiationState::AwaitingStart {
            self.warning("Ignored start", format!("in state {}", self.state));
            return;
        }
        match self.role {
            Role::Publisher => {
                self.transition(NegotiationState::Negotiating(NegotiationStep::SendingOffer));
                let label = self.data_channel_label.clone();
                self.log("CreateDataChannel", label.clone());
                if !self.submit(EngineCommand::OpenDataChannel(label)) {
                    return;
                }
                self.log("CreateOffer()", "");
                self.begin_step(PendingStep::CreateOffer, EngineCommand::CreateOffer);
            }
            Role::Receiver => {
                self.transition(NegotiationState::Negotiating(NegotiationStep::AwaitingOffer))
            }
        }
    }

    fn on_remote_description(&mut self, desc: SessionDescription) {
        let name = match desc.kind {
            SdpKind::Offer => "Signaling OnOffer",
            SdpKind::Answer => "Signaling OnAnswer",
        };
        self.log(name, sdp_preview(&desc.sdp));

        if let Some(step) = self.outstanding {
            self.fail(FailureReason::Protocol(format!(
                "received {} while {} is outstanding",
                desc.kind, step
            )));
            return;
        }
        if self.remote_applied {
            self.fail(FailureReason::Protocol(format!(
                "received {} after the remote description was applied",
                desc.kind
            )));
            return;
        }
        let expected = match (self.role, desc.kind) {
            (Role::Receiver, SdpKind::Offer) => matches!(
                self.state,
                NegotiationState::AwaitingStart
                    | NegotiationState::Negotiating(NegotiationStep::AwaitingOffer)
            ),
            (Role::Publisher, SdpKind::Answer) => {
                self.state == NegotiationState::Negotiating(NegotiationStep::AwaitingAnswer)
            }
            _ => false,
        };
        if !expected {
            self.fail(FailureReason::Protocol(format!(
                "unexpected {} for {} in state {}",
                desc.kind, self.role, self.state
            )));
            return;
        }

        self.transition(NegotiationState::Negotiating(NegotiationStep::ApplyingRemote));
        self.log(format!("SetRemoteDescription {}", desc.kind), "");
        self.begin_step(PendingStep::SetRemote, EngineCommand::SetRemote(desc));
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_applied {
            self.log("AddIceCandidate", candidate.candidate.clone());
            self.submit(EngineCommand::AddCandidate(candidate));
        } else {
            self.pending_candidates.push_back(candidate);
            debug!(
                "{}: queued remote candidate ({} pending)",
                self.tag,
                self.pending_candidates.len()
            );
            self.log(
                "Queued IceCandidate",
                format!("{} pending", self.pending_candidates.len()),
            );
        }
    }

    fn flush_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        debug!(
            "{}: flushing {} queued candidates",
            self.tag,
            self.pending_candidates.len()
        );
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.log("AddIceCandidate", candidate.candidate.clone());
            if !self.submit(EngineCommand::AddCandidate(candidate)) {
                return;
            }
        }
    }

    fn on_step(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::EngineReady => self.log("new RTCPeerConnection", ""),
            StepOutcome::DataChannelCreated(channel) => {
                self.log("DataChannel created", channel.label().to_string())
            }
            StepOutcome::OfferCreated(desc) => {
                if self.complete_step(PendingStep::CreateOffer) {
                    self.apply_local(desc);
                }
            }
            StepOutcome::AnswerCreated(desc) => {
                if self.complete_step(PendingStep::CreateAnswer) {
                    self.apply_local(desc);
                }
            }
            StepOutcome::LocalApplied(kind) => {
                if self.complete_step(PendingStep::SetLocal) {
                    self.on_local_applied(kind);
                }
            }
            StepOutcome::RemoteApplied(kind) => {
                if self.complete_step(PendingStep::SetRemote) {
                    self.on_remote_applied(kind);
                }
            }
            StepOutcome::CandidateAdded => debug!("{}: candidate added", self.tag),
            StepOutcome::DataSent => debug!("{}: data sent", self.tag),
            StepOutcome::Failed(err) => self.fail(FailureReason::Engine(err)),
        }
    }

    fn apply_local(&mut self, desc: SessionDescription) {
        self.log(format!("Create {}", desc.kind), sdp_preview(&desc.sdp));
        self.log(format!("SetLocalDescription {}", desc.kind), "");
        self.local_description = Some(desc.clone());
        self.begin_step(PendingStep::SetLocal, EngineCommand::SetLocal(desc));
    }

    fn on_local_applied(&mut self, kind: SdpKind) {
        self.local_applied = true;
        let Some(desc) = self.local_description.take() else {
            self.fail(FailureReason::Engine(EngineError::new(
                "set_local_description",
                "no local description recorded",
            )));
            return;
        };
        let session_id = self.tag.session_id.clone();
        let msg = match kind {
            SdpKind::Offer => SignalingMessage::Offer {
                session_id,
                sdp: desc.sdp,
            },
            SdpKind::Answer => SignalingMessage::Answer {
                session_id,
                sdp: desc.sdp,
            },
        };
        if let Err(err) = self.channel.send(&msg) {
            self.fail(FailureReason::Transport(err.to_string()));
            return;
        }
        self.log(format!("Send {kind}"), "");

        match self.role {
            Role::Publisher => {
                self.transition(NegotiationState::Negotiating(NegotiationStep::AwaitingAnswer))
            }
            Role::Receiver => self.descriptions_complete(),
        }
    }

    fn on_remote_applied(&mut self, kind: SdpKind) {
        self.remote_applied = true;
        debug!("{}: remote {} applied", self.tag, kind);
        self.flush_candidates();
        if self.state.is_terminal() {
            return;
        }
        match self.role {
            Role::Publisher => self.descriptions_complete(),
            Role::Receiver => {
                self.transition(NegotiationState::Negotiating(NegotiationStep::SendingAnswer));
                self.log("CreateAnswer()", "");
                self.begin_step(PendingStep::CreateAnswer, EngineCommand::CreateAnswer);
            }
        }
    }

    fn descriptions_complete(&mut self) {
        self.log("Negotiation complete", "");
        self.push(ClientEventKind::Opened);
        if self.data_channel.is_some() {
            self.enter_data_ready();
        } else {
            self.transition(NegotiationState::Negotiating(
                NegotiationStep::AwaitingDataChannel,
            ));
        }
    }

    fn enter_data_ready(&mut self) {
        self.transition(NegotiationState::DataReady);
        self.push(ClientEventKind::DataReady);
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                self.log("OnIceCandidate", candidate.candidate.clone());
                let msg = SignalingMessage::IceCandidate {
                    session_id: self.tag.session_id.clone(),
                    candidate: candidate.candidate,
                    sdp_mline_index: candidate.sdp_mline_index,
                    sdp_mid: candidate.sdp_mid,
                };
                if let Err(err) = self.channel.send(&msg) {
                    warn!("{}: local candidate not sent: {}", self.tag, err);
                    self.warning("OnIceCandidate", format!("not sent: {err}"));
                }
            }
            EngineEvent::RemoteTrack(kind) => {
                self.log("OnTrack", format!("{kind:?}"));
                self.push(ClientEventKind::RemoteTrack(kind));
            }
            EngineEvent::DataChannelOpen(channel) => {
                self.log("DataChannel OnOpen", channel.label().to_string());
                self.data_channel = Some(channel);
                self.push(ClientEventKind::DataChannelOpen);
                if self.local_applied
                    && self.remote_applied
                    && self.state
                        == NegotiationState::Negotiating(NegotiationStep::AwaitingDataChannel)
                {
                    self.enter_data_ready();
                }
            }
            EngineEvent::DataChannelMessage { channel, data } => {
                self.log(
                    "DataChannel OnMessage",
                    format!("{}: {}", channel.label(), String::from_utf8_lossy(&data)),
                );
                self.push(ClientEventKind::DataReceived(data));
            }
            EngineEvent::DataChannelClosed(channel) => {
                self.warning("DataChannel OnClose", channel.label().to_string());
                if self.data_channel.as_ref() == Some(&channel) {
                    self.data_channel = None;
                    if self.state == NegotiationState::DataReady {
                        self.transition(NegotiationState::Negotiating(
                            NegotiationStep::AwaitingDataChannel,
                        ));
                    }
                }
            }
            EngineEvent::ConnectionState(state) => {
                self.log("OnConnectionStateChange", format!("{state:?}"));
                if state == PeerConnectionState::Failed {
                    self.fail(FailureReason::Engine(EngineError::new(
                        "peer_connection",
                        "connection failed",
                    )));
                }
            }
        }
    }

    fn begin_step(&mut self, step: PendingStep, command: EngineCommand) {
        self.outstanding = Some(step);
        self.submit(command);
    }

    fn complete_step(&mut self, step: PendingStep) -> bool {
        if self.outstanding == Some(step) {
            self.outstanding = None;
            return true;
        }
        warn!(
            "{}: {} completed but {:?} is outstanding",
            self.tag, step, self.outstanding
        );
        self.warning("Unexpected step completion", step.to_string());
        false
    }

    fn submit(&mut self, command: EngineCommand) -> bool {
        if self.engine.submit(command) {
            return true;
        }
        self.fail(FailureReason::Engine(EngineError::new(
            "engine",
            "engine worker stopped",
        )));
        false
    }

    fn ignore_in_terminal(&self, what: &str) -> bool {
        if self.state.is_terminal() {
            debug!("{}: {} ignored in {}", self.tag, what, self.state);
            return true;
        }
        false
    }

    fn fail(&mut self, reason: FailureReason) {
        if self.state.is_terminal() {
            debug!("{}: already terminal, dropping failure {}", self.tag, reason);
            return;
        }
        error!("{} {} failed: {}", self.role, self.tag, reason);
        self.outstanding = None;
        let name = match &reason {
            FailureReason::Transport(_) => "Signaling OnWSError".to_string(),
            FailureReason::Protocol(_) => "Signaling ProtocolError".to_string(),
            FailureReason::Remote(_) => "Signaling OnSignalingError".to_string(),
            FailureReason::Engine(err) => err.operation.clone(),
        };
        self.push(ClientEventKind::Log {
            level: LogLevel::Error,
            name,
            detail: reason.to_string(),
        });
        self.transition(NegotiationState::Failed(reason.clone()));
        self.push(ClientEventKind::Failed(reason));
    }

    fn transition(&mut self, to: NegotiationState) {
        let from = std::mem::replace(&mut self.state, to.clone());
        info!("{} {}: {} -> {}", self.role, self.tag, from, to);
        self.push(ClientEventKind::StateChanged { from, to });
    }

    fn log(&mut self, name: impl Into<String>, detail: impl Into<String>) {
        let (name, detail) = (name.into(), detail.into());
        debug!("{}: {} {}", self.tag, name, detail);
        self.push(ClientEventKind::Log {
            level: LogLevel::Log,
            name,
            detail,
        });
    }

    fn warning(&mut self, name: impl Into<String>, detail: impl Into<String>) {
        let (name, detail) = (name.into(), detail.into());
        warn!("{}: {} {}", self.tag, name, detail);
        self.push(ClientEventKind::Log {
            level: LogLevel::Warning,
            name,
            detail,
        });
    }

    fn push(&mut self, kind: ClientEventKind) {
        self.events
            .push(ClientEvent::new(&self.tag, self.role, kind));
    }
}
