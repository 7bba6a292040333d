//! Castwire CLI: drive publish / play sessions against a signaling server.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use castwire_client::{
    ClientConfig, ClientEvent, ClientEventKind, FailureReason, LogLevel, NegotiationState, Resolution, Role,
    RtcEngineFactory, SessionClient,
};
use castwire_common::Error;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "castwire")]
#[command(about = "Castwire signaling test client")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a stream and negotiate a data channel
    Publish(SessionArgs),

    /// Play an existing stream
    Play(SessionArgs),

    /// Publish, then play the same stream once the publisher is up
    Loopback {
        #[command(flatten)]
        session: SessionArgs,

        /// Delay between the publisher opening and the player connecting
        #[arg(long, default_value_t = 3000)]
        player_delay_ms: u64,
    },

    /// Show version information
    Version,
}

#[derive(clap::Args, Debug, Clone)]
struct SessionArgs {
    /// Signaling endpoint (ws:// or wss://)
    #[arg(short, long, env = "CASTWIRE_SIGNALING_URL")]
    url: Option<String>,

    /// Stream id shared by publisher and player
    #[arg(short, long, env = "CASTWIRE_STREAM_ID")]
    stream_id: Option<String>,

    /// Video preset (2160p, 1440p, 1080p, 720p, 480p, 360p, 240p)
    #[arg(short, long)]
    resolution: Option<Resolution>,

    /// Negotiate audio as well
    #[arg(long)]
    audio: bool,

    /// Do not negotiate video
    #[arg(long)]
    no_video: bool,

    /// ICE server URL; repeat for more than one
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Send this text on the data channel, suffixed with a counter
    #[arg(long)]
    send: Option<String>,

    /// How often to send
    #[arg(long, value_enum, default_value_t = SendInterval::OneSecond)]
    interval: SendInterval,

    /// JSON client config; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum SendInterval {
    #[value(name = "100ms")]
    HundredMillis,
    #[value(name = "1s")]
    OneSecond,
    #[value(name = "5s")]
    FiveSeconds,
    #[value(name = "10s")]
    TenSeconds,
}

impl SendInterval {
    fn period(self) -> Duration {
        match self {
            SendInterval::HundredMillis => Duration::from_millis(100),
            SendInterval::OneSecond => Duration::from_secs(1),
            SendInterval::FiveSeconds => Duration::from_secs(5),
            SendInterval::TenSeconds => Duration::from_secs(10),
        }
    }
}

fn load_config(args: &SessionArgs) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::from_env()?,
    };
    if let Some(url) = &args.url {
        config.signaling_url = url.trim().to_string();
    }
    if let Some(stream_id) = &args.stream_id {
        config.stream_id = stream_id.trim().to_string();
    }
    if let Some(preset) = args.resolution {
        let (width, height, bitrate) = preset.dimensions();
        config.media.width = width;
        config.media.height = height;
        config.media.bitrate = bitrate;
    }
    if args.audio {
        config.media.audio = true;
    }
    if args.no_video {
        config.media.video = false;
    }
    if !args.ice_servers.is_empty() {
        config.ice_servers = args.ice_servers.clone();
    }
    if config.signaling_url.is_empty() {
        bail!("no signaling url: pass --url or set CASTWIRE_SIGNALING_URL");
    }
    Ok(config)
}

/// Periodic "text (n)" payloads for the data channel.
struct DataTicker {
    text: String,
    sent: u64,
    interval: tokio::time::Interval,
}

impl DataTicker {
    fn new(text: Option<String>, every: SendInterval) -> Option<Self> {
        let text = text?;
        let mut interval = tokio::time::interval(every.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Some(Self {
            text,
            sent: 0,
            interval,
        })
    }

    fn send(&mut self, client: &mut SessionClient) {
        if client.state() != NegotiationState::DataReady {
            return;
        }
        let payload = format!("{} ({})", self.text, self.sent + 1);
        match client.send_data(payload.clone()) {
            Ok(()) => {
                self.sent += 1;
                info!("sent \"{}\"", payload);
            }
            Err(e) => warn!("send failed: {}", e),
        }
    }
}

async fn tick(ticker: &mut Option<DataTicker>) {
    match ticker {
        Some(t) => {
            t.interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_event(client: &mut Option<SessionClient>) -> Option<ClientEvent> {
    match client {
        Some(c) => c.next_event().await,
        None => std::future::pending().await,
    }
}

fn report(event: &ClientEvent) -> Option<FailureReason> {
    let prefix = format!("[{} {}]", event.role, event.session_id);
    match (&event.kind, event.level()) {
        (ClientEventKind::StateChanged { .. }, _) => debug!("{} {}", prefix, event),
        (_, LogLevel::Log) => info!("{} {}", prefix, event),
        (_, LogLevel::Warning) => warn!("{} {}", prefix, event),
        (_, LogLevel::Error) => error!("{} {}", prefix, event),
    }
    match &event.kind {
        ClientEventKind::Failed(reason) => Some(reason.clone()),
        _ => None,
    }
}

enum Step {
    Event(Option<ClientEvent>),
    Tick,
    Interrupted,
}

async fn run_session(role: Role, config: ClientConfig, args: &SessionArgs) -> Result<()> {
    let mut client = SessionClient::new(config.clone(), Arc::new(RtcEngineFactory));
    client.connect(role, &config.signaling_url, &config.stream_id, config.media)?;
    let mut ticker = DataTicker::new(args.send.clone(), args.interval);
    let mut failure = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        let step = tokio::select! {
            _ = &mut ctrl_c => Step::Interrupted,
            event = client.next_event() => Step::Event(event),
            _ = tick(&mut ticker) => Step::Tick,
        };
        match step {
            Step::Interrupted => {
                info!("interrupted, closing {} session", role);
                break;
            }
            Step::Event(Some(event)) => {
                if let Some(reason) = report(&event) {
                    failure = Some(reason);
                }
            }
            Step::Event(None) => break,
            Step::Tick => {
                if let Some(t) = ticker.as_mut() {
                    t.send(&mut client);
                }
            }
        }
    }

    client.close();
    for event in client.take_events() {
        report(&event);
    }
    match failure {
        Some(reason) => {
            Err::<(), _>(Error::from(reason)).with_context(|| format!("{role} session failed"))
        }
        None => Ok(()),
    }
}

enum LoopbackStep {
    Publisher(Option<ClientEvent>),
    Player(Option<ClientEvent>),
    StartPlayer,
    Tick,
    Interrupted,
}

async fn run_loopback(config: ClientConfig, args: &SessionArgs, player_delay: Duration) -> Result<()> {
    let factory = Arc::new(RtcEngineFactory);
    let mut publisher = Some(SessionClient::new(config.clone(), factory.clone()));
    let mut player: Option<SessionClient> = None;
    let mut player_at: Option<Instant> = None;
    let mut ticker = DataTicker::new(args.send.clone(), args.interval);
    let mut failure = None;

    if let Some(p) = publisher.as_mut() {
        p.connect(
            Role::Publisher,
            &config.signaling_url,
            &config.stream_id,
            config.media,
        )?;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        let wait_for_player = player_at.is_some() && player.is_none();
        let deadline = player_at.unwrap_or_else(Instant::now);
        let step = tokio::select! {
            _ = &mut ctrl_c => LoopbackStep::Interrupted,
            event = next_event(&mut publisher) => LoopbackStep::Publisher(event),
            event = next_event(&mut player) => LoopbackStep::Player(event),
            _ = tokio::time::sleep_until(deadline), if wait_for_player => LoopbackStep::StartPlayer,
            _ = tick(&mut ticker) => LoopbackStep::Tick,
        };
        match step {
            LoopbackStep::Interrupted => {
                info!("interrupted, closing loopback");
                break;
            }
            LoopbackStep::Publisher(Some(event)) => {
                if event.kind == ClientEventKind::Opened && player_at.is_none() {
                    info!("publisher open, starting player in {:?}", player_delay);
                    player_at = Some(Instant::now() + player_delay);
                }
                if let Some(reason) = report(&event) {
                    failure = Some(reason);
                }
            }
            LoopbackStep::Player(Some(event)) => {
                if let Some(reason) = report(&event) {
                    failure = Some(reason);
                }
            }
            LoopbackStep::Publisher(None) | LoopbackStep::Player(None) => break,
            LoopbackStep::StartPlayer => {
                let mut client = SessionClient::new(config.clone(), factory.clone());
                client.connect(
                    Role::Receiver,
                    &config.signaling_url,
                    &config.stream_id,
                    config.media,
                )?;
                player = Some(client);
            }
            LoopbackStep::Tick => {
                if let (Some(t), Some(p)) = (ticker.as_mut(), publisher.as_mut()) {
                    t.send(p);
                }
            }
        }
    }

    for client in [player.as_mut(), publisher.as_mut()].into_iter().flatten() {
        client.close();
        for event in client.take_events() {
            report(&event);
        }
    }
    match failure {
        Some(reason) => Err::<(), _>(Error::from(reason)).context("loopback failed"),
        None => Ok(()),
    }
}

fn main() -> Result<()> {
    castwire_common::init_tracing();

    let args = Args::parse();

    let session = match &args.command {
        Command::Version => {
            println!("castwire {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Publish(session) | Command::Play(session) => session,
        Command::Loopback { session, .. } => session,
    };
    let config = load_config(session)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        match &args.command {
            Command::Publish(session) => run_session(Role::Publisher, config, session).await,
            Command::Play(session) => run_session(Role::Receiver, config, session).await,
            Command::Loopback {
                session,
                player_delay_ms,
            } => run_loopback(config, session, Duration::from_millis(*player_delay_ms)).await,
            Command::Version => Ok(()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_publish_flags() {
        let args = Args::try_parse_from([
            "castwire",
            "publish",
            "--url",
            "wss://ams.example.com:5443/WebRTCAppEE/websocket",
            "--stream-id",
            "stream_1",
            "--resolution",
            "1080p",
            "--audio",
            "--send",
            "ping",
            "--interval",
            "100ms",
        ])
        .unwrap();
        let Command::Publish(session) = args.command else {
            panic!("expected publish");
        };
        assert_eq!(session.resolution, Some(Resolution::P1080));
        assert_eq!(session.interval, SendInterval::HundredMillis);

        let config = load_config(&session).unwrap();
        assert_eq!(config.stream_id, "stream_1");
        assert_eq!((config.media.width, config.media.height), (1920, 1080));
        assert_eq!(config.media.bitrate, 2_000_000);
        assert!(config.media.audio);
        assert!(config.media.video);
    }

    #[test]
    fn test_loopback_default_delay() {
        let args = Args::try_parse_from(["castwire", "loopback", "--url", "ws://127.0.0.1:5080/ws"])
            .unwrap();
        match args.command {
            Command::Loopback {
                player_delay_ms, ..
            } => assert_eq!(player_delay_ms, 3000),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_interval() {
        assert!(Args::try_parse_from(["castwire", "play", "--interval", "2s"]).is_err());
    }

    #[test]
    fn test_send_interval_periods() {
        assert_eq!(SendInterval::HundredMillis.period(), Duration::from_millis(100));
        assert_eq!(SendInterval::TenSeconds.period(), Duration::from_secs(10));
    }
}
