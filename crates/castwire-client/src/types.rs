use castwire_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_STREAM_ID: &str = "WebRTCTest";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "testDC";

/// Which side of the negotiation a session plays. Fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Sends media; creates the offer after the server's `start`.
    Publisher,
    /// Receives media; answers the server's offer.
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => write!(f, "publisher"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

/// Identifies one connect/close cycle of a client.
///
/// Inputs produced by socket and engine tasks carry the tag of the session that
/// spawned them; anything whose tag differs from the live session is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTag {
    pub session_id: String,
    pub epoch: u64,
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.epoch)
    }
}

/// Media the session negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaParams {
    pub video: bool,
    pub audio: bool,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
}

impl Default for MediaParams {
    fn default() -> Self {
        Resolution::P720.media_params()
    }
}

/// Video presets offered by the test harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "2160p")]
    P2160,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "240p")]
    P240,
}

impl Resolution {
    pub const ALL: [Resolution; 7] = [
        Resolution::P2160,
        Resolution::P1440,
        Resolution::P1080,
        Resolution::P720,
        Resolution::P480,
        Resolution::P360,
        Resolution::P240,
    ];

    /// (width, height, bitrate in bits per second)
    pub fn dimensions(self) -> (u32, u32, u32) {
        match self {
            Resolution::P2160 => (3840, 2160, 6_000_000),
            Resolution::P1440 => (2560, 1440, 4_000_000),
            Resolution::P1080 => (1920, 1080, 2_000_000),
            Resolution::P720 => (1280, 720, 1_500_000),
            Resolution::P480 => (854, 480, 1_000_000),
            Resolution::P360 => (640, 360, 800_000),
            Resolution::P240 => (426, 240, 500_000),
        }
    }

    /// Video-only parameters at this preset.
    pub fn media_params(self) -> MediaParams {
        let (width, height, bitrate) = self.dimensions();
        MediaParams {
            video: true,
            audio: false,
            width,
            height,
            bitrate,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (_, height, _) = self.dimensions();
        write!(f, "{height}p")
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Resolution::ALL
            .into_iter()
            .find(|r| r.to_string() == wanted)
            .ok_or_else(|| Error::config(format!("unknown resolution `{s}`")))
    }
}

/// Client-wide settings shared by every session a [`crate::SessionClient`] opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub stream_id: String,
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
    pub media: MediaParams,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: String::new(),
            stream_id: DEFAULT_STREAM_ID.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            media: MediaParams::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `CASTWIRE_SIGNALING_URL`, `CASTWIRE_STREAM_ID`,
    /// `CASTWIRE_ICE_SERVERS` (comma separated) and `CASTWIRE_RESOLUTION`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("CASTWIRE_SIGNALING_URL") {
            config.signaling_url = url.trim().to_string();
        }
        if let Ok(stream_id) = std::env::var("CASTWIRE_STREAM_ID") {
            config.stream_id = stream_id.trim().to_string();
        }
        if let Ok(servers) = std::env::var("CASTWIRE_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(resolution) = std::env::var("CASTWIRE_RESOLUTION") {
            let preset: Resolution = resolution.parse()?;
            let (width, height, bitrate) = preset.dimensions();
            config.media.width = width;
            config.media.height = height;
            config.media.bitrate = bitrate;
        }
        Ok(config)
    }

    /// Loads a JSON config file; missing keys keep their defaults.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(Error::config)
    }
}

/// Stream ids are restricted to `[A-Za-z0-9_]`, like the media server expects.
pub fn validate_stream_id(stream_id: &str) -> Result<()> {
    if stream_id.trim().is_empty() {
        return Err(Error::config("stream id is empty"));
    }
    if let Some(bad) = stream_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(Error::config(format!(
            "stream id `{stream_id}` contains invalid character `{bad}`"
        )));
    }
    Ok(())
}
