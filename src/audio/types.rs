use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(alias = "output")]
    Playback,
    #[serde(alias = "input")]
    Capture,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Playback => "playback",
            Self::Capture => "capture",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "playback" | "output" => Ok(Self::Playback),
            "capture" | "input" => Ok(Self::Capture),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

/// Backend A is direct ALSA hardware access, backend B the PulseAudio server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Alsa,
    Pulse,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alsa => "alsa",
            Self::Pulse => "pulse",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Alsa => Self::Pulse,
            Self::Pulse => Self::Alsa,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of one device as reported by a backend. Re-enumerate instead of
/// mutating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub display_name: String,
    pub direction: Direction,
    pub is_default: bool,
    pub backend: BackendKind,
    /// Placeholder produced when no backend could list this direction.
    #[serde(default)]
    pub synthetic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerState {
    pub direction: Direction,
    pub volume_percent: u8,
    pub muted: bool,
}

/// One recorder format, written `S16_LE:48000:2` in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleFormat {
    /// ALSA sample format name, e.g. `S16_LE`
    pub encoding: String,
    pub rate: u32,
    pub channels: u16,
}

impl SampleFormat {
    pub fn new(encoding: &str, rate: u32, channels: u16) -> Self {
        Self {
            encoding: encoding.to_string(),
            rate,
            channels,
        }
    }

    /// PulseAudio spelling of the encoding (`S16_LE` -> `s16le`).
    pub fn pulse_encoding(&self) -> String {
        self.encoding.replace('_', "").to_lowercase()
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.encoding, self.rate, self.channels)
    }
}

impl FromStr for SampleFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let (Some(encoding), Some(rate), Some(channels), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("Expected encoding:rate:channels, got {}", s));
        };
        let rate = rate.parse().map_err(|_| format!("Bad sample rate in {}", s))?;
        let channels = channels
            .parse()
            .map_err(|_| format!("Bad channel count in {}", s))?;
        if encoding.is_empty() {
            return Err(format!("Missing encoding in {}", s));
        }
        Ok(Self {
            encoding: encoding.to_string(),
            rate,
            channels,
        })
    }
}

/// What a backend needs to launch the player.
#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub path: PathBuf,
    pub seek_seconds: f64,
    pub device_id: Option<String>,
    /// Where the player should listen for control commands.
    pub control_endpoint: PathBuf,
}

pub fn clamp_percent(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}
