//! The driver interface every OS audio backend implements.
//!
//! Backend text formats and library quirks stay behind this trait; catalog,
//! mixer and controllers only see [`AudioDevice`], [`MixerState`] and process
//! handles.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::types::{AudioDevice, BackendKind, Direction, MixerState, PlayRequest, SampleFormat};
use crate::error::AudioError;
use crate::process::{self, PidProcess, Supervised};

#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn enumerate(&self, direction: Direction) -> Result<Vec<AudioDevice>, AudioError>;

    async fn get_volume(&self, direction: Direction) -> Result<MixerState, AudioError>;

    /// `percent` is already clamped by the caller.
    async fn set_volume(&self, direction: Direction, percent: u8) -> Result<(), AudioError>;

    async fn set_mute(&self, direction: Direction, muted: bool) -> Result<(), AudioError>;

    /// Must only return `Ok` once the backend actually accepted the change.
    async fn set_default(&self, direction: Direction, device_id: &str) -> Result<(), AudioError>;

    /// Launch the player on this backend.
    async fn play(&self, request: &PlayRequest) -> Result<PlayerProcess, AudioError>;

    /// Reconnect to a player control endpoint persisted by an earlier session.
    fn control_channel(&self, endpoint: &str) -> Arc<dyn ControlChannel>;

    /// Track a player started by an earlier session, known only by PID.
    /// `None` unless that PID still runs one of the player `names`.
    fn adopt_process(&self, pid: u32, names: &[String]) -> Option<Box<dyn Supervised>> {
        adopt_pid(pid, names)
    }

    /// Start the recorder with stdout piped. The caller judges success.
    async fn record_with_format(
        &self,
        device_id: &str,
        format: &SampleFormat,
    ) -> Result<Box<dyn Supervised>, AudioError>;
}

/// PIDs are reused, so a persisted PID is only trusted while the process
/// behind it is still a known player.
pub(crate) fn adopt_pid(pid: u32, names: &[String]) -> Option<Box<dyn Supervised>> {
    if !process::pid_is_one_of(pid, names) {
        log::info!("pid {} is not a known player, leaving it alone", pid);
        return None;
    }
    Some(Box::new(PidProcess::new(pid)))
}

/// Request/response channel to a running player.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn endpoint(&self) -> String;

    /// Send one command (an mpv-style argument array) and return the `data`
    /// field of the reply. Bounded by the channel's timeout.
    async fn request(&self, command: Vec<Value>) -> Result<Value, AudioError>;
}

/// A launched player. Without a control channel the player is
/// fire-and-forget and cannot pause, resume or seek.
pub struct PlayerProcess {
    pub process: Box<dyn Supervised>,
    pub control: Option<Arc<dyn ControlChannel>>,
    pub program: String,
}

impl PlayerProcess {
    pub fn resumable(&self) -> bool {
        self.control.is_some()
    }
}

/// Both drivers, addressable by kind.
#[derive(Clone)]
pub struct Backends {
    alsa: Arc<dyn BackendDriver>,
    pulse: Arc<dyn BackendDriver>,
}

impl Backends {
    pub fn new(alsa: Arc<dyn BackendDriver>, pulse: Arc<dyn BackendDriver>) -> Self {
        Self { alsa, pulse }
    }

    pub fn get(&self, kind: BackendKind) -> &Arc<dyn BackendDriver> {
        match kind {
            BackendKind::Alsa => &self.alsa,
            BackendKind::Pulse => &self.pulse,
        }
    }

    /// `first`, then the other backend.
    pub fn in_order(&self, first: BackendKind) -> [&Arc<dyn BackendDriver>; 2] {
        [self.get(first), self.get(first.other())]
    }
}
