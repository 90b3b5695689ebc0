//! Playback state machine: Idle -> Playing -> Paused -> Idle.
//!
//! At most one [`PlaybackSession`] exists. It is owned by
//! [`PlaybackController`] behind a mutex, so overlapping `play`/`stop` calls
//! are serialized and never leave two players running. The session is
//! mirrored to a [`SessionStore`] record after every transition; a record left
//! by a previous run is only trusted after its control channel answers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use uuid::Uuid;

use super::backend::{Backends, ControlChannel, PlayerProcess};
use super::catalog::DeviceCatalog;
use super::player;
use super::session_store::{PlaybackRecord, SessionStore};
use super::types::{BackendKind, Direction, PlayRequest};
use crate::config::Config;
use crate::error::AudioError;
use crate::process::{self, CommandRunner, Supervised};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackState {
    pub state: PlayerState,
    pub is_playing: bool,
    pub position: f64,
    pub file_path: Option<PathBuf>,
    pub resumable: bool,
}

impl PlaybackState {
    pub fn idle() -> Self {
        Self {
            state: PlayerState::Idle,
            is_playing: false,
            position: 0.0,
            file_path: None,
            resumable: false,
        }
    }
}

pub struct PlaybackSession {
    pub file_path: PathBuf,
    pub position_seconds: f64,
    pub is_paused: bool,
    pub backend: BackendKind,
    pub device_id: Option<String>,
    process: Box<dyn Supervised>,
    control: Option<Arc<dyn ControlChannel>>,
}

impl PlaybackSession {
    pub fn resumable(&self) -> bool {
        self.control.is_some()
    }

    fn record(&self) -> PlaybackRecord {
        PlaybackRecord {
            file_path: self.file_path.clone(),
            position_seconds: self.position_seconds,
            is_paused: self.is_paused,
            resumable: self.resumable(),
            pid: self.process.pid(),
            control_endpoint: self.control.as_ref().map(|c| c.endpoint()),
            backend: self.backend,
            device_id: self.device_id.clone(),
        }
    }

    fn snapshot(&self) -> PlaybackState {
        PlaybackState {
            state: if self.is_paused {
                PlayerState::Paused
            } else {
                PlayerState::Playing
            },
            is_playing: !self.is_paused,
            position: self.position_seconds,
            file_path: Some(self.file_path.clone()),
            resumable: self.resumable(),
        }
    }

    fn control(&self) -> Result<Arc<dyn ControlChannel>, AudioError> {
        self.control.clone().ok_or_else(|| {
            AudioError::Unsupported(format!(
                "{} is playing without a control channel",
                self.file_path.display()
            ))
        })
    }
}

/// A control channel that fails on a live player means the player can no
/// longer be driven.
fn control_failure(err: AudioError) -> AudioError {
    match err {
        AudioError::Backend(msg) => {
            log::warn!("player control failed: {}", msg);
            AudioError::NotPlaying
        }
        other => other,
    }
}

#[derive(Debug, Clone)]
struct PlaybackSettings {
    media_root: PathBuf,
    ipc_dir: PathBuf,
    ready_attempts: u32,
    ready_interval: Duration,
    terminate_grace: Duration,
    known_names: Vec<String>,
    name_kill_fallback: bool,
}

pub struct PlaybackController {
    catalog: DeviceCatalog,
    backends: Backends,
    store: SessionStore,
    runner: Arc<dyn CommandRunner>,
    settings: PlaybackSettings,
    session: Mutex<Option<PlaybackSession>>,
}

impl PlaybackController {
    pub fn new(
        config: &Config,
        catalog: DeviceCatalog,
        backends: Backends,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            catalog,
            backends,
            store: SessionStore::new(config.state_file.clone()),
            runner,
            settings: PlaybackSettings {
                media_root: config.media_root.clone(),
                ipc_dir: config.ipc_dir.clone(),
                ready_attempts: config.ready_attempts,
                ready_interval: config.ready_interval,
                terminate_grace: config.terminate_grace,
                known_names: config.player_known_names.clone(),
                name_kill_fallback: config.name_kill_fallback,
            },
            session: Mutex::new(None),
        }
    }

    /// Stops whatever is playing, then starts `path` at `seek_seconds`.
    pub async fn play(
        &self,
        path: impl AsRef<Path>,
        seek_seconds: f64,
    ) -> Result<PlaybackState, AudioError> {
        let mut slot = self.session.lock().await;
        self.start(&mut slot, path.as_ref(), seek_seconds).await
    }

    /// Returns the position the player was paused at.
    pub async fn pause(&self) -> Result<f64, AudioError> {
        let mut slot = self.session.lock().await;
        self.adopt(&mut slot).await;

        let session = slot.as_mut().ok_or(AudioError::NotPlaying)?;
        if !session.process.is_alive() {
            return Err(AudioError::NotPlaying);
        }
        let control = session.control()?;
        if session.is_paused {
            return Ok(session.position_seconds);
        }

        let position = player::position(control.as_ref())
            .await
            .map_err(control_failure)?;
        player::set_paused(control.as_ref(), true)
            .await
            .map_err(control_failure)?;
        session.position_seconds = position;
        session.is_paused = true;
        log::info!("paused {} at {:.1}s", session.file_path.display(), position);
        let record = session.record();
        self.persist(record).await;
        Ok(position)
    }

    /// Unpauses a live player, or relaunches from the last known position
    /// when the player is gone.
    pub async fn resume(&self) -> Result<PlaybackState, AudioError> {
        let mut slot = self.session.lock().await;
        self.adopt(&mut slot).await;

        let alive = match slot.as_mut() {
            Some(session) => session.process.is_alive(),
            None => false,
        };
        if alive {
            if let Some(session) = slot.as_mut() {
                let control = session.control()?;
                if session.is_paused {
                    player::set_paused(control.as_ref(), false)
                        .await
                        .map_err(control_failure)?;
                    session.is_paused = false;
                }
                if let Ok(position) = player::position(control.as_ref()).await {
                    session.position_seconds = position;
                }
                log::info!(
                    "resumed {} at {:.1}s",
                    session.file_path.display(),
                    session.position_seconds
                );
                let (record, state) = (session.record(), session.snapshot());
                self.persist(record).await;
                return Ok(state);
            }
        }

        let record = match slot.take() {
            Some(session) => {
                let record = session.record();
                self.retire(session).await;
                Some(record)
            }
            None => self.store.load().await,
        };
        let record = record.ok_or(AudioError::NotPlaying)?;
        log::info!(
            "player for {} is gone, relaunching at {:.1}s",
            record.file_path.display(),
            record.position_seconds
        );
        self.start(&mut slot, &record.file_path, record.position_seconds)
            .await
    }

    /// Absolute seek. Returns the new position.
    pub async fn seek(&self, seconds: f64) -> Result<f64, AudioError> {
        let mut slot = self.session.lock().await;
        self.adopt(&mut slot).await;

        let session = slot.as_mut().ok_or(AudioError::NotPlaying)?;
        if !session.process.is_alive() {
            return Err(AudioError::NotPlaying);
        }
        let control = session.control()?;
        let target = seconds.max(0.0);
        player::seek(control.as_ref(), target)
            .await
            .map_err(control_failure)?;
        session.position_seconds = target;
        let record = session.record();
        self.persist(record).await;
        Ok(target)
    }

    /// Always succeeds, with or without a session.
    pub async fn stop(&self) {
        let mut slot = self.session.lock().await;
        self.stop_locked(&mut slot).await;
    }

    /// Never fails; an unresponsive or exited player reports Idle and its
    /// persisted record is dropped.
    pub async fn get_state(&self) -> PlaybackState {
        let mut slot = self.session.lock().await;
        self.adopt(&mut slot).await;

        let live = match slot.as_mut() {
            Some(session) => Self::refresh(session).await,
            None => None,
        };
        match live {
            Some(state) => state,
            None => {
                if let Some(mut session) = slot.take() {
                    log::info!("player for {} is no longer live", session.file_path.display());
                    session.process.terminate(self.settings.terminate_grace).await;
                }
                self.store.clear().await;
                PlaybackState::idle()
            }
        }
    }

    async fn refresh(session: &mut PlaybackSession) -> Option<PlaybackState> {
        if !session.process.is_alive() {
            return None;
        }
        if let Some(control) = session.control.clone() {
            match player::live_status(control.as_ref()).await {
                Ok(live) => {
                    session.position_seconds = live.position;
                    session.is_paused = live.paused;
                    if let Some(path) = live.path {
                        session.file_path = path;
                    }
                }
                Err(e) => {
                    log::warn!("status request on {} failed: {}", control.endpoint(), e);
                    return None;
                }
            }
        }
        Some(session.snapshot())
    }

    async fn start(
        &self,
        slot: &mut Option<PlaybackSession>,
        path: &Path,
        seek_seconds: f64,
    ) -> Result<PlaybackState, AudioError> {
        self.stop_locked(slot).await;

        let path = self.resolve(path).await?;
        let session = self.launch(&path, seek_seconds.max(0.0)).await?;
        let (record, state) = (session.record(), session.snapshot());
        self.persist(record).await;
        *slot = Some(session);
        Ok(state)
    }

    async fn resolve(&self, path: &Path) -> Result<PathBuf, AudioError> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.settings.media_root.join(path)
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(AudioError::NotFound(path.display().to_string())),
        }
    }

    async fn launch(&self, path: &Path, seek_seconds: f64) -> Result<PlaybackSession, AudioError> {
        let device = self.catalog.default_device(Direction::Playback).await;
        let device_id = (!device.synthetic).then(|| device.id.clone());
        let endpoint = self
            .settings
            .ipc_dir
            .join(format!("mpv-{}.sock", Uuid::new_v4()));

        let mut last_error = None;
        for driver in self.backends.in_order(device.backend) {
            let request = PlayRequest {
                path: path.to_path_buf(),
                seek_seconds,
                device_id: if driver.kind() == device.backend {
                    device_id.clone()
                } else {
                    None
                },
                control_endpoint: endpoint.clone(),
            };
            match driver.play(&request).await {
                Ok(player) => {
                    log::info!(
                        "{} started for {} on {} (pid {:?})",
                        player.program,
                        path.display(),
                        driver.kind(),
                        player.process.pid()
                    );
                    return self.await_ready(driver.kind(), request, player).await;
                }
                Err(e) => {
                    log::warn!("{} could not start a player: {}", driver.kind(), e);
                    last_error = Some(e);
                }
            }
        }
        Err(AudioError::StartFailed(match last_error {
            Some(e) => e.to_string(),
            None => "no playback backend".to_string(),
        }))
    }

    async fn await_ready(
        &self,
        backend: BackendKind,
        request: PlayRequest,
        mut player: PlayerProcess,
    ) -> Result<PlaybackSession, AudioError> {
        let ready = match &player.control {
            Some(control) => self.poll_ready(player.process.as_mut(), control.as_ref()).await,
            None => {
                sleep(self.settings.ready_interval).await;
                player.process.is_alive()
            }
        };
        if !ready {
            player.process.terminate(self.settings.terminate_grace).await;
            return Err(AudioError::StartFailed(format!(
                "{} did not become ready for {}",
                player.program,
                request.path.display()
            )));
        }
        if !player.resumable() {
            log::warn!("{} is not resumable", request.path.display());
        }

        Ok(PlaybackSession {
            file_path: request.path,
            position_seconds: request.seek_seconds,
            is_paused: false,
            backend,
            device_id: request.device_id,
            process: player.process,
            control: player.control,
        })
    }

    async fn poll_ready(&self, process: &mut dyn Supervised, control: &dyn ControlChannel) -> bool {
        for attempt in 1..=self.settings.ready_attempts {
            if !process.is_alive() {
                log::warn!("player exited before answering on {}", control.endpoint());
                return false;
            }
            if player::is_responsive(control).await {
                log::debug!("player ready after {} attempt(s)", attempt);
                return true;
            }
            sleep(self.settings.ready_interval).await;
        }
        false
    }

    /// Takes over a player left running by an earlier instance of this
    /// service, if its persisted record still checks out.
    async fn adopt(&self, slot: &mut Option<PlaybackSession>) {
        if slot.is_some() {
            return;
        }
        let Some(record) = self.store.load().await else {
            return;
        };
        let driver = self.backends.get(record.backend);

        let control = match &record.control_endpoint {
            Some(endpoint) => {
                let channel = driver.control_channel(endpoint);
                if !player::is_responsive(channel.as_ref()).await {
                    log::info!("persisted player on {} is not answering", endpoint);
                    return;
                }
                Some(channel)
            }
            None => None,
        };
        let Some(pid) = record.pid else {
            return;
        };
        let Some(mut process) = driver.adopt_process(pid, &self.settings.known_names) else {
            return;
        };
        if !process.is_alive() {
            return;
        }

        let (position, paused) = match &control {
            Some(channel) => match player::live_status(channel.as_ref()).await {
                Ok(live) => (live.position, live.paused),
                Err(_) => (record.position_seconds, record.is_paused),
            },
            None => (record.position_seconds, false),
        };
        log::info!("adopted player pid {} for {}", pid, record.file_path.display());
        *slot = Some(PlaybackSession {
            file_path: record.file_path,
            position_seconds: position,
            is_paused: paused,
            backend: record.backend,
            device_id: record.device_id,
            process,
            control,
        });
    }

    async fn stop_locked(&self, slot: &mut Option<PlaybackSession>) {
        let record = self.store.load().await;
        let mut tracked = false;
        let mut control = None;

        if let Some(mut session) = slot.take() {
            log::info!("stopping playback of {}", session.file_path.display());
            control = session.control.clone();
            session.process.terminate(self.settings.terminate_grace).await;
            tracked = true;
        } else if let Some(record) = &record {
            let driver = self.backends.get(record.backend);
            control = record
                .control_endpoint
                .as_deref()
                .map(|endpoint| driver.control_channel(endpoint));
            if let Some(pid) = record.pid {
                if let Some(mut process) = driver.adopt_process(pid, &self.settings.known_names) {
                    if process.is_alive() {
                        log::info!("stopping persisted player pid {}", pid);
                        process.terminate(self.settings.terminate_grace).await;
                    }
                }
            }
        }

        let still_answering = match &control {
            Some(channel) => player::is_responsive(channel.as_ref()).await,
            None => false,
        };
        // a record with neither a PID nor an endpoint is the only player we
        // cannot find any other way
        let untracked = !tracked
            && record
                .as_ref()
                .is_some_and(|r| r.pid.is_none() && r.control_endpoint.is_none());
        if still_answering || untracked {
            self.kill_by_name().await;
        }

        if let Some(channel) = &control {
            let _ = tokio::fs::remove_file(channel.endpoint()).await;
        }
        self.store.clear().await;
    }

    /// Drops a session whose player is already gone, along with its record.
    async fn retire(&self, mut session: PlaybackSession) {
        session.process.terminate(self.settings.terminate_grace).await;
        if let Some(channel) = &session.control {
            let _ = tokio::fs::remove_file(channel.endpoint()).await;
        }
        self.store.clear().await;
    }

    async fn kill_by_name(&self) {
        if !self.settings.name_kill_fallback {
            log::warn!("player may still be running; name-based kill is disabled");
            return;
        }
        log::warn!(
            "falling back to name-based kill of {:?}",
            self.settings.known_names
        );
        process::kill_by_name(self.runner.as_ref(), &self.settings.known_names).await;
    }

    async fn persist(&self, record: PlaybackRecord) {
        if let Err(e) = self.store.save(&record).await {
            log::error!("failed to persist playback state: {}", e);
        }
    }
}
