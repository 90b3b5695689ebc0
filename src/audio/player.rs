//! Player launch and the mpv JSON IPC control channel.
//!
//! mpv is started with `--input-ipc-server=<socket>`; every request is one
//! JSON line `{"command": [...], "request_id": N}` and the reply carrying the
//! same `request_id` is returned. Event lines in between are skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use super::backend::{ControlChannel, PlayerProcess};
use super::types::PlayRequest;
use crate::error::AudioError;
use crate::process::{ManagedProcess, SpawnOptions, find_program};

/// Builds fallback player arguments from `(device, file)`.
pub type FallbackArgs = fn(Option<&str>, &Path) -> Vec<String>;

#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub primary: String,
    pub fallback: String,
    pub fallback_args: FallbackArgs,
    /// mpv `--ao` driver name, also the `--audio-device` prefix
    pub audio_output: &'static str,
    pub control_timeout: Duration,
}

/// Launch mpv with a control socket, or the fire-and-forget fallback when mpv
/// is not installed.
pub async fn launch(
    settings: &PlayerSettings,
    request: &PlayRequest,
) -> Result<PlayerProcess, AudioError> {
    // the player outlives this service across restarts, so no kill_on_drop
    let options = SpawnOptions {
        pipe_stdout: false,
        kill_on_drop: false,
    };

    if find_program(&settings.primary).is_some() {
        if let Some(dir) = request.control_endpoint.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // a stale socket from a dead player would make mpv fail to bind
        let _ = tokio::fs::remove_file(&request.control_endpoint).await;

        let args = mpv_args(settings.audio_output, request);
        let process = ManagedProcess::spawn(&settings.primary, &args, options)?;
        let control = MpvIpc::new(request.control_endpoint.clone(), settings.control_timeout);
        return Ok(PlayerProcess {
            process: Box::new(process),
            control: Some(Arc::new(control)),
            program: settings.primary.clone(),
        });
    }

    if find_program(&settings.fallback).is_some() {
        log::warn!(
            "{} not installed, falling back to {} (no pause/resume/seek)",
            settings.primary,
            settings.fallback
        );
        if request.seek_seconds > 0.0 {
            log::warn!(
                "{} cannot seek, starting {} from the beginning",
                settings.fallback,
                request.path.display()
            );
        }
        let args = (settings.fallback_args)(request.device_id.as_deref(), &request.path);
        let process = ManagedProcess::spawn(&settings.fallback, &args, options)?;
        return Ok(PlayerProcess {
            process: Box::new(process),
            control: None,
            program: settings.fallback.clone(),
        });
    }

    Err(AudioError::StartFailed(format!(
        "neither {} nor {} is installed",
        settings.primary, settings.fallback
    )))
}

fn mpv_args(audio_output: &str, request: &PlayRequest) -> Vec<String> {
    let mut args = vec![
        "--no-video".to_string(),
        "--no-terminal".to_string(),
        "--idle=no".to_string(),
        format!("--ao={}", audio_output),
        format!("--input-ipc-server={}", request.control_endpoint.display()),
    ];
    if let Some(device) = &request.device_id {
        args.push(format!("--audio-device={}/{}", audio_output, device));
    }
    if request.seek_seconds > 0.0 {
        args.push(format!("--start={:.3}", request.seek_seconds));
    }
    args.push(request.path.display().to_string());
    args
}

pub struct MpvIpc {
    path: PathBuf,
    timeout: Duration,
    next_id: AtomicU64,
}

impl MpvIpc {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self {
            path,
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    async fn exchange(&self, id: u64, command: Vec<Value>) -> Result<Value, AudioError> {
        let stream = UnixStream::connect(&self.path).await?;
        let (read, mut write) = stream.into_split();

        let mut line = json!({ "command": command, "request_id": id }).to_string();
        line.push('\n');
        write.write_all(line.as_bytes()).await?;

        let mut lines = BufReader::new(read).lines();
        while let Some(line) = lines.next_line().await? {
            let reply: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if reply.get("request_id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            return match reply.get("error").and_then(Value::as_str) {
                Some("success") => Ok(reply.get("data").cloned().unwrap_or(Value::Null)),
                Some(err) => Err(AudioError::backend(format!("mpv: {}", err))),
                None => Err(AudioError::backend("mpv reply without status")),
            };
        }
        Err(AudioError::backend("control channel closed"))
    }
}

#[async_trait]
impl ControlChannel for MpvIpc {
    fn endpoint(&self) -> String {
        self.path.display().to_string()
    }

    async fn request(&self, command: Vec<Value>) -> Result<Value, AudioError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match timeout(self.timeout, self.exchange(id, command)).await {
            Ok(result) => result,
            Err(_) => Err(AudioError::Timeout(format!(
                "no reply on {} within {}ms",
                self.path.display(),
                self.timeout.as_millis()
            ))),
        }
    }
}

/// Live player state read over the control channel.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveStatus {
    pub position: f64,
    pub paused: bool,
    pub path: Option<PathBuf>,
}

pub async fn live_status(channel: &dyn ControlChannel) -> Result<LiveStatus, AudioError> {
    let paused = channel
        .request(vec![json!("get_property"), json!("pause")])
        .await?
        .as_bool()
        .unwrap_or(false);
    let position = position(channel).await?;
    let path = channel
        .request(vec![json!("get_property"), json!("path")])
        .await
        .ok()
        .and_then(|v| v.as_str().map(PathBuf::from));
    Ok(LiveStatus {
        position,
        paused,
        path,
    })
}

/// Current position in seconds. mpv reports `time-pos` as unavailable until
/// the file is loaded, which reads as 0.
pub async fn position(channel: &dyn ControlChannel) -> Result<f64, AudioError> {
    match channel
        .request(vec![json!("get_property"), json!("time-pos")])
        .await
    {
        Ok(v) => Ok(v.as_f64().unwrap_or(0.0).max(0.0)),
        Err(AudioError::Backend(msg)) if msg.contains("property unavailable") => Ok(0.0),
        Err(e) => Err(e),
    }
}

pub async fn set_paused(channel: &dyn ControlChannel, paused: bool) -> Result<(), AudioError> {
    channel
        .request(vec![json!("set_property"), json!("pause"), json!(paused)])
        .await
        .map(|_| ())
}

pub async fn seek(channel: &dyn ControlChannel, seconds: f64) -> Result<(), AudioError> {
    channel
        .request(vec![json!("seek"), json!(seconds), json!("absolute")])
        .await
        .map(|_| ())
}

/// One bounded round trip; any well-formed reply counts.
pub async fn is_responsive(channel: &dyn ControlChannel) -> bool {
    channel
        .request(vec![json!("get_property"), json!("pause")])
        .await
        .is_ok()
}
