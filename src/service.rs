//! The boundary facade over catalog, mixer, playback and capture.
//!
//! Every operation answers with a [`Reply`]; errors never cross this layer.

use std::sync::Arc;

use serde::Serialize;

use crate::audio::{
    AlsaDriver, AudioDevice, Backends, CaptureInfo, CaptureStream, CaptureStreamer, DeviceCatalog,
    Direction, MixerControl, MixerState, PlaybackController, PlaybackState, PulseDriver,
};
use crate::config::Config;
use crate::error::{AudioError, Reply};
use crate::process::{CommandRunner, ShellRunner};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub position: f64,
}

/// Backend failures that escaped a fallback chain surface as the mixer
/// taxonomy reason.
fn settle<T: Serialize>(result: Result<T, AudioError>) -> Reply<T> {
    match result {
        Err(AudioError::Backend(msg)) => {
            log::error!("unmapped backend failure: {}", msg);
            Reply::failure(&AudioError::NoAudioSystem)
        }
        other => other.into(),
    }
}

pub struct AudioService {
    catalog: DeviceCatalog,
    mixer: MixerControl,
    playback: PlaybackController,
    capture: CaptureStreamer,
}

impl AudioService {
    pub fn new(config: &Config, backends: Backends, runner: Arc<dyn CommandRunner>) -> Self {
        let catalog = DeviceCatalog::new(backends.clone());
        Self {
            mixer: MixerControl::new(backends.clone()),
            playback: PlaybackController::new(config, catalog.clone(), backends.clone(), runner),
            capture: CaptureStreamer::new(config, catalog.clone(), backends),
            catalog,
        }
    }

    /// Wires the real ALSA and PulseAudio drivers.
    pub fn from_config(config: &Config) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new(config.command_timeout));
        let backends = Backends::new(
            Arc::new(AlsaDriver::new(config)),
            Arc::new(PulseDriver::new(config, runner.clone())),
        );
        Self::new(config, backends, runner)
    }

    pub async fn list_devices(&self, direction: Option<Direction>) -> Reply<Vec<AudioDevice>> {
        let devices = match direction {
            Some(direction) => self.catalog.enumerate_direction(direction).await,
            None => self.catalog.enumerate().await,
        };
        Reply::ok(devices)
    }

    pub async fn get_volume(&self, direction: Direction) -> Reply<MixerState> {
        settle(self.mixer.get_volume(direction).await)
    }

    pub async fn set_volume(&self, direction: Direction, percent: i64) -> Reply<MixerState> {
        settle(self.mixer.set_volume(direction, percent).await)
    }

    pub async fn set_mute(&self, direction: Direction, muted: bool) -> Reply<()> {
        match self.mixer.set_mute(direction, muted).await {
            Ok(()) => Reply::done(),
            Err(e) => settle::<()>(Err(e)),
        }
    }

    pub async fn set_default(&self, direction: Direction, device_id: &str) -> Reply<()> {
        let result = async {
            let device = self.catalog.find(direction, device_id).await?;
            self.mixer
                .set_default_device(direction, &device.id, device.backend)
                .await
        }
        .await;
        match result {
            Ok(()) => Reply::done(),
            Err(e) => settle::<()>(Err(e)),
        }
    }

    pub async fn play(&self, path: &str, seek_seconds: f64) -> Reply<PlaybackState> {
        settle(self.playback.play(path, seek_seconds).await)
    }

    pub async fn pause(&self) -> Reply<Position> {
        settle(self.playback.pause().await.map(|position| Position { position }))
    }

    pub async fn resume(&self) -> Reply<PlaybackState> {
        settle(self.playback.resume().await)
    }

    pub async fn seek(&self, seconds: f64) -> Reply<Position> {
        settle(self.playback.seek(seconds).await.map(|position| Position { position }))
    }

    pub async fn stop(&self) -> Reply<()> {
        self.playback.stop().await;
        Reply::done()
    }

    pub async fn get_state(&self) -> Reply<PlaybackState> {
        Reply::ok(self.playback.get_state().await)
    }

    /// The stream is handed out alongside the reply describing it.
    pub async fn start_stream(
        &self,
        device_id: Option<&str>,
    ) -> (Reply<CaptureInfo>, Option<CaptureStream>) {
        match self.capture.start_stream(device_id).await {
            Ok(stream) => (Reply::ok(stream.info().clone()), Some(stream)),
            Err(e) => (settle(Err(e)), None),
        }
    }

    pub async fn cancel_stream(&self, device_id: &str) -> Reply<()> {
        self.capture.cancel(device_id).await;
        Reply::done()
    }

    pub fn stream_status(&self, device_id: &str) -> Reply<CaptureInfo> {
        settle(self.capture.status(device_id))
    }

    pub fn streams(&self) -> Reply<Vec<CaptureInfo>> {
        Reply::ok(self.capture.sessions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{ScriptedRunner, fake_backends, test_config};
    use futures_util::StreamExt;

    fn service() -> (tempfile::TempDir, AudioService) {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (_alsa, _pulse, backends) = fake_backends();
        let service = AudioService::new(&config, backends, Arc::new(ScriptedRunner::new()));
        (dir, service)
    }

    #[tokio::test]
    async fn device_list_is_never_empty() {
        let (_dir, service) = service();
        let reply = service.list_devices(None).await;
        assert!(reply.success);
        assert_eq!(reply.data.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn volume_reply_is_clamped() {
        let (_dir, service) = service();
        let reply = service.set_volume(Direction::Playback, 250).await;
        assert_eq!(reply.data.unwrap().volume_percent, 100);
        assert!(service.set_mute(Direction::Playback, true).await.success);
        assert!(service.get_volume(Direction::Playback).await.data.unwrap().muted);
    }

    #[tokio::test]
    async fn playback_errors_become_failure_replies() {
        let (_dir, service) = service();
        assert_eq!(service.resume().await.error_code(), Some("NotPlaying"));
        assert_eq!(service.pause().await.error_code(), Some("NotPlaying"));
        assert_eq!(service.play("nothing.mp3", 0.0).await.error_code(), Some("NotFound"));

        let stop = serde_json::to_value(service.stop().await).unwrap();
        assert_eq!(stop, serde_json::json!({"success": true}));
        assert_eq!(
            service.get_state().await.data.unwrap().state,
            crate::audio::PlayerState::Idle
        );
    }

    #[tokio::test]
    async fn unknown_default_device_is_unavailable() {
        let (_dir, service) = service();
        let reply = service.set_default(Direction::Capture, "hw:7,0").await;
        assert_eq!(reply.error_code(), Some("DeviceUnavailable"));
    }

    #[tokio::test]
    async fn stream_lifecycle() {
        let (_dir, service) = service();
        let (reply, stream) = service.start_stream(None).await;
        assert!(reply.success);
        let info = reply.data.unwrap();
        let mut stream = stream.unwrap();
        assert!(stream.next().await.is_some());

        let (busy, none) = service.start_stream(Some(&info.device_id)).await;
        assert_eq!(busy.error_code(), Some("DeviceBusy"));
        assert!(none.is_none());
        assert_eq!(service.streams().data.unwrap().len(), 1);

        assert!(service.cancel_stream(&info.device_id).await.success);
        assert!(stream.next().await.is_none());
        assert_eq!(
            service.stream_status(&info.device_id).error_code(),
            Some("NotCapturing")
        );
    }
}
