//! Volume, mute and default device, backend A first then backend B.

use super::backend::Backends;
use super::types::{BackendKind, Direction, MixerState, clamp_percent};
use crate::error::AudioError;

#[derive(Clone)]
pub struct MixerControl {
    backends: Backends,
}

impl MixerControl {
    pub fn new(backends: Backends) -> Self {
        Self { backends }
    }

    pub async fn get_volume(&self, direction: Direction) -> Result<MixerState, AudioError> {
        for driver in self.backends.in_order(BackendKind::Alsa) {
            match driver.get_volume(direction).await {
                Ok(state) => return Ok(state),
                Err(e) => log::warn!("{} {} volume read failed: {}", driver.kind(), direction, e),
            }
        }
        Err(AudioError::NoAudioSystem)
    }

    /// Out of range values are clamped to 0..=100 before any backend sees them.
    /// Returns the state read back after the write; a failed read back is an
    /// error even though the write landed.
    pub async fn set_volume(&self, direction: Direction, percent: i64) -> Result<MixerState, AudioError> {
        let percent = clamp_percent(percent);
        for driver in self.backends.in_order(BackendKind::Alsa) {
            match driver.set_volume(direction, percent).await {
                Ok(()) => {
                    log::info!("{} volume set to {}% via {}", direction, percent, driver.kind());
                    return driver.get_volume(direction).await.inspect_err(|e| {
                        log::error!("{} {} volume read back failed: {}", driver.kind(), direction, e)
                    });
                }
                Err(e) => log::warn!("{} {} volume write failed: {}", driver.kind(), direction, e),
            }
        }
        Err(AudioError::NoAudioSystem)
    }

    /// Idempotent; muting an already muted control succeeds.
    pub async fn set_mute(&self, direction: Direction, muted: bool) -> Result<(), AudioError> {
        for driver in self.backends.in_order(BackendKind::Alsa) {
            match driver.set_mute(direction, muted).await {
                Ok(()) => {
                    log::info!(
                        "{} {} via {}",
                        direction,
                        if muted { "muted" } else { "unmuted" },
                        driver.kind()
                    );
                    return Ok(());
                }
                Err(e) => log::warn!("{} {} mute failed: {}", driver.kind(), direction, e),
            }
        }
        Err(AudioError::NoAudioSystem)
    }

    /// The device's own backend is asked first. Success means the backend
    /// verified the change.
    pub async fn set_default_device(
        &self,
        direction: Direction,
        device_id: &str,
        backend: BackendKind,
    ) -> Result<(), AudioError> {
        let mut last = None;
        for driver in self.backends.in_order(backend) {
            match driver.set_default(direction, device_id).await {
                Ok(()) => {
                    log::info!("default {} device is now {} ({})", direction, device_id, driver.kind());
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("{} rejected default {} {}: {}", driver.kind(), direction, device_id, e);
                    last = Some(e);
                }
            }
        }
        match last {
            Some(AudioError::Backend(_)) | None => Err(AudioError::NoAudioSystem),
            Some(e) => Err(e),
        }
    }
}
