//! Microphone capture sessions, one per device.
//!
//! `start_stream` reserves the device, negotiates a sample format by starting
//! the recorder with each configured format until one keeps running past a
//! grace period, and hands the recorder's stdout to a [`CaptureStream`]. A
//! supervisor task per session waits for cancel or recorder exit, terminates
//! the recorder and releases the device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use super::backend::Backends;
use super::capture_stream::CaptureStream;
use super::catalog::DeviceCatalog;
use super::types::{AudioDevice, BackendKind, Direction, SampleFormat};
use crate::config::Config;
use crate::error::AudioError;
use crate::process::Supervised;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureInfo {
    pub session_id: String,
    /// Device the session is registered under.
    pub device_id: String,
    /// Device the recorder actually runs on; differs after a default fallback.
    pub active_device: String,
    pub backend: BackendKind,
    pub format: SampleFormat,
    pub used_default: bool,
}

/// A session after a default fallback is entered under both the requested
/// and the recording device, so neither can be taken by another session.
enum Slot {
    Negotiating {
        cancelled: bool,
    },
    Active {
        info: CaptureInfo,
        cancel: Arc<watch::Sender<bool>>,
        exited: watch::Receiver<bool>,
    },
}

type Sessions = Arc<Mutex<HashMap<String, Slot>>>;

fn lock(sessions: &Sessions) -> MutexGuard<'_, HashMap<String, Slot>> {
    sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds a device while its format is negotiated; released on drop unless
/// the session went live.
struct Reservation {
    sessions: Sessions,
    device_id: String,
    committed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            let mut sessions = lock(&self.sessions);
            if matches!(sessions.get(&self.device_id), Some(Slot::Negotiating { .. })) {
                sessions.remove(&self.device_id);
            }
        }
    }
}

struct Negotiated {
    device: AudioDevice,
    format: SampleFormat,
    process: Box<dyn Supervised>,
    /// Held on the default device when the requested one produced nothing.
    fallback: Option<Reservation>,
}

/// Resolves once the flag is true or its sender is gone.
async fn wait_set(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

pub struct CaptureStreamer {
    catalog: DeviceCatalog,
    backends: Backends,
    formats: Vec<SampleFormat>,
    attempt_timeout: Duration,
    grace: Duration,
    terminate_grace: Duration,
    chunk_size: usize,
    sessions: Sessions,
}

impl CaptureStreamer {
    pub fn new(config: &Config, catalog: DeviceCatalog, backends: Backends) -> Self {
        Self {
            catalog,
            backends,
            formats: config.capture_formats.clone(),
            attempt_timeout: config.capture_attempt_timeout,
            grace: config.capture_grace,
            terminate_grace: config.terminate_grace,
            chunk_size: config.capture_chunk_size,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `device_id` of `None` records from the system default capture device.
    pub async fn start_stream(&self, device_id: Option<&str>) -> Result<CaptureStream, AudioError> {
        let device = match device_id {
            Some(id) => self.catalog.find(Direction::Capture, id).await?,
            None => self.catalog.default_device(Direction::Capture).await,
        };
        let mut reservation = self.reserve(&device.id)?;

        let Negotiated {
            device: active,
            format,
            mut process,
            fallback,
        } = self.negotiate(&device).await?;
        let Some(reader) = process.take_output() else {
            process.terminate(self.terminate_grace).await;
            return Err(AudioError::StartFailed(format!(
                "recorder on {} has no output pipe",
                active.id
            )));
        };

        let info = CaptureInfo {
            session_id: Uuid::new_v4().to_string(),
            device_id: device.id.clone(),
            active_device: active.id.clone(),
            backend: active.backend,
            format,
            used_default: fallback.is_some(),
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel_tx);
        let (exited_tx, exited_rx) = watch::channel(false);

        let live = {
            let mut sessions = lock(&self.sessions);
            let keys = [&info.device_id, &info.active_device];
            let cancelled = keys.iter().any(|id| {
                matches!(sessions.get(*id), Some(Slot::Negotiating { cancelled: true }))
            });
            if !cancelled {
                for id in keys {
                    sessions.insert(
                        id.clone(),
                        Slot::Active {
                            info: info.clone(),
                            cancel: cancel.clone(),
                            exited: exited_rx.clone(),
                        },
                    );
                }
            }
            !cancelled
        };
        if !live {
            log::info!("capture on {} cancelled before it went live", device.id);
            process.terminate(self.terminate_grace).await;
            return Err(AudioError::NotCapturing(device.id));
        }
        reservation.committed = true;
        if let Some(mut fallback) = fallback {
            fallback.committed = true;
        }
        log::info!(
            "capture {} started on {} as {}",
            info.session_id,
            info.active_device,
            info.format
        );

        tokio::spawn(supervise(
            self.sessions.clone(),
            info.clone(),
            process,
            cancel_rx,
            exited_tx,
            self.terminate_grace,
        ));
        Ok(CaptureStream::new(info, reader, self.chunk_size, cancel))
    }

    /// Stops the session on `device_id` and waits, bounded, for the recorder
    /// to go away. A session still negotiating never goes live. Nothing to
    /// cancel is not an error.
    pub async fn cancel(&self, device_id: &str) {
        let exited = match lock(&self.sessions).get_mut(device_id) {
            Some(Slot::Active { cancel, exited, .. }) => {
                cancel.send_replace(true);
                Some(exited.clone())
            }
            Some(Slot::Negotiating { cancelled }) => {
                log::info!("cancelling capture on {} during negotiation", device_id);
                *cancelled = true;
                None
            }
            None => None,
        };
        let Some(mut exited) = exited else {
            return;
        };
        log::info!("cancelling capture on {}", device_id);
        let bound = self.terminate_grace * 2 + Duration::from_secs(1);
        if timeout(bound, wait_set(&mut exited)).await.is_err() {
            log::warn!("recorder on {} still shutting down", device_id);
        }
    }

    pub fn status(&self, device_id: &str) -> Result<CaptureInfo, AudioError> {
        match lock(&self.sessions).get(device_id) {
            Some(Slot::Active { info, .. }) => Ok(info.clone()),
            _ => Err(AudioError::NotCapturing(device_id.to_string())),
        }
    }

    pub fn sessions(&self) -> Vec<CaptureInfo> {
        lock(&self.sessions)
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Active { info, .. } if *id == info.device_id => Some(info.clone()),
                _ => None,
            })
            .collect()
    }

    fn reserve(&self, device_id: &str) -> Result<Reservation, AudioError> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(device_id) {
            return Err(AudioError::DeviceBusy(device_id.to_string()));
        }
        sessions.insert(device_id.to_string(), Slot::Negotiating { cancelled: false });
        Ok(Reservation {
            sessions: self.sessions.clone(),
            device_id: device_id.to_string(),
            committed: false,
        })
    }

    /// Every format on `device`, then every format on the system default
    /// device, which is reserved for the whole attempt.
    async fn negotiate(&self, device: &AudioDevice) -> Result<Negotiated, AudioError> {
        if let Some((format, process)) = self.try_formats(device, &[device.id.as_str()]).await {
            return Ok(Negotiated {
                device: device.clone(),
                format,
                process,
                fallback: None,
            });
        }

        let default = self.catalog.default_device(Direction::Capture).await;
        if default.id != device.id && !self.cancelled(&[device.id.as_str()]) {
            match self.reserve(&default.id) {
                Ok(reservation) => {
                    log::warn!("no format worked on {}, trying default {}", device.id, default.id);
                    let keys = [device.id.as_str(), default.id.as_str()];
                    if let Some((format, process)) = self.try_formats(&default, &keys).await {
                        return Ok(Negotiated {
                            device: default,
                            format,
                            process,
                            fallback: Some(reservation),
                        });
                    }
                }
                Err(_) => {
                    log::warn!("default capture device {} is busy, not falling back", default.id)
                }
            }
        }
        if self.cancelled(&[device.id.as_str()]) {
            return Err(AudioError::NotCapturing(device.id.clone()));
        }
        Err(AudioError::DeviceUnavailable(format!(
            "no capture format accepted by {}",
            device.id
        )))
    }

    /// True if any of the reserved `ids` was cancelled while negotiating.
    fn cancelled(&self, ids: &[&str]) -> bool {
        let sessions = lock(&self.sessions);
        ids.iter()
            .any(|id| matches!(sessions.get(*id), Some(Slot::Negotiating { cancelled: true })))
    }

    /// Stops early once any of the reserved `ids` is cancelled.
    async fn try_formats(
        &self,
        device: &AudioDevice,
        ids: &[&str],
    ) -> Option<(SampleFormat, Box<dyn Supervised>)> {
        for format in &self.formats {
            if self.cancelled(ids) {
                return None;
            }
            if let Some(process) = self.attempt(device, format).await {
                return Some((format.clone(), process));
            }
        }
        None
    }

    /// Accepted only if the recorder is still running after the grace period.
    async fn attempt(&self, device: &AudioDevice, format: &SampleFormat) -> Option<Box<dyn Supervised>> {
        let driver = self.backends.get(device.backend);
        log::debug!("capture attempt {} on {} via {}", format, device.id, driver.kind());

        let started = timeout(self.attempt_timeout, async {
            let mut process = driver.record_with_format(&device.id, format).await?;
            sleep(self.grace).await;
            let alive = process.is_alive();
            if !alive {
                process.terminate(self.terminate_grace).await;
            }
            Ok::<_, AudioError>(alive.then_some(process))
        })
        .await;

        match started {
            Ok(Ok(Some(process))) => Some(process),
            Ok(Ok(None)) => {
                log::info!("recorder rejected {} on {}", format, device.id);
                None
            }
            Ok(Err(e)) => {
                log::warn!("recorder failed to start {} on {}: {}", format, device.id, e);
                None
            }
            Err(_) => {
                log::warn!("capture attempt {} on {} timed out", format, device.id);
                None
            }
        }
    }
}

async fn supervise(
    sessions: Sessions,
    info: CaptureInfo,
    mut process: Box<dyn Supervised>,
    mut cancel: watch::Receiver<bool>,
    exited: watch::Sender<bool>,
    grace: Duration,
) {
    tokio::select! {
        _ = process.wait() => log::info!("recorder on {} exited", info.active_device),
        _ = wait_set(&mut cancel) => log::info!("capture {} cancelled", info.session_id),
    }
    process.terminate(grace).await;

    {
        let mut sessions = lock(&sessions);
        for id in [&info.device_id, &info.active_device] {
            let ours = matches!(
                sessions.get(id),
                Some(Slot::Active { info: current, .. }) if current.session_id == info.session_id
            );
            if ours {
                sessions.remove(id);
            }
        }
    }
    exited.send_replace(true);
}
