//! JSON persistence of the playback session across service restarts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::types::BackendKind;
use crate::error::AudioError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackRecord {
    pub file_path: PathBuf,
    pub position_seconds: f64,
    pub is_paused: bool,
    pub resumable: bool,
    pub pid: Option<u32>,
    pub control_endpoint: Option<String>,
    pub backend: BackendKind,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A missing file is `None`; an unreadable or corrupt one is discarded.
    pub async fn load(&self) -> Option<PlaybackRecord> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("cannot read {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("discarding corrupt playback state {}: {}", self.path.display(), e);
                self.clear().await;
                None
            }
        }
    }

    /// Written to a sibling temp file first so readers never see half a record.
    pub async fn save(&self, record: &PlaybackRecord) -> Result<(), AudioError> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| AudioError::backend(format!("encode playback state: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn clear(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => log::debug!("cleared {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("cannot remove {}: {}", self.path.display(), e),
        }
    }
}
