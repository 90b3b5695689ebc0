//! Error taxonomy and the uniform reply shape handed to the web layer.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    /// No backend produced a usable device.
    #[error("no usable audio device: {0}")]
    DeviceUnavailable(String),

    /// No mixer backend responded.
    #[error("no audio system responded")]
    NoAudioSystem,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("nothing is playing")]
    NotPlaying,

    #[error("device {0} is not capturing")]
    NotCapturing(String),

    #[error("device {0} already has a capture session")]
    DeviceBusy(String),

    /// The subprocess never became ready.
    #[error("failed to start: {0}")]
    StartFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Control requested from a fire-and-forget player.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// One backend attempt failed. Fallback chains absorb these.
    #[error("backend error: {0}")]
    Backend(String),
}

impl AudioError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceUnavailable(_) => "DeviceUnavailable",
            Self::NoAudioSystem => "NoAudioSystem",
            Self::NotFound(_) => "NotFound",
            Self::NotPlaying => "NotPlaying",
            Self::NotCapturing(_) => "NotCapturing",
            Self::DeviceBusy(_) => "DeviceBusy",
            Self::StartFailed(_) => "StartFailed",
            Self::Timeout(_) => "Timeout",
            Self::Unsupported(_) => "Unsupported",
            Self::Backend(_) => "Backend",
        }
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

impl From<std::io::Error> for AudioError {
    fn from(e: std::io::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// `{success, data}` on success, `{success, error}` on failure.
#[derive(Debug, Clone, Serialize)]
pub struct Reply<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> Reply<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &AudioError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }

    pub fn error_code(&self) -> Option<&'static str> {
        self.error.as_ref().map(|e| e.code)
    }
}

impl Reply<()> {
    /// Success without a payload.
    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }
}

impl<T: Serialize> From<Result<T, AudioError>> for Reply<T> {
    fn from(result: Result<T, AudioError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::failure(&e),
        }
    }
}
