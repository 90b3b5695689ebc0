//! audio - device, mixer, playback and capture control
//!
//! Two OS backends (ALSA and PulseAudio) sit behind [`BackendDriver`]. The
//! catalog and mixer walk them in priority order; playback drives an external
//! player over its control channel and capture streams a recorder's stdout.

mod alsa_driver;
mod backend;
pub mod capture;
mod capture_stream;
pub mod catalog;
pub mod mixer;
mod player;
pub mod playback;
mod pulse_driver;
mod session_store;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use alsa_driver::AlsaDriver;
pub use backend::{BackendDriver, Backends, ControlChannel, PlayerProcess};
pub use capture::{CaptureInfo, CaptureStreamer};
pub use capture_stream::CaptureStream;
pub use catalog::{DeviceCatalog, friendly_name};
pub use mixer::MixerControl;
pub use playback::{PlaybackController, PlaybackSession, PlaybackState, PlayerState};
pub use pulse_driver::PulseDriver;
pub use session_store::{PlaybackRecord, SessionStore};
pub use types::{AudioDevice, BackendKind, Direction, MixerState, PlayRequest, SampleFormat, clamp_percent};
