//! Device audio control and streaming.
//!
//! [`service::AudioService`] is the entry point: device listing, volume and
//! mute, default device selection, file playback and microphone capture over
//! ALSA or PulseAudio. [`control_bridge::ControlBridge`] exposes it over local
//! UDP.

pub mod audio;
pub mod config;
pub mod control_bridge;
pub mod error;
pub mod process;
pub mod service;
