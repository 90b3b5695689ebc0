//! Backend A: direct ALSA access.
//!
//! Devices come from `/proc/asound/{cards,pcm}`, volume and mute from the
//! ALSA simple mixer, capture from `arecord`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use alsa::mixer::{Mixer, Selem, SelemChannelId, SelemId};
use async_trait::async_trait;

use super::backend::{BackendDriver, ControlChannel, PlayerProcess};
use super::player::{self, MpvIpc, PlayerSettings};
use super::types::{AudioDevice, BackendKind, Direction, MixerState, PlayRequest, SampleFormat};
use crate::config::Config;
use crate::error::AudioError;
use crate::process::{ManagedProcess, SpawnOptions, Supervised};

const MIXER_CARD: &str = "default";
/// Named controls tried in order, first match wins.
const PLAYBACK_CONTROLS: &[&str] = &["Master", "PCM", "Speaker", "Headphone"];
const CAPTURE_CONTROLS: &[&str] = &["Capture", "Mic"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlsaCard {
    pub index: u32,
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlsaPcm {
    pub card: u32,
    pub device: u32,
    pub name: String,
    pub playback: bool,
    pub capture: bool,
}

/// Parse `/proc/asound/cards`. Each card has a header line
/// ` 0 [PCH            ]: HDA-Intel - HDA Intel PCH` and an indented detail
/// line, which is skipped.
pub fn parse_cards(text: &str) -> Vec<AlsaCard> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (index, rest) = line.split_once(' ')?;
            let index = index.parse().ok()?;
            let open = rest.find('[')?;
            let close = rest.find(']')?;
            let id = rest.get(open + 1..close)?.trim().to_string();
            let name = rest
                .get(close + 1..)?
                .trim_start_matches(':')
                .split_once(" - ")
                .map(|(_, name)| name.trim().to_string())
                .unwrap_or_else(|| id.clone());
            Some(AlsaCard { index, id, name })
        })
        .collect()
}

/// Parse `/proc/asound/pcm`, e.g.
/// `00-00: ALC892 Analog : ALC892 Analog : playback 1 : capture 1`.
pub fn parse_pcm(text: &str) -> Vec<AlsaPcm> {
    text.lines()
        .filter_map(|line| {
            let (address, rest) = line.split_once(": ")?;
            let (card, device) = address.trim().split_once('-')?;
            let fields: Vec<&str> = rest.split(" : ").map(str::trim).collect();
            let name = fields.get(1).or(fields.first())?.to_string();
            let has = |kind: &str| fields.iter().any(|f| f.starts_with(kind));
            Some(AlsaPcm {
                card: card.parse().ok()?,
                device: device.parse().ok()?,
                name,
                playback: has("playback"),
                capture: has("capture"),
            })
        })
        .collect()
}

/// Build devices for one direction. The first device of card 0 is the
/// default; ALSA has no other marker.
pub fn devices_from_proc(
    cards: &[AlsaCard],
    pcms: &[AlsaPcm],
    direction: Direction,
) -> Vec<AudioDevice> {
    let mut default_taken = false;
    pcms.iter()
        .filter(|pcm| match direction {
            Direction::Playback => pcm.playback,
            Direction::Capture => pcm.capture,
        })
        .map(|pcm| {
            let card_id = cards
                .iter()
                .find(|c| c.index == pcm.card)
                .map(|c| c.id.as_str())
                .unwrap_or("");
            let is_default = pcm.card == 0 && !default_taken;
            if is_default {
                default_taken = true;
            }
            AudioDevice {
                id: format!("hw:{},{}", pcm.card, pcm.device),
                display_name: format!("{} {}", card_id, pcm.name).trim().to_string(),
                direction,
                is_default,
                backend: BackendKind::Alsa,
                synthetic: false,
            }
        })
        .collect()
}

/// `hw:1,0` (or `plughw:1,0`) to `(1, 0)`.
pub fn parse_hw_id(id: &str) -> Option<(u32, u32)> {
    let rest = id.strip_prefix("hw:").or_else(|| id.strip_prefix("plughw:"))?;
    let (card, device) = rest.split_once(',').unwrap_or((rest, "0"));
    Some((card.trim().parse().ok()?, device.trim().parse().ok()?))
}

/// Read `defaults.pcm.card` back from an asound configuration.
pub fn configured_default_card(text: &str) -> Option<u32> {
    text.lines().find_map(|line| {
        line.trim()
            .strip_prefix("defaults.pcm.card")
            .and_then(|v| v.trim().parse().ok())
    })
}

fn percent_from_raw(raw: i64, min: i64, max: i64) -> u8 {
    if max <= min {
        return 0;
    }
    // floor here and ceil in raw_from_percent keep percent -> raw -> percent
    // stable for any control with at least 100 steps
    (((raw - min) * 100) / (max - min)).clamp(0, 100) as u8
}

fn raw_from_percent(percent: u8, min: i64, max: i64) -> i64 {
    if max <= min {
        return min;
    }
    min + (i64::from(percent) * (max - min) + 99) / 100
}

fn alsa_err(e: alsa::Error) -> AudioError {
    AudioError::backend(format!("alsa: {}", e))
}

fn controls(direction: Direction) -> &'static [&'static str] {
    match direction {
        Direction::Playback => PLAYBACK_CONTROLS,
        Direction::Capture => CAPTURE_CONTROLS,
    }
}

fn with_selem<T>(
    direction: Direction,
    f: impl Fn(&Selem<'_>) -> Result<T, AudioError>,
) -> Result<T, AudioError> {
    let mixer = Mixer::new(MIXER_CARD, false).map_err(alsa_err)?;
    for name in controls(direction) {
        let sid = SelemId::new(name, 0);
        if let Some(selem) = mixer.find_selem(&sid) {
            let usable = match direction {
                Direction::Playback => selem.has_playback_volume(),
                Direction::Capture => selem.has_capture_volume(),
            };
            if usable {
                return f(&selem);
            }
        }
    }
    Err(AudioError::backend(format!(
        "no {} mixer control among {:?}",
        direction,
        controls(direction)
    )))
}

fn read_mixer(direction: Direction) -> Result<MixerState, AudioError> {
    with_selem(direction, |selem| {
        let channel = SelemChannelId::FrontLeft;
        let (volume_percent, muted) = match direction {
            Direction::Playback => {
                let (min, max) = selem.get_playback_volume_range();
                let raw = selem.get_playback_volume(channel).map_err(alsa_err)?;
                let muted = selem.has_playback_switch()
                    && selem.get_playback_switch(channel).map_err(alsa_err)? == 0;
                (percent_from_raw(raw, min, max), muted)
            }
            Direction::Capture => {
                let (min, max) = selem.get_capture_volume_range();
                let raw = selem.get_capture_volume(channel).map_err(alsa_err)?;
                let muted = selem.has_capture_switch()
                    && selem.get_capture_switch(channel).map_err(alsa_err)? == 0;
                (percent_from_raw(raw, min, max), muted)
            }
        };
        Ok(MixerState {
            direction,
            volume_percent,
            muted,
        })
    })
}

fn write_volume(direction: Direction, percent: u8) -> Result<(), AudioError> {
    with_selem(direction, |selem| match direction {
        Direction::Playback => {
            let (min, max) = selem.get_playback_volume_range();
            selem
                .set_playback_volume_all(raw_from_percent(percent, min, max))
                .map_err(alsa_err)
        }
        Direction::Capture => {
            let (min, max) = selem.get_capture_volume_range();
            selem
                .set_capture_volume_all(raw_from_percent(percent, min, max))
                .map_err(alsa_err)
        }
    })
}

fn write_mute(direction: Direction, muted: bool) -> Result<(), AudioError> {
    // switch on = audible
    let value = if muted { 0 } else { 1 };
    with_selem(direction, |selem| match direction {
        Direction::Playback if selem.has_playback_switch() => {
            selem.set_playback_switch_all(value).map_err(alsa_err)
        }
        Direction::Capture if selem.has_capture_switch() => {
            selem.set_capture_switch_all(value).map_err(alsa_err)
        }
        _ => Err(AudioError::backend("mixer control has no mute switch")),
    })
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, AudioError> + Send + 'static,
) -> Result<T, AudioError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AudioError::backend(format!("mixer task failed: {}", e)))?
}

fn aplay_args(device: Option<&str>, path: &Path) -> Vec<String> {
    let mut args = vec!["-q".to_string()];
    if let Some(device) = device {
        args.push("-D".to_string());
        args.push(device.to_string());
    }
    args.push(path.display().to_string());
    args
}

pub struct AlsaDriver {
    proc_asound: PathBuf,
    asoundrc: PathBuf,
    recorder: String,
    player: PlayerSettings,
    control_timeout: std::time::Duration,
}

impl AlsaDriver {
    pub fn new(config: &Config) -> Self {
        Self {
            proc_asound: config.proc_asound.clone(),
            asoundrc: config.asoundrc.clone(),
            recorder: config.recorder_alsa.clone(),
            player: PlayerSettings {
                primary: config.player_primary.clone(),
                fallback: config.player_alsa_fallback.clone(),
                fallback_args: aplay_args,
                audio_output: "alsa",
                control_timeout: config.control_timeout,
            },
            control_timeout: config.control_timeout,
        }
    }
}

#[async_trait]
impl BackendDriver for AlsaDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Alsa
    }

    async fn enumerate(&self, direction: Direction) -> Result<Vec<AudioDevice>, AudioError> {
        let cards = tokio::fs::read_to_string(self.proc_asound.join("cards")).await?;
        let pcm = tokio::fs::read_to_string(self.proc_asound.join("pcm")).await?;
        Ok(devices_from_proc(
            &parse_cards(&cards),
            &parse_pcm(&pcm),
            direction,
        ))
    }

    async fn get_volume(&self, direction: Direction) -> Result<MixerState, AudioError> {
        blocking(move || read_mixer(direction)).await
    }

    async fn set_volume(&self, direction: Direction, percent: u8) -> Result<(), AudioError> {
        blocking(move || write_volume(direction, percent)).await
    }

    async fn set_mute(&self, direction: Direction, muted: bool) -> Result<(), AudioError> {
        blocking(move || write_mute(direction, muted)).await
    }

    /// ALSA has a single default card for both directions; the direction is
    /// accepted for interface symmetry.
    async fn set_default(&self, _direction: Direction, device_id: &str) -> Result<(), AudioError> {
        let (card, device) = parse_hw_id(device_id)
            .ok_or_else(|| AudioError::backend(format!("{} is not an ALSA hw id", device_id)))?;

        let content = format!(
            "defaults.pcm.card {card}\ndefaults.pcm.device {device}\ndefaults.ctl.card {card}\n"
        );
        tokio::fs::write(&self.asoundrc, content).await?;

        let written = tokio::fs::read_to_string(&self.asoundrc).await?;
        if configured_default_card(&written) == Some(card) {
            log::info!("ALSA default card set to {} in {}", card, self.asoundrc.display());
            Ok(())
        } else {
            Err(AudioError::backend(format!(
                "{} did not keep the new default card",
                self.asoundrc.display()
            )))
        }
    }

    async fn play(&self, request: &PlayRequest) -> Result<PlayerProcess, AudioError> {
        let mut request = request.clone();
        // plughw converts formats the hardware cannot take directly
        request.device_id = request.device_id.map(|id| match parse_hw_id(&id) {
            Some((card, device)) => format!("plughw:{},{}", card, device),
            None => id,
        });
        player::launch(&self.player, &request).await
    }

    fn control_channel(&self, endpoint: &str) -> Arc<dyn ControlChannel> {
        Arc::new(MpvIpc::new(PathBuf::from(endpoint), self.control_timeout))
    }

    async fn record_with_format(
        &self,
        device_id: &str,
        format: &SampleFormat,
    ) -> Result<Box<dyn Supervised>, AudioError> {
        let args = vec![
            "-q".to_string(),
            "-D".to_string(),
            device_id.to_string(),
            "-f".to_string(),
            format.encoding.clone(),
            "-r".to_string(),
            format.rate.to_string(),
            "-c".to_string(),
            format.channels.to_string(),
            "-t".to_string(),
            "raw".to_string(),
        ];
        let process = ManagedProcess::spawn(
            &self.recorder,
            &args,
            SpawnOptions {
                pipe_stdout: true,
                kill_on_drop: true,
            },
        )?;
        Ok(Box::new(process))
    }
}
