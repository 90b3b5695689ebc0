//! Backend B: the PulseAudio server (or pipewire-pulse) through `pactl`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::backend::{BackendDriver, ControlChannel, PlayerProcess};
use super::player::{self, MpvIpc, PlayerSettings};
use super::types::{AudioDevice, BackendKind, Direction, MixerState, PlayRequest, SampleFormat};
use crate::config::Config;
use crate::error::AudioError;
use crate::process::{CommandRunner, ManagedProcess, SpawnOptions, Supervised};

const PACTL: &str = "pactl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDefaults {
    pub sink: Option<String>,
    pub source: Option<String>,
}

/// Names from `pactl list short sinks|sources`. Tab separated, name in the
/// second column. Monitor sources mirror sinks and are not capture devices.
pub fn parse_short_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.ends_with(".monitor"))
        .map(String::from)
        .collect()
}

/// The `Default Sink:` / `Default Source:` markers from `pactl info`.
pub fn parse_info(text: &str) -> ServerDefaults {
    let field = |key: &str| {
        text.lines()
            .find_map(|line| line.trim().strip_prefix(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    ServerDefaults {
        sink: field("Default Sink:"),
        source: field("Default Source:"),
    }
}

/// First percentage in `pactl get-sink-volume` output, e.g.
/// `Volume: front-left: 32768 /  50% / -18.06 dB, ...`.
pub fn parse_volume(text: &str) -> Option<u8> {
    text.split_whitespace()
        .find_map(|token| token.strip_suffix('%'))
        .and_then(|v| v.parse::<i64>().ok())
        .map(super::types::clamp_percent)
}

/// `Mute: yes` / `Mute: no`.
pub fn parse_mute(text: &str) -> Option<bool> {
    text.lines()
        .find_map(|line| line.trim().strip_prefix("Mute:"))
        .map(|v| v.trim() == "yes")
}

fn target(direction: Direction) -> (&'static str, &'static str) {
    match direction {
        Direction::Playback => ("sink", "@DEFAULT_SINK@"),
        Direction::Capture => ("source", "@DEFAULT_SOURCE@"),
    }
}

fn paplay_args(device: Option<&str>, path: &Path) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(device) = device {
        args.push(format!("--device={}", device));
    }
    args.push(path.display().to_string());
    args
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

pub struct PulseDriver {
    runner: Arc<dyn CommandRunner>,
    recorder: String,
    player: PlayerSettings,
    control_timeout: Duration,
}

impl PulseDriver {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            recorder: config.recorder_pulse.clone(),
            player: PlayerSettings {
                primary: config.player_primary.clone(),
                fallback: config.player_pulse_fallback.clone(),
                fallback_args: paplay_args,
                audio_output: "pulse",
                control_timeout: config.control_timeout,
            },
            control_timeout: config.control_timeout,
        }
    }

    async fn pactl(&self, args: &[&str]) -> Result<String, AudioError> {
        self.runner.run(PACTL, &owned(args)).await
    }
}

#[async_trait]
impl BackendDriver for PulseDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Pulse
    }

    async fn enumerate(&self, direction: Direction) -> Result<Vec<AudioDevice>, AudioError> {
        let (kind, _) = target(direction);
        let listing = self.pactl(&["list", "short", format!("{}s", kind).as_str()]).await?;
        // a missing default marker only loses the flag, not the list
        let defaults = match self.pactl(&["info"]).await {
            Ok(info) => parse_info(&info),
            Err(e) => {
                log::warn!("pactl info failed, no default marker: {}", e);
                ServerDefaults {
                    sink: None,
                    source: None,
                }
            }
        };
        let default_name = match direction {
            Direction::Playback => defaults.sink,
            Direction::Capture => defaults.source,
        };

        Ok(parse_short_list(&listing)
            .into_iter()
            .map(|name| AudioDevice {
                is_default: default_name.as_deref() == Some(name.as_str()),
                display_name: name.clone(),
                id: name,
                direction,
                backend: BackendKind::Pulse,
                synthetic: false,
            })
            .collect())
    }

    async fn get_volume(&self, direction: Direction) -> Result<MixerState, AudioError> {
        let (kind, name) = target(direction);
        let volume_out = self.pactl(&[format!("get-{}-volume", kind).as_str(), name]).await?;
        let mute_out = self.pactl(&[format!("get-{}-mute", kind).as_str(), name]).await?;

        let volume_percent = parse_volume(&volume_out)
            .ok_or_else(|| AudioError::backend(format!("unparseable volume: {}", volume_out.trim())))?;
        let muted = parse_mute(&mute_out)
            .ok_or_else(|| AudioError::backend(format!("unparseable mute: {}", mute_out.trim())))?;

        Ok(MixerState {
            direction,
            volume_percent,
            muted,
        })
    }

    async fn set_volume(&self, direction: Direction, percent: u8) -> Result<(), AudioError> {
        let (kind, name) = target(direction);
        self.pactl(&[format!("set-{}-volume", kind).as_str(), name, format!("{}%", percent).as_str()])
            .await
            .map(|_| ())
    }

    async fn set_mute(&self, direction: Direction, muted: bool) -> Result<(), AudioError> {
        let (kind, name) = target(direction);
        let flag = if muted { "1" } else { "0" };
        self.pactl(&[format!("set-{}-mute", kind).as_str(), name, flag])
            .await
            .map(|_| ())
    }

    async fn set_default(&self, direction: Direction, device_id: &str) -> Result<(), AudioError> {
        let (kind, _) = target(direction);
        self.pactl(&[format!("set-default-{}", kind).as_str(), device_id]).await?;
        log::info!("Pulse default {} set to {}", kind, device_id);
        Ok(())
    }

    async fn play(&self, request: &PlayRequest) -> Result<PlayerProcess, AudioError> {
        player::launch(&self.player, request).await
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
            format!("--device={}", device_id),
            format!("--format={}", format.pulse_encoding()),
            format!("--rate={}", format.rate),
            format!("--channels={}", format.channels),
            "--raw".to_string(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::ScriptedRunner;

    const SINKS: &str = "0\talsa_output.pci-0000_00_1f.3.analog-stereo\tmodule-alsa-card.c\ts16le 2ch 48000Hz\tSUSPENDED
1\tbluez_sink.00_1B_66_AA_BB_CC.a2dp_sink\tmodule-bluez5-device.c\ts16le 2ch 44100Hz\tRUNNING
";
    const SOURCES: &str = "0\talsa_output.pci-0000_00_1f.3.analog-stereo.monitor\tmodule-alsa-card.c\ts16le 2ch 48000Hz\tSUSPENDED
1\talsa_input.usb-Generic_USB_Mic-00.mono-fallback\tmodule-alsa-card.c\ts16le 1ch 48000Hz\tRUNNING
";
    const INFO: &str = "Server String: /run/user/1000/pulse/native
Server Name: PulseAudio (on PipeWire 0.3.48)
Default Sink: bluez_sink.00_1B_66_AA_BB_CC.a2dp_sink
Default Source: alsa_input.usb-Generic_USB_Mic-00.mono-fallback
Cookie: 5a4e:0b1d
";

    fn driver(runner: Arc<ScriptedRunner>) -> PulseDriver {
        PulseDriver::new(&Config::new().unwrap(), runner)
    }

    #[test]
    fn short_list_skips_monitors() {
        assert_eq!(
            parse_short_list(SOURCES),
            vec!["alsa_input.usb-Generic_USB_Mic-00.mono-fallback".to_string()]
        );
        assert_eq!(parse_short_list(SINKS).len(), 2);
        assert!(parse_short_list("").is_empty());
    }

    #[test]
    fn info_defaults() {
        let defaults = parse_info(INFO);
        assert_eq!(
            defaults.sink.as_deref(),
            Some("bluez_sink.00_1B_66_AA_BB_CC.a2dp_sink")
        );
        assert!(defaults.source.unwrap().starts_with("alsa_input.usb"));
        assert_eq!(parse_info("Server Name: x\n").sink, None);
    }

    #[test]
    fn volume_and_mute_parsing() {
        let out = "Volume: front-left: 32768 /  50% / -18.06 dB,   front-right: 32768 /  50% / -18.06 dB\n        balance 0.00\n";
        assert_eq!(parse_volume(out), Some(50));
        assert_eq!(parse_volume("Volume: mono: 98304 / 150% / 10.57 dB"), Some(100));
        assert_eq!(parse_volume("garbage"), None);
        assert_eq!(parse_mute("Mute: yes\n"), Some(true));
        assert_eq!(parse_mute("Mute: no\n"), Some(false));
        assert_eq!(parse_mute(""), None);
    }

    #[tokio::test]
    async fn enumerate_marks_server_default() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("pactl list short sinks", Ok(SINKS.to_string()));
        runner.respond("pactl info", Ok(INFO.to_string()));

        let devices = driver(runner).enumerate(Direction::Playback).await.unwrap();
        assert_eq!(devices.len(), 2);
        assert!(!devices[0].is_default);
        assert!(devices[1].is_default);
        assert_eq!(devices[1].backend, BackendKind::Pulse);
    }

    #[tokio::test]
    async fn enumerate_survives_missing_info() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("pactl list short sources", Ok(SOURCES.to_string()));

        let devices = driver(runner).enumerate(Direction::Capture).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].is_default);
    }

    #[tokio::test]
    async fn volume_commands_target_default_source() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("pactl get-source-volume @DEFAULT_SOURCE@", Ok("Volume: mono: 26214 /  40% / -23.88 dB\n".into()));
        runner.respond("pactl get-source-mute @DEFAULT_SOURCE@", Ok("Mute: no\n".into()));
        runner.respond("pactl set-source-volume @DEFAULT_SOURCE@ 70%", Ok(String::new()));
        runner.respond("pactl set-source-mute @DEFAULT_SOURCE@ 1", Ok(String::new()));

        let driver = driver(runner.clone());
        let state = driver.get_volume(Direction::Capture).await.unwrap();
        assert_eq!(state.volume_percent, 40);
        assert!(!state.muted);

        driver.set_volume(Direction::Capture, 70).await.unwrap();
        driver.set_mute(Direction::Capture, true).await.unwrap();
        assert!(runner.calls().contains(&"pactl set-source-volume @DEFAULT_SOURCE@ 70%".to_string()));
    }

    #[tokio::test]
    async fn unscripted_command_is_an_error() {
        let runner = Arc::new(ScriptedRunner::new());
        let err = driver(runner)
            .set_default(Direction::Playback, "bluez_sink.x")
            .await
            .unwrap_err();
        assert!(matches!(err, AudioError::NotFound(_)));
    }
}
