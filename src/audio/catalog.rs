//! Device enumeration across backends, with human readable names.

use super::backend::Backends;
use super::types::{AudioDevice, BackendKind, Direction};
use crate::error::AudioError;

/// Backend asked first for each direction.
fn preferred(direction: Direction) -> BackendKind {
    match direction {
        Direction::Playback => BackendKind::Alsa,
        Direction::Capture => BackendKind::Pulse,
    }
}

/// Stand-in used when no backend reports a device.
fn synthetic(direction: Direction) -> AudioDevice {
    let (id, backend) = match direction {
        Direction::Playback => ("default", BackendKind::Alsa),
        Direction::Capture => ("@DEFAULT_SOURCE@", BackendKind::Pulse),
    };
    AudioDevice {
        id: id.to_string(),
        display_name: friendly_name("default", direction),
        direction,
        is_default: true,
        backend,
        synthetic: true,
    }
}

#[derive(Clone)]
pub struct DeviceCatalog {
    backends: Backends,
}

impl DeviceCatalog {
    pub fn new(backends: Backends) -> Self {
        Self { backends }
    }

    /// Playback devices followed by capture devices.
    pub async fn enumerate(&self) -> Vec<AudioDevice> {
        let mut devices = self.enumerate_direction(Direction::Playback).await;
        devices.extend(self.enumerate_direction(Direction::Capture).await);
        devices
    }

    /// Never empty: falls back to the other backend, then to a synthetic
    /// default device.
    pub async fn enumerate_direction(&self, direction: Direction) -> Vec<AudioDevice> {
        for driver in self.backends.in_order(preferred(direction)) {
            match driver.enumerate(direction).await {
                Ok(devices) if !devices.is_empty() => {
                    log::debug!(
                        "{} {} devices from {}",
                        devices.len(),
                        direction,
                        driver.kind()
                    );
                    return devices
                        .into_iter()
                        .map(|mut device| {
                            device.display_name = friendly_name(&device.display_name, direction);
                            device
                        })
                        .collect();
                }
                Ok(_) => log::info!("{} reports no {} devices", driver.kind(), direction),
                Err(e) => log::warn!("{} {} enumeration failed: {}", driver.kind(), direction, e),
            }
        }
        log::warn!("no {} devices found, using synthetic default", direction);
        vec![synthetic(direction)]
    }

    pub async fn default_device(&self, direction: Direction) -> AudioDevice {
        let devices = self.enumerate_direction(direction).await;
        let fallback = devices[0].clone();
        devices
            .into_iter()
            .find(|d| d.is_default)
            .unwrap_or(fallback)
    }

    /// Resolve an explicit device id reported by [`Self::enumerate`].
    pub async fn find(&self, direction: Direction, id: &str) -> Result<AudioDevice, AudioError> {
        self.enumerate_direction(direction)
            .await
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| AudioError::DeviceUnavailable(format!("no {} device {}", direction, id)))
    }
}

enum Pattern {
    /// `alc` followed by at least one digit, e.g. `ALC3246`.
    AlcChipset,
    Contains(&'static str),
}

impl Pattern {
    fn matches(&self, lower: &str) -> bool {
        match self {
            Pattern::AlcChipset => lower.match_indices("alc").any(|(i, _)| {
                lower[i + 3..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit())
            }),
            Pattern::Contains(needle) => lower.contains(needle),
        }
    }
}

/// First matching rule wins. Labels are `(playback, capture)`.
const NAME_RULES: &[(Pattern, &str, &str)] = &[
    (Pattern::Contains("bluez"), "Bluetooth Speaker", "Bluetooth Microphone"),
    (Pattern::Contains("bluetooth"), "Bluetooth Speaker", "Bluetooth Microphone"),
    (Pattern::Contains("hdmi"), "HDMI Output", "HDMI Input"),
    (Pattern::Contains("usb"), "USB Speaker", "USB Microphone"),
    (Pattern::AlcChipset, "Built-in Speaker", "Built-in Microphone"),
    (Pattern::Contains("bcm2835"), "Headphone Jack", "Built-in Microphone"),
    (Pattern::Contains("wm8960"), "Audio HAT Speaker", "Audio HAT Microphone"),
    (Pattern::Contains("seeed"), "Audio HAT Speaker", "Audio HAT Microphone"),
    (Pattern::Contains("mic"), "Microphone", "Microphone"),
    (Pattern::Contains("speaker"), "Speaker", "Speaker"),
];

const PREFIXES: &[&str] = &[
    "alsa_output.",
    "alsa_input.",
    "bluez_sink.",
    "bluez_source.",
    "plughw:",
    "hw:",
];
const SUFFIXES: &[&str] = &[".analog-stereo", ".monitor", "-stereo", ".mono-fallback"];

/// Map a backend device name to a label a person would recognise.
pub fn friendly_name(raw: &str, direction: Direction) -> String {
    let lower = raw.to_ascii_lowercase();
    if lower == "default" || lower.starts_with("@default") {
        return match direction {
            Direction::Playback => "Default Output".to_string(),
            Direction::Capture => "Default Input".to_string(),
        };
    }

    for (pattern, playback, capture) in NAME_RULES {
        if pattern.matches(&lower) {
            return match direction {
                Direction::Playback => playback.to_string(),
                Direction::Capture => capture.to_string(),
            };
        }
    }
    clean(raw)
}

fn clean(raw: &str) -> String {
    let mut name = raw.trim();
    for prefix in PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest;
            break;
        }
    }
    let mut stripped = true;
    while stripped {
        stripped = false;
        for suffix in SUFFIXES {
            if let Some(rest) = name.strip_suffix(suffix) {
                name = rest;
                stripped = true;
            }
        }
    }

    let words: Vec<String> = name
        .split(|c: char| matches!(c, '_' | '-' | '.' | ',' | ':') || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(title_case)
        .collect();
    if words.is_empty() {
        raw.trim().to_string()
    } else {
        words.join(" ")
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{device, fake_backends};

    #[test]
    fn friendly_names_follow_rule_order() {
        assert_eq!(friendly_name("PCH ALC3246 Analog", Direction::Playback), "Built-in Speaker");
        assert_eq!(friendly_name("PCH ALC3246 Analog", Direction::Capture), "Built-in Microphone");
        assert_eq!(friendly_name("bluez_sink.00_11_22.a2dp_sink", Direction::Playback), "Bluetooth Speaker");
        assert_eq!(friendly_name("vc4hdmi0 MAI PCM", Direction::Playback), "HDMI Output");
        assert_eq!(friendly_name("alsa_input.usb-0d8c_C-Media.mono-fallback", Direction::Capture), "USB Microphone");
        assert_eq!(friendly_name("bcm2835 Headphones", Direction::Playback), "Headphone Jack");
        // "alc" without a digit is not a chipset
        assert_eq!(friendly_name("Calcium", Direction::Playback), "Calcium");
    }

    #[test]
    fn unmatched_names_are_cleaned() {
        assert_eq!(
            friendly_name("alsa_output.platform-sound.analog-stereo", Direction::Playback),
            "Platform Sound"
        );
        assert_eq!(friendly_name("hw:Loopback", Direction::Playback), "Loopback");
        assert_eq!(friendly_name("default", Direction::Capture), "Default Input");
    }

    #[tokio::test]
    async fn playback_prefers_alsa_and_capture_prefers_pulse() {
        let (alsa, pulse, backends) = fake_backends();
        alsa.set_devices(
            Direction::Playback,
            Ok(vec![device("hw:0,0", Direction::Playback, true, BackendKind::Alsa)]),
        );
        pulse.set_devices(
            Direction::Playback,
            Ok(vec![device("sink", Direction::Playback, true, BackendKind::Pulse)]),
        );
        alsa.set_devices(
            Direction::Capture,
            Ok(vec![device("hw:0,0", Direction::Capture, true, BackendKind::Alsa)]),
        );
        pulse.set_devices(
            Direction::Capture,
            Ok(vec![device("source", Direction::Capture, true, BackendKind::Pulse)]),
        );

        let devices = DeviceCatalog::new(backends).enumerate().await;
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].backend, BackendKind::Alsa);
        assert_eq!(devices[1].id, "source");
    }

    #[tokio::test]
    async fn empty_backend_falls_back_to_the_other() {
        let (alsa, pulse, backends) = fake_backends();
        alsa.set_devices(Direction::Playback, Ok(Vec::new()));
        pulse.set_devices(
            Direction::Playback,
            Ok(vec![device("sink", Direction::Playback, true, BackendKind::Pulse)]),
        );

        let devices = DeviceCatalog::new(backends)
            .enumerate_direction(Direction::Playback)
            .await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].backend, BackendKind::Pulse);
        assert!(!devices[0].synthetic);
    }

    #[tokio::test]
    async fn both_backends_failing_yields_one_synthetic_device() {
        let (alsa, pulse, backends) = fake_backends();
        for driver in [&alsa, &pulse] {
            for direction in [Direction::Playback, Direction::Capture] {
                driver.set_devices(direction, Err(AudioError::backend("down")));
            }
        }

        let catalog = DeviceCatalog::new(backends);
        let playback = catalog.enumerate_direction(Direction::Playback).await;
        assert_eq!(playback.len(), 1);
        assert!(playback[0].synthetic && playback[0].is_default);
        assert_eq!(playback[0].id, "default");

        let capture = catalog.default_device(Direction::Capture).await;
        assert_eq!(capture.id, "@DEFAULT_SOURCE@");
        assert_eq!(capture.backend, BackendKind::Pulse);
    }

    #[tokio::test]
    async fn find_resolves_ids_and_rejects_unknown() {
        let (alsa, _pulse, backends) = fake_backends();
        alsa.set_devices(
            Direction::Playback,
            Ok(vec![
                device("hw:0,0", Direction::Playback, true, BackendKind::Alsa),
                device("hw:1,0", Direction::Playback, false, BackendKind::Alsa),
            ]),
        );
        let catalog = DeviceCatalog::new(backends);
        assert_eq!(catalog.find(Direction::Playback, "hw:1,0").await.unwrap().id, "hw:1,0");
        assert!(matches!(
            catalog.find(Direction::Playback, "hw:9,0").await,
            Err(AudioError::DeviceUnavailable(_))
        ));
    }
}
