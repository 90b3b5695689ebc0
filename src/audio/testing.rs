//! In-memory drivers, processes and control channels for unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream};

use super::backend::{Backends, BackendDriver, ControlChannel, PlayerProcess, adopt_pid};
use super::types::{AudioDevice, BackendKind, Direction, MixerState, PlayRequest, SampleFormat};
use crate::config::Config;
use crate::error::AudioError;
use crate::process::{CommandRunner, OutputReader, Supervised};

/// Config with fast timings and all paths below `dir`.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::new().unwrap();
    config.state_file = dir.join("state").join("playback.json");
    config.ipc_dir = dir.join("ipc");
    config.asoundrc = dir.join("asound.conf");
    config.proc_asound = dir.join("proc");
    config.media_root = dir.join("media");
    config.ready_interval = Duration::from_millis(5);
    config.terminate_grace = Duration::from_millis(50);
    config.capture_grace = Duration::from_millis(30);
    config.capture_attempt_timeout = Duration::from_millis(200);
    config.control_timeout = Duration::from_millis(50);
    config.name_kill_fallback = false;
    config
}

pub fn device(id: &str, direction: Direction, is_default: bool, backend: BackendKind) -> AudioDevice {
    AudioDevice {
        id: id.to_string(),
        display_name: id.to_string(),
        direction,
        is_default,
        backend,
        synthetic: false,
    }
}

/// Replies keyed by `"program arg1 arg2"`; anything unscripted is `NotFound`.
#[derive(Default)]
pub struct ScriptedRunner {
    replies: Mutex<HashMap<String, Result<String, AudioError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, command: &str, reply: Result<String, AudioError>) {
        self.replies.lock().unwrap().insert(command.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, AudioError> {
        let key = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(key.clone());
        self.replies
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(Err(AudioError::NotFound(key)))
    }
}

static NEXT_PID: AtomicU32 = AtomicU32::new(40_000);

pub struct FakeProcess {
    pid: u32,
    alive: Arc<AtomicBool>,
    output: Option<OutputReader>,
    writer: Option<DuplexStream>,
}

impl FakeProcess {
    pub fn new(alive: bool) -> Self {
        Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(AtomicBool::new(alive)),
            output: None,
            writer: None,
        }
    }

    /// A process whose stdout already holds `payload` and stays open until
    /// the process is terminated.
    pub async fn with_output(alive: bool, payload: &[u8]) -> Self {
        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        writer.write_all(payload).await.unwrap();
        let mut process = Self::new(alive);
        process.output = Some(Box::new(reader));
        // a process that already exited has closed its stdout
        process.writer = alive.then_some(writer);
        process
    }

    /// Shares the liveness of an already spawned fake.
    pub fn attached(pid: u32, alive: Arc<AtomicBool>) -> Self {
        Self {
            pid,
            alive,
            output: None,
            writer: None,
        }
    }

    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }
}

#[async_trait]
impl Supervised for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn wait(&mut self) {
        while self.alive.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.writer = None;
    }

    async fn terminate(&mut self, _grace: Duration) {
        self.alive.store(false, Ordering::SeqCst);
        self.writer = None;
    }

    fn take_output(&mut self) -> Option<OutputReader> {
        self.output.take()
    }
}

#[derive(Debug, Clone)]
pub struct FakePlayerState {
    pub path: PathBuf,
    pub position: f64,
    pub paused: bool,
    /// Simulates a player that stopped answering while still running.
    pub deaf: bool,
}

/// Speaks the subset of the mpv IPC protocol the controller uses.
pub struct FakeControl {
    endpoint: String,
    alive: Arc<AtomicBool>,
    pub state: Mutex<FakePlayerState>,
}

impl FakeControl {
    pub fn advance(&self, seconds: f64) {
        self.state.lock().unwrap().position += seconds;
    }

    pub fn set_deaf(&self, deaf: bool) {
        self.state.lock().unwrap().deaf = deaf;
    }
}

#[async_trait]
impl ControlChannel for FakeControl {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn request(&self, command: Vec<Value>) -> Result<Value, AudioError> {
        let mut state = self.state.lock().unwrap();
        if !self.alive.load(Ordering::SeqCst) {
            return Err(AudioError::backend("connection refused"));
        }
        if state.deaf {
            return Err(AudioError::Timeout("fake player is deaf".into()));
        }
        let verb = command.first().and_then(Value::as_str).unwrap_or("");
        let name = command.get(1).and_then(Value::as_str).unwrap_or("");
        match (verb, name) {
            ("get_property", "time-pos") => Ok(json!(state.position)),
            ("get_property", "pause") => Ok(json!(state.paused)),
            ("get_property", "path") => Ok(json!(state.path.display().to_string())),
            ("set_property", "pause") => {
                state.paused = command.get(2).and_then(Value::as_bool).unwrap_or(false);
                Ok(Value::Null)
            }
            ("seek", _) => {
                state.position = command.get(1).and_then(Value::as_f64).unwrap_or(0.0);
                Ok(Value::Null)
            }
            _ => Err(AudioError::backend(format!("unsupported command {:?}", command))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerMode {
    Controllable,
    /// Fire-and-forget fallback player.
    Degraded,
    /// Spawns but never answers on the control channel.
    NeverReady,
    SpawnFails,
}

pub struct SpawnedPlayer {
    pub pid: u32,
    pub path: PathBuf,
    pub seek_seconds: f64,
    pub alive: Arc<AtomicBool>,
    pub control: Option<Arc<FakeControl>>,
}

pub struct FakeDriver {
    kind: BackendKind,
    devices: Mutex<HashMap<Direction, Result<Vec<AudioDevice>, AudioError>>>,
    mixer: Mutex<HashMap<Direction, MixerState>>,
    mixer_fails: AtomicBool,
    reads_fail: AtomicBool,
    default_fails: AtomicBool,
    pub default_calls: Mutex<Vec<(Direction, String)>>,
    player_mode: Mutex<PlayerMode>,
    pub players: Mutex<Vec<SpawnedPlayer>>,
    controls: Mutex<HashMap<String, Arc<FakeControl>>>,
    accepted_formats: Mutex<Option<HashSet<SampleFormat>>>,
    dead_devices: Mutex<HashSet<String>>,
    pub record_attempts: Mutex<Vec<(String, SampleFormat)>>,
    recorders: Mutex<Vec<(String, Arc<AtomicBool>)>>,
    pub capture_payload: Vec<u8>,
}

impl FakeDriver {
    pub fn new(kind: BackendKind) -> Self {
        let mut mixer = HashMap::new();
        for direction in [Direction::Playback, Direction::Capture] {
            mixer.insert(
                direction,
                MixerState {
                    direction,
                    volume_percent: 50,
                    muted: false,
                },
            );
        }
        Self {
            kind,
            devices: Mutex::new(HashMap::new()),
            mixer: Mutex::new(mixer),
            mixer_fails: AtomicBool::new(false),
            reads_fail: AtomicBool::new(false),
            default_fails: AtomicBool::new(false),
            default_calls: Mutex::new(Vec::new()),
            player_mode: Mutex::new(PlayerMode::Controllable),
            players: Mutex::new(Vec::new()),
            controls: Mutex::new(HashMap::new()),
            accepted_formats: Mutex::new(None),
            dead_devices: Mutex::new(HashSet::new()),
            record_attempts: Mutex::new(Vec::new()),
            recorders: Mutex::new(Vec::new()),
            capture_payload: b"\x01\x02\x03\x04".to_vec(),
        }
    }

    pub fn set_devices(&self, direction: Direction, devices: Result<Vec<AudioDevice>, AudioError>) {
        self.devices.lock().unwrap().insert(direction, devices);
    }

    pub fn fail_mixer(&self, fail: bool) {
        self.mixer_fails.store(fail, Ordering::SeqCst);
    }

    /// Writes keep working; only reading the mixer back fails.
    pub fn fail_mixer_reads(&self, fail: bool) {
        self.reads_fail.store(fail, Ordering::SeqCst);
    }

    pub fn fail_set_default(&self, fail: bool) {
        self.default_fails.store(fail, Ordering::SeqCst);
    }

    pub fn set_player_mode(&self, mode: PlayerMode) {
        *self.player_mode.lock().unwrap() = mode;
    }

    pub fn accept_only(&self, formats: &[SampleFormat]) {
        *self.accepted_formats.lock().unwrap() = Some(formats.iter().cloned().collect());
    }

    /// Every recorder started on `device_id` exits immediately.
    pub fn kill_device(&self, device_id: &str) {
        self.dead_devices.lock().unwrap().insert(device_id.to_string());
    }

    pub fn live_players(&self) -> usize {
        self.players
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.alive.load(Ordering::SeqCst))
            .count()
    }

    pub fn last_control(&self) -> Option<Arc<FakeControl>> {
        self.players
            .lock()
            .unwrap()
            .last()
            .and_then(|p| p.control.clone())
    }

    /// Kill the most recent player behind the controller's back.
    pub fn kill_last_player(&self) {
        if let Some(player) = self.players.lock().unwrap().last() {
            player.alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn attempts(&self) -> Vec<(String, SampleFormat)> {
        self.record_attempts.lock().unwrap().clone()
    }

    pub fn live_recorders(&self, device_id: &str) -> usize {
        self.recorders
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, alive)| id == device_id && alive.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl BackendDriver for FakeDriver {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn enumerate(&self, direction: Direction) -> Result<Vec<AudioDevice>, AudioError> {
        self.devices
            .lock()
            .unwrap()
            .get(&direction)
            .cloned()
            .unwrap_or(Ok(Vec::new()))
    }

    async fn get_volume(&self, direction: Direction) -> Result<MixerState, AudioError> {
        if self.mixer_fails.load(Ordering::SeqCst) || self.reads_fail.load(Ordering::SeqCst) {
            return Err(AudioError::backend("mixer offline"));
        }
        Ok(self.mixer.lock().unwrap()[&direction])
    }

    async fn set_volume(&self, direction: Direction, percent: u8) -> Result<(), AudioError> {
        if self.mixer_fails.load(Ordering::SeqCst) {
            return Err(AudioError::backend("mixer offline"));
        }
        assert!(percent <= 100, "unclamped volume reached the driver");
        if let Some(state) = self.mixer.lock().unwrap().get_mut(&direction) {
            state.volume_percent = percent;
        }
        Ok(())
    }

    async fn set_mute(&self, direction: Direction, muted: bool) -> Result<(), AudioError> {
        if self.mixer_fails.load(Ordering::SeqCst) {
            return Err(AudioError::backend("mixer offline"));
        }
        if let Some(state) = self.mixer.lock().unwrap().get_mut(&direction) {
            state.muted = muted;
        }
        Ok(())
    }

    async fn set_default(&self, direction: Direction, device_id: &str) -> Result<(), AudioError> {
        self.default_calls
            .lock()
            .unwrap()
            .push((direction, device_id.to_string()));
        if self.default_fails.load(Ordering::SeqCst) {
            return Err(AudioError::backend("default rejected"));
        }
        Ok(())
    }

    async fn play(&self, request: &PlayRequest) -> Result<PlayerProcess, AudioError> {
        let mode = *self.player_mode.lock().unwrap();
        if mode == PlayerMode::SpawnFails {
            return Err(AudioError::NotFound("fake-player".into()));
        }

        let process = FakeProcess::new(true);
        let pid = process.pid;
        let alive = process.alive_flag();
        let endpoint = request.control_endpoint.display().to_string();
        let control = match mode {
            PlayerMode::Degraded => None,
            _ => {
                let control = Arc::new(FakeControl {
                    endpoint: endpoint.clone(),
                    alive: alive.clone(),
                    state: Mutex::new(FakePlayerState {
                        path: request.path.clone(),
                        position: request.seek_seconds,
                        paused: false,
                        deaf: mode == PlayerMode::NeverReady,
                    }),
                });
                self.controls
                    .lock()
                    .unwrap()
                    .insert(endpoint, control.clone());
                Some(control)
            }
        };

        self.players.lock().unwrap().push(SpawnedPlayer {
            pid,
            path: request.path.clone(),
            seek_seconds: request.seek_seconds,
            alive,
            control: control.clone(),
        });

        Ok(PlayerProcess {
            process: Box::new(process),
            control: control.map(|c| c as Arc<dyn ControlChannel>),
            program: "fake-player".to_string(),
        })
    }

    fn control_channel(&self, endpoint: &str) -> Arc<dyn ControlChannel> {
        match self.controls.lock().unwrap().get(endpoint) {
            Some(control) => control.clone(),
            None => Arc::new(FakeControl {
                endpoint: endpoint.to_string(),
                alive: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(FakePlayerState {
                    path: PathBuf::new(),
                    position: 0.0,
                    paused: false,
                    deaf: false,
                }),
            }),
        }
    }

    /// Fake players by their fake PID; any other PID goes through the real
    /// identity check.
    fn adopt_process(&self, pid: u32, names: &[String]) -> Option<Box<dyn Supervised>> {
        let alive = self
            .players
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.pid == pid)
            .map(|p| p.alive.clone());
        match alive {
            Some(alive) => Some(Box::new(FakeProcess::attached(pid, alive))),
            None => adopt_pid(pid, names),
        }
    }

    async fn record_with_format(
        &self,
        device_id: &str,
        format: &SampleFormat,
    ) -> Result<Box<dyn Supervised>, AudioError> {
        self.record_attempts
            .lock()
            .unwrap()
            .push((device_id.to_string(), format.clone()));

        let dead = self.dead_devices.lock().unwrap().contains(device_id);
        let accepted = match &*self.accepted_formats.lock().unwrap() {
            Some(formats) => formats.contains(format),
            None => true,
        };
        let process = FakeProcess::with_output(!dead && accepted, &self.capture_payload).await;
        self.recorders
            .lock()
            .unwrap()
            .push((device_id.to_string(), process.alive_flag()));
        Ok(Box::new(process))
    }
}

/// Two fake drivers wired as backend A and backend B.
pub fn fake_backends() -> (Arc<FakeDriver>, Arc<FakeDriver>, Backends) {
    let alsa = Arc::new(FakeDriver::new(BackendKind::Alsa));
    let pulse = Arc::new(FakeDriver::new(BackendKind::Pulse));
    let backends = Backends::new(alsa.clone(), pulse.clone());
    (alsa, pulse, backends)
}
