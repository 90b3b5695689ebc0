use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    player: Player,
    recorder: Recorder,
    timing: Timing,
    paths: Paths,
    bridge: Bridge,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Player {
    primary: String,
    alsa_fallback: String,
    pulse_fallback: String,
    known_names: String,
    name_kill_fallback: bool,
}

#[derive(Deserialize)]
struct Recorder {
    alsa: String,
    pulse: String,
    formats: String,
    chunk_size: usize,
}

#[derive(Deserialize)]
struct Timing {
    command_timeout_ms: u64,
    control_timeout_ms: u64,
    ready_attempts: u32,
    ready_interval_ms: u64,
    terminate_grace_ms: u64,
    capture_attempt_timeout_ms: u64,
    capture_grace_ms: u64,
}

#[derive(Deserialize)]
struct Paths {
    state_file: String,
    ipc_dir: String,
    asoundrc: String,
    proc_asound: String,
    media_root: String,
}

#[derive(Deserialize)]
struct Bridge {
    local_ip: String,
    local_port: u16,
    stream_target: String,
    buffer_size: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 播放器配置
    println!("cargo:rustc-env=PLAYER_PRIMARY={}", config.player.primary);
    println!("cargo:rustc-env=PLAYER_ALSA_FALLBACK={}", config.player.alsa_fallback);
    println!("cargo:rustc-env=PLAYER_PULSE_FALLBACK={}", config.player.pulse_fallback);
    println!("cargo:rustc-env=PLAYER_KNOWN_NAMES={}", config.player.known_names);
    println!("cargo:rustc-env=PLAYER_NAME_KILL_FALLBACK={}", config.player.name_kill_fallback);

    // 录音配置
    println!("cargo:rustc-env=RECORDER_ALSA={}", config.recorder.alsa);
    println!("cargo:rustc-env=RECORDER_PULSE={}", config.recorder.pulse);
    println!("cargo:rustc-env=RECORDER_FORMATS={}", config.recorder.formats);
    println!("cargo:rustc-env=RECORDER_CHUNK_SIZE={}", config.recorder.chunk_size);

    // 超时配置
    println!("cargo:rustc-env=COMMAND_TIMEOUT_MS={}", config.timing.command_timeout_ms);
    println!("cargo:rustc-env=CONTROL_TIMEOUT_MS={}", config.timing.control_timeout_ms);
    println!("cargo:rustc-env=READY_ATTEMPTS={}", config.timing.ready_attempts);
    println!("cargo:rustc-env=READY_INTERVAL_MS={}", config.timing.ready_interval_ms);
    println!("cargo:rustc-env=TERMINATE_GRACE_MS={}", config.timing.terminate_grace_ms);
    println!("cargo:rustc-env=CAPTURE_ATTEMPT_TIMEOUT_MS={}", config.timing.capture_attempt_timeout_ms);
    println!("cargo:rustc-env=CAPTURE_GRACE_MS={}", config.timing.capture_grace_ms);

    // 路径配置
    println!("cargo:rustc-env=STATE_FILE={}", config.paths.state_file);
    println!("cargo:rustc-env=IPC_DIR={}", config.paths.ipc_dir);
    println!("cargo:rustc-env=ASOUNDRC={}", config.paths.asoundrc);
    println!("cargo:rustc-env=PROC_ASOUND={}", config.paths.proc_asound);
    println!("cargo:rustc-env=MEDIA_ROOT={}", config.paths.media_root);

    // 控制桥配置
    println!("cargo:rustc-env=BRIDGE_LOCAL_IP={}", config.bridge.local_ip);
    println!("cargo:rustc-env=BRIDGE_LOCAL_PORT={}", config.bridge.local_port);
    println!("cargo:rustc-env=BRIDGE_STREAM_TARGET={}", config.bridge.stream_target);
    println!("cargo:rustc-env=BRIDGE_BUFFER_SIZE={}", config.bridge.buffer_size);
}
