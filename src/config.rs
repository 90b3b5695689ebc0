use std::path::PathBuf;
use std::time::Duration;

use crate::audio::SampleFormat;

#[derive(Debug, Clone)]
pub struct Config {
    // 播放器配置
    pub player_primary: String,
    pub player_alsa_fallback: String,
    pub player_pulse_fallback: String,
    pub player_known_names: Vec<String>,
    pub name_kill_fallback: bool,

    // 录音配置
    pub recorder_alsa: String,
    pub recorder_pulse: String,
    pub capture_formats: Vec<SampleFormat>,
    pub capture_chunk_size: usize,

    // 超时配置
    pub command_timeout: Duration,
    pub control_timeout: Duration,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    pub terminate_grace: Duration,
    pub capture_attempt_timeout: Duration,
    pub capture_grace: Duration,

    // 路径配置
    pub state_file: PathBuf,
    pub ipc_dir: PathBuf,
    pub asoundrc: PathBuf,
    pub proc_asound: PathBuf,
    pub media_root: PathBuf,

    // 控制桥配置
    pub bridge_local_ip: String,
    pub bridge_local_port: u16,
    pub bridge_stream_target: String,
    pub bridge_buffer_size: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            player_primary: env!("PLAYER_PRIMARY").to_string(),
            player_alsa_fallback: env!("PLAYER_ALSA_FALLBACK").to_string(),
            player_pulse_fallback: env!("PLAYER_PULSE_FALLBACK").to_string(),
            player_known_names: split_list(env!("PLAYER_KNOWN_NAMES")),
            name_kill_fallback: env!("PLAYER_NAME_KILL_FALLBACK").parse()
                .map_err(|_| "Failed to parse PLAYER_NAME_KILL_FALLBACK")?,

            recorder_alsa: env!("RECORDER_ALSA").to_string(),
            recorder_pulse: env!("RECORDER_PULSE").to_string(),
            capture_formats: split_list(env!("RECORDER_FORMATS"))
                .iter()
                .map(|s| s.parse())
                .collect::<Result<Vec<SampleFormat>, _>>()
                .map_err(|_| "Failed to parse RECORDER_FORMATS")?,
            capture_chunk_size: env!("RECORDER_CHUNK_SIZE").parse()
                .map_err(|_| "Failed to parse RECORDER_CHUNK_SIZE")?,

            command_timeout: millis(env!("COMMAND_TIMEOUT_MS"))
                .ok_or("Failed to parse COMMAND_TIMEOUT_MS")?,
            control_timeout: millis(env!("CONTROL_TIMEOUT_MS"))
                .ok_or("Failed to parse CONTROL_TIMEOUT_MS")?,
            ready_attempts: env!("READY_ATTEMPTS").parse()
                .map_err(|_| "Failed to parse READY_ATTEMPTS")?,
            ready_interval: millis(env!("READY_INTERVAL_MS"))
                .ok_or("Failed to parse READY_INTERVAL_MS")?,
            terminate_grace: millis(env!("TERMINATE_GRACE_MS"))
                .ok_or("Failed to parse TERMINATE_GRACE_MS")?,
            capture_attempt_timeout: millis(env!("CAPTURE_ATTEMPT_TIMEOUT_MS"))
                .ok_or("Failed to parse CAPTURE_ATTEMPT_TIMEOUT_MS")?,
            capture_grace: millis(env!("CAPTURE_GRACE_MS"))
                .ok_or("Failed to parse CAPTURE_GRACE_MS")?,

            state_file: PathBuf::from(env!("STATE_FILE")),
            ipc_dir: PathBuf::from(env!("IPC_DIR")),
            asoundrc: PathBuf::from(env!("ASOUNDRC")),
            proc_asound: PathBuf::from(env!("PROC_ASOUND")),
            media_root: PathBuf::from(env!("MEDIA_ROOT")),

            bridge_local_ip: env!("BRIDGE_LOCAL_IP").to_string(),
            bridge_local_port: env!("BRIDGE_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse BRIDGE_LOCAL_PORT")?,
            bridge_stream_target: env!("BRIDGE_STREAM_TARGET").to_string(),
            bridge_buffer_size: env!("BRIDGE_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse BRIDGE_BUFFER_SIZE")?,
        })
    }

    pub fn app_name() -> &'static str {
        env!("APP_NAME")
    }

    pub fn app_version() -> &'static str {
        env!("APP_VERSION")
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn millis(raw: &str) -> Option<Duration> {
    raw.parse().ok().map(Duration::from_millis)
}
