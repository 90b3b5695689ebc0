//! External process primitives shared by playback and capture.
//!
//! Short commands go through [`CommandRunner`] and are always bounded by a
//! timeout. Long-lived processes (player, recorder) are held behind the
//! [`Supervised`] trait so controllers own an explicit handle instead of a
//! detached child.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

use crate::error::AudioError;

const SIGNAL_TIMEOUT: Duration = Duration::from_secs(1);
const PID_POLL_INTERVAL: Duration = Duration::from_millis(50);
const COMM_LEN: usize = 15;

/// Runs a short external command and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, AudioError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
pub struct ShellRunner {
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, AudioError> {
        log::debug!("exec: {} {}", program, args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AudioError::Timeout(format!(
                    "{} did not finish within {}ms",
                    program,
                    self.timeout.as_millis()
                )));
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AudioError::backend(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )))
        }
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> AudioError {
    if e.kind() == std::io::ErrorKind::NotFound {
        AudioError::NotFound(program.to_string())
    } else {
        AudioError::backend(format!("failed to spawn {}: {}", program, e))
    }
}

pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Handle to a long-lived external process.
#[async_trait]
pub trait Supervised: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness check.
    fn is_alive(&mut self) -> bool;

    /// Resolves once the process has exited.
    async fn wait(&mut self);

    /// SIGTERM, then SIGKILL once `grace` has elapsed.
    async fn terminate(&mut self, grace: Duration);

    /// The process stdout, if it was piped. Can only be taken once.
    fn take_output(&mut self) -> Option<OutputReader> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnOptions {
    pub pipe_stdout: bool,
    pub kill_on_drop: bool,
}

/// A child process spawned and owned by this crate.
pub struct ManagedProcess {
    name: String,
    child: Child,
}

impl ManagedProcess {
    pub fn spawn(
        program: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<Self, AudioError> {
        let stdout = if options.pipe_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::null())
            .kill_on_drop(options.kill_on_drop)
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        log::info!(
            "Spawned {} (pid {:?}): {}",
            program,
            child.id(),
            args.join(" ")
        );

        Ok(Self {
            name: program.to_string(),
            child,
        })
    }
}

#[async_trait]
impl Supervised for ManagedProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait(&mut self) {
        if let Err(e) = self.child.wait().await {
            log::warn!("wait on {} failed: {}", self.name, e);
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }
        if let Some(pid) = self.child.id() {
            send_signal(pid, "TERM").await;
        }
        if timeout(grace, self.child.wait()).await.is_err() {
            log::warn!(
                "{} ignored SIGTERM for {}ms, killing",
                self.name,
                grace.as_millis()
            );
            if let Err(e) = self.child.kill().await {
                log::error!("Failed to kill {}: {}", self.name, e);
            }
        }
    }

    fn take_output(&mut self) -> Option<OutputReader> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as OutputReader)
    }
}

/// A process known only by PID, e.g. a player re-adopted from persisted state
/// after a restart of this service.
pub struct PidProcess {
    pid: u32,
}

impl PidProcess {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

#[async_trait]
impl Supervised for PidProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&mut self) -> bool {
        pid_alive(self.pid)
    }

    async fn wait(&mut self) {
        while pid_alive(self.pid) {
            sleep(PID_POLL_INTERVAL).await;
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        if !pid_alive(self.pid) {
            return;
        }
        send_signal(self.pid, "TERM").await;
        let pid = self.pid;
        let exited = timeout(grace, async {
            while pid_alive(pid) {
                sleep(PID_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok();
        if !exited {
            log::warn!("pid {} ignored SIGTERM, killing", self.pid);
            send_signal(self.pid, "KILL").await;
        }
    }
}

/// True if `/proc/<pid>` exists and is not a zombie.
pub fn pid_alive(pid: u32) -> bool {
    let stat = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(s) => s,
        Err(_) => return false,
    };
    // state is the first field after the parenthesised comm
    match stat.rfind(')') {
        Some(idx) => !matches!(stat[idx + 1..].trim_start().chars().next(), Some('Z') | Some('X')),
        None => true,
    }
}

/// True if the running `pid` has one of `names` as its command name.
///
/// The kernel truncates `comm` to 15 bytes, so names are compared the same way.
pub fn pid_is_one_of(pid: u32, names: &[String]) -> bool {
    let comm = match std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let comm = comm.trim_end();
    pid_alive(pid)
        && names.iter().any(|name| {
            let base = Path::new(name)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(name);
            base.bytes().take(COMM_LEN).eq(comm.bytes())
        })
}

async fn send_signal(pid: u32, signal: &str) -> bool {
    let status = Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match timeout(SIGNAL_TIMEOUT, status).await {
        Ok(Ok(s)) => s.success(),
        Ok(Err(e)) => {
            log::warn!("kill -{} {} failed: {}", signal, pid, e);
            false
        }
        Err(_) => {
            log::warn!("kill -{} {} timed out", signal, pid);
            false
        }
    }
}

/// Kill every process whose name matches exactly.
///
/// Last resort for players that detached from their parent or stopped
/// answering on the control channel. It can hit an unrelated process with the
/// same name, so callers only reach for it after PID-based termination.
pub async fn kill_by_name(runner: &dyn CommandRunner, names: &[String]) -> usize {
    let mut killed = 0;
    for name in names {
        let args = vec!["-x".to_string(), name.clone()];
        match runner.run("pkill", &args).await {
            Ok(_) => {
                log::warn!("Name-based kill matched processes named {}", name);
                killed += 1;
            }
            // pkill exits 1 when nothing matched
            Err(e) => log::debug!("pkill {}: {}", name, e),
        }
    }
    killed
}

/// Looks `program` up on `PATH` (or checks it directly if it contains a `/`).
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        return path.is_file().then(|| path.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
