// packages/runner/src/runtime/process_manager.rs
//! Process manager for spawning and stopping the worker process
//!
//! The worker runs with piped stdio: stdin/stdout carry the protocol,
//! stderr is forwarded to the runner's log.

use crate::run::RunState;
use crate::utils::config::WorkerConfig;
use crate::utils::errors::{Result, RunnerError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Configuration for spawning the worker
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    /// Executable, either a path or a name looked up on `PATH`
    pub program: PathBuf,

    /// Arguments
    pub args: Vec<String>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Environment variables, applied in order (later entries win)
    pub env_vars: Vec<(String, String)>,
}

impl SpawnConfig {
    /// Spawn settings for `worker` running with `state`
    ///
    /// Configured extra environment comes first so the run state always
    /// wins over it.
    pub fn for_worker(worker: &WorkerConfig, state: &RunState) -> Result<Self> {
        let mut env_vars: Vec<(String, String)> = worker
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env_vars.extend(state.worker_env()?);

        Ok(Self {
            program: worker.path.clone(),
            args: worker.args.clone(),
            work_dir: worker.working_directory.clone(),
            env_vars,
        })
    }
}

/// Process manager for the worker process
#[derive(Debug, Clone)]
pub struct ProcessManager {
    /// How long a process gets between SIGTERM and SIGKILL
    kill_grace: Duration,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    /// Resolve the program to an executable path
    fn find_executable(&self, program: &Path) -> Result<PathBuf> {
        if program.components().count() > 1 {
            if program.is_file() {
                return Ok(program.to_path_buf());
            }
            return Err(RunnerError::Worker(format!(
                "Worker executable {:?} does not exist",
                program
            )));
        }

        which::which(program).map_err(|e| {
            RunnerError::Worker(format!(
                "Executable {:?} not found in PATH: {}",
                program, e
            ))
        })
    }

    /// Spawn the worker process
    pub fn spawn(&self, config: &SpawnConfig) -> Result<Child> {
        let executable = self.find_executable(&config.program)?;

        debug!("Spawning worker process: {:?}", executable);

        let mut command = Command::new(&executable);
        command.args(&config.args);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            RunnerError::Worker(format!("Failed to spawn {:?}: {}", executable, e))
        })?;

        info!("Worker process started with PID {:?}", child.id());
        Ok(child)
    }

    /// Stop a child: SIGTERM, then SIGKILL once the grace period runs out
    pub async fn terminate(&self, child: &mut Child) -> Result<std::process::ExitStatus> {
        if let Some(pid) = child.id() {
            debug!("Sending SIGTERM to PID {}", pid);
            if let Err(e) = send_signal(pid, nix::sys::signal::Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to PID {}: {}", pid, e);
            }
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!("Worker did not exit within {:?}, sending SIGKILL", self.kill_grace);
                child.kill().await?;
                Ok(child.wait().await?)
            }
        }
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| RunnerError::Worker(format!("Failed to send {}: {}", signal, e)))
}
