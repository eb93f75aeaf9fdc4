// packages/runner/src/runtime/worker.rs
//! The worker process as seen by the orchestrator
//!
//! [`WorkerLauncher`] starts a worker for a run state and hands back a
//! [`RunningWorker`]: its protocol transport, a way to wait for it and a
//! way to stop it. [`CommandLauncher`] does this for a local command.

use crate::protocol::transport::{OutputLine, OutputLineCodec};
use crate::protocol::Transport;
use crate::run::RunState;
use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
use crate::utils::config::WorkerConfig;
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tokio::process::{Child, ChildStderr};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// How the worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, when the process exited normally
    pub code: Option<i32>,

    /// Terminating signal, when the process was killed
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// A started worker
#[async_trait]
pub trait RunningWorker: Send {
    fn pid(&self) -> Option<u32>;

    /// The protocol transport to the worker; `None` once taken
    fn take_transport(&mut self) -> Option<Transport>;

    /// Wait for the worker to exit; cancel-safe
    async fn wait(&mut self) -> Result<WorkerExit>;

    /// Stop the worker, forcefully if it does not exit in time
    async fn terminate(&mut self) -> Result<WorkerExit>;
}

/// Starts workers
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, state: &RunState) -> Result<Box<dyn RunningWorker>>;
}

/// Runs the configured worker command as a child process
pub struct CommandLauncher {
    worker: WorkerConfig,
    manager: ProcessManager,
}

impl CommandLauncher {
    pub fn new(worker: WorkerConfig) -> Self {
        Self {
            worker,
            manager: ProcessManager::new(),
        }
    }

    pub fn with_process_manager(mut self, manager: ProcessManager) -> Self {
        self.manager = manager;
        self
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, state: &RunState) -> Result<Box<dyn RunningWorker>> {
        let config = SpawnConfig::for_worker(&self.worker, state)?;
        let mut child = self.manager.spawn(&config)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::Worker("Failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Worker("Failed to capture worker stdout".into()))?;
        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(forward_stderr(stderr)));

        Ok(Box::new(ChildWorker {
            child,
            transport: Some(Transport::from_io(stdout, stdin)),
            manager: self.manager.clone(),
            stderr_task,
        }))
    }
}

/// Worker running as a local child process
pub struct ChildWorker {
    child: Child,
    transport: Option<Transport>,
    manager: ProcessManager,
    stderr_task: Option<JoinHandle<()>>,
}

#[async_trait]
impl RunningWorker for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_transport(&mut self) -> Option<Transport> {
        self.transport.take()
    }

    async fn wait(&mut self) -> Result<WorkerExit> {
        let status = self.child.wait().await?;
        Ok(status.into())
    }

    async fn terminate(&mut self) -> Result<WorkerExit> {
        info!("Terminating worker process {:?}", self.child.id());
        let status = self.manager.terminate(&mut self.child).await?;
        Ok(status.into())
    }
}

impl Drop for ChildWorker {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Re-emit the worker's stderr as log events
async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = FramedRead::new(stderr, OutputLineCodec::new());
    while let Some(line) = lines.next().await {
        match line {
            Ok(OutputLine::Text(line)) => info!(target: "worker", "{}", line),
            Ok(OutputLine::Oversize) => warn!("Dropped an overlong worker stderr line"),
            Err(e) => {
                warn!("Stopped reading worker stderr: {}", e);
                return;
            }
        }
    }
    debug!("Worker stderr closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::utils::config::WorkerImplementation;
    use futures::SinkExt;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn sh_worker(script: &str) -> WorkerConfig {
        WorkerConfig {
            implementation: WorkerImplementation::Command,
            path: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            working_directory: None,
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_exit_display() {
        assert_eq!(WorkerExit::code(3).to_string(), "exit code 3");
        assert_eq!(WorkerExit::signal(9).to_string(), "signal 9");
        assert!(WorkerExit::code(0).success());
        assert!(!WorkerExit::signal(15).success());
    }

    #[tokio::test]
    async fn test_worker_sees_run_state_env() {
        let launcher =
            CommandLauncher::new(sh_worker(r#"test "$TASKCLUSTER_WORKER_ID" = host-7"#));
        let mut state = RunState::new();
        state.worker_id = "host-7".into();

        let mut worker = launcher.launch(&state).await.unwrap();
        assert!(worker.pid().is_some());
        assert_eq!(worker.wait().await.unwrap(), WorkerExit::code(0));
    }

    #[tokio::test]
    async fn test_transport_carries_stdio() {
        let script = r#"read line; echo "plain output"; case "$line" in *ping*) echo '~{"type":"pong"}';; *) echo '~{"type":"unexpected"}';; esac"#;
        let launcher = CommandLauncher::new(sh_worker(script));
        let mut worker = launcher.launch(&RunState::new()).await.unwrap();

        let (mut reader, mut writer) = worker.take_transport().unwrap().into_parts();
        assert!(worker.take_transport().is_none());

        writer.send(Message::new("ping")).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.name, "pong");
        assert!(worker.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_terminate_running_worker() {
        let launcher = CommandLauncher::new(sh_worker("sleep 30"))
            .with_process_manager(ProcessManager::new().with_kill_grace(Duration::from_secs(2)));
        let mut worker = launcher.launch(&RunState::new()).await.unwrap();

        let exit = worker.terminate().await.unwrap();
        assert!(!exit.success());
    }
}
