//! Task execution runtime contract.
//!
//! The coordinator and worker treat container execution as a
//! capability: [`Runtime::run`] executes one task to completion (or
//! cancellation), [`Runtime::health_check`] gates heartbeat status.
//! The crate ships [`ShellRuntime`], which executes run scripts
//! through the system shell; a Docker-backed implementation plugs in
//! behind the same trait.

mod shell;

pub use shell::ShellRuntime;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use drover_core::{Task, TaskLogPart};

/// Where runtimes send captured output chunks. The worker forwards
/// them onto the broker's `logs` queue.
pub type LogSink = mpsc::UnboundedSender<TaskLogPart>;

/// Runtime error type.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The task's cancellation token fired mid-run.
    #[error("task was cancelled")]
    Cancelled,

    /// The task's deadline elapsed before it finished.
    #[error("timeout: exceeded {0}")]
    Timeout(String),

    /// The process could not be started.
    #[error("failed to start task: {0}")]
    Spawn(String),

    /// The task ran and exited non-zero.
    #[error("exited with status {code}")]
    NonZeroExit { code: i32 },

    /// The task has nothing to execute or is missing its work mount.
    #[error("task is not runnable: {0}")]
    NotRunnable(String),

    /// I/O failure while driving the process.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the runtime crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// The container-execution capability.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Execute `task` to completion. Cancelling `token` must stop the
    /// underlying process promptly. Captured output goes to `logs`.
    async fn run(&self, token: CancellationToken, task: &Task, logs: LogSink) -> Result<()>;

    /// Cheap liveness probe used by worker heartbeats.
    async fn health_check(&self) -> Result<()>;
}
