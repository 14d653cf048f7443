//! Shell runtime: executes run scripts through the system shell.
//!
//! The worker prepares a work directory containing the task's run
//! script and attaches it as the bind mount targeting
//! [`drover_core::WORK_DIR`]. This runtime executes the script from
//! that directory directly on the host, pointing
//! [`drover_core::OUTPUT_ENV`] at the host-side output file. Tasks
//! that declare `cmd` instead of `run` are executed verbatim.
//!
//! `image` is accepted and ignored: the shell runtime exists for
//! standalone installs and tests where container isolation is not
//! wanted. Resource limits are likewise ignored.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use drover_core::{Mount, MountType, Task, TaskLogPart};

use crate::{LogSink, Result, Runtime, RuntimeError};

/// Runtime that runs tasks as host shell processes.
#[derive(Clone, Default)]
pub struct ShellRuntime;

impl ShellRuntime {
    pub fn new() -> Self {
        Self
    }

    fn work_mount(task: &Task) -> Option<&Mount> {
        task.mounts
            .iter()
            .find(|m| m.mount_type == MountType::Bind && m.target == drover_core::WORK_DIR)
    }

    /// Forward lines of `reader` to the log sink, sharing `seq` with
    /// the sibling stream so part numbers stay totally ordered.
    fn pump_lines<R>(
        reader: R,
        task_id: String,
        seq: Arc<AtomicU32>,
        logs: LogSink,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let part = TaskLogPart {
                    task_id: task_id.clone(),
                    number: seq.fetch_add(1, Ordering::Relaxed) + 1,
                    contents: line,
                    created_at: chrono::Utc::now(),
                };
                if logs.send(part).is_err() {
                    // Receiver is gone; stop pumping but keep the
                    // process draining via the reader drop.
                    break;
                }
            }
        })
    }
}

#[async_trait]
impl Runtime for ShellRuntime {
    async fn run(&self, token: CancellationToken, task: &Task, logs: LogSink) -> Result<()> {
        let mut command = if !task.run.is_empty() {
            let mount = Self::work_mount(task).ok_or_else(|| {
                RuntimeError::NotRunnable("run script declared but no work mount attached".into())
            })?;
            let mut c = tokio::process::Command::new("sh");
            c.arg(format!("{}/run", mount.source));
            c.current_dir(&mount.source);
            c
        } else if !task.cmd.is_empty() {
            let mut c = tokio::process::Command::new(&task.cmd[0]);
            c.args(&task.cmd[1..]);
            c
        } else {
            return Err(RuntimeError::NotRunnable(
                "task declares neither a run script nor a cmd".into(),
            ));
        };

        command.envs(&task.env);
        if let Some(mount) = Self::work_mount(task) {
            // Redirect output capture at the host-side path.
            command.env(
                drover_core::OUTPUT_ENV,
                format!("{}/output", mount.source),
            );
        }
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(task_id = %task.id, task_name = %task.name, "spawning shell task");
        let mut child = command
            .spawn()
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;

        let seq = Arc::new(AtomicU32::new(0));
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(Self::pump_lines(
                stdout,
                task.id.clone(),
                Arc::clone(&seq),
                logs.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(Self::pump_lines(
                stderr,
                task.id.clone(),
                Arc::clone(&seq),
                logs,
            ));
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = token.cancelled() => {
                warn!(task_id = %task.id, "cancellation requested, killing process");
                let _ = child.kill().await;
                for pump in pumps {
                    pump.abort();
                }
                return Err(RuntimeError::Cancelled);
            }
        };

        // Let the log pumps finish draining buffered output.
        for pump in pumps {
            let _ = pump.await;
        }

        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::NonZeroExit {
                code: status.code().unwrap_or(-1),
            })
        }
    }

    async fn health_check(&self) -> Result<()> {
        let output = tokio::process::Command::new("true")
            .output()
            .await
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::TaskState;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn script_task(dir: &tempfile::TempDir, script: &str) -> Task {
        std::fs::write(dir.path().join("run"), script).unwrap();
        Task {
            id: drover_core::new_id(),
            name: "shell-test".into(),
            state: TaskState::Running,
            run: script.into(),
            mounts: vec![Mount {
                mount_type: MountType::Bind,
                source: dir.path().to_string_lossy().into_owned(),
                target: drover_core::WORK_DIR.to_string(),
            }],
            ..Task::default()
        }
    }

    #[tokio::test]
    async fn runs_script_and_captures_logs() {
        let dir = tempfile::tempdir().unwrap();
        let task = script_task(&dir, "echo hello\necho world >&2\n");
        let (tx, mut rx) = mpsc::unbounded_channel();

        ShellRuntime::new()
            .run(CancellationToken::new(), &task, tx)
            .await
            .unwrap();

        let mut lines = Vec::new();
        while let Ok(part) = rx.try_recv() {
            lines.push(part.contents);
        }
        assert!(lines.contains(&"hello".to_string()));
        assert!(lines.contains(&"world".to_string()));
    }

    #[tokio::test]
    async fn writes_output_file_via_env() {
        let dir = tempfile::tempdir().unwrap();
        let task = script_task(&dir, "printf 42 > \"$DROVER_OUTPUT\"\n");
        let (tx, _rx) = mpsc::unbounded_channel();

        ShellRuntime::new()
            .run(CancellationToken::new(), &task, tx)
            .await
            .unwrap();

        let output = std::fs::read_to_string(dir.path().join("output")).unwrap();
        assert_eq!(output, "42");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let task = script_task(&dir, "exit 3\n");
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = ShellRuntime::new()
            .run(CancellationToken::new(), &task, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NonZeroExit { code: 3 }));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let task = script_task(&dir, "sleep 30\n");
        let (tx, _rx) = mpsc::unbounded_channel();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let err = ShellRuntime::new().run(token, &task, tx).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cmd_tasks_run_without_a_work_mount() {
        let task = Task {
            id: drover_core::new_id(),
            name: "cmd".into(),
            cmd: vec!["true".into()],
            ..Task::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        ShellRuntime::new()
            .run(CancellationToken::new(), &task, tx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn health_check_passes() {
        ShellRuntime::new().health_check().await.unwrap();
    }
}
