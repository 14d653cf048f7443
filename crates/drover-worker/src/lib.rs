//! The drover worker: consumes tasks from broker queues, executes
//! them against a [`Runtime`], and reports state transitions back to
//! the coordinator.
//!
//! A worker subscribes to its exclusive queue (`x-<workerId>`, for
//! directed dispatch and cancellations) plus each configured shared
//! work queue at the requested concurrency. Every running task holds a
//! cancellation token in a concurrent map; a directed message with
//! state Cancelled fires that token and the runtime kills the
//! process.
//!
//! Execution protocol per task: report `started`, prepare shared
//! volumes, run `pre` steps, run the main step (with optional
//! timeout and output capture), run `post` steps, report `completed`
//! or `error`. A cancelled task reports nothing; the coordinator
//! already considers it terminal.

mod heartbeat;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use drover_broker::{Broker, BrokerError};
use drover_core::queue::{QUEUE_COMPLETED, QUEUE_ERROR, QUEUE_STARTED, exclusive_queue, is_worker_queue};
use drover_core::{Mount, MountType, Task, TaskState};
use drover_runtime::{Runtime, RuntimeError};

/// Largest output file the worker will read back into `task.result`.
const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Worker error type.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("task {task_id} arrived in invalid state {state}")]
    InvalidState { task_id: String, state: TaskState },

    #[error("workspace error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the worker crate.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Default resource limits applied to tasks that declare none.
#[derive(Debug, Clone, Default)]
pub struct WorkerLimits {
    pub default_cpus: String,
    pub default_memory: String,
}

/// Worker construction parameters.
pub struct WorkerConfig {
    pub broker: Arc<dyn Broker>,
    pub runtime: Arc<dyn Runtime>,
    /// Shared work queues and their concurrency. Empty means
    /// `{default: 1}`.
    pub queues: HashMap<String, usize>,
    pub limits: WorkerLimits,
    /// Parent directory for per-task scratch space. Defaults to the
    /// system temp dir.
    pub tempdir: Option<PathBuf>,
}

struct Inner {
    id: String,
    started_at: DateTime<Utc>,
    broker: Arc<dyn Broker>,
    runtime: Arc<dyn Runtime>,
    queues: HashMap<String, usize>,
    active: DashMap<String, CancellationToken>,
    limits: WorkerLimits,
    tempdir: PathBuf,
    stop: CancellationToken,
    logs: mpsc::UnboundedSender<drover_core::TaskLogPart>,
}

/// A node-local task executor. Cheaply cloneable.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Worker {
        let mut queues = config.queues;
        if queues.is_empty() {
            queues.insert(drover_core::queue::QUEUE_DEFAULT.to_string(), 1);
        }
        let (logs_tx, logs_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            inner: Arc::new(Inner {
                id: drover_core::new_id(),
                started_at: Utc::now(),
                broker: config.broker,
                runtime: config.runtime,
                queues,
                active: DashMap::new(),
                limits: config.limits,
                tempdir: config
                    .tempdir
                    .unwrap_or_else(std::env::temp_dir),
                stop: CancellationToken::new(),
                logs: logs_tx,
            }),
        };
        worker.spawn_log_forwarder(logs_rx);
        worker
    }

    /// This worker's node id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Subscribe to all queues and start heartbeating.
    pub async fn start(&self) -> Result<()> {
        info!(worker_id = %self.inner.id, "starting worker");

        // Exclusive queue: directed tasks and cancellations.
        self.subscribe(&exclusive_queue(&self.inner.id)).await?;

        // Shared work queues at their configured concurrency.
        for (queue, concurrency) in &self.inner.queues {
            if !is_worker_queue(queue) {
                warn!(queue = %queue, "ignoring reserved queue in worker config");
                continue;
            }
            for _ in 0..*concurrency {
                self.subscribe(queue).await?;
            }
        }

        heartbeat::start(self.clone());
        Ok(())
    }

    /// Stop heartbeating and cancel all in-flight tasks. In-flight
    /// containers get killed through their cancellation tokens; no
    /// grace period beyond the runtime's own.
    pub fn stop(&self) {
        info!(worker_id = %self.inner.id, "stopping worker");
        self.inner.stop.cancel();
        for entry in self.inner.active.iter() {
            entry.value().cancel();
        }
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    async fn subscribe(&self, queue: &str) -> Result<()> {
        let worker = self.clone();
        self.inner
            .broker
            .subscribe_tasks(
                queue,
                Arc::new(move |task: Task| {
                    let worker = worker.clone();
                    Box::pin(async move {
                        worker
                            .handle_task(task)
                            .await
                            .map_err(|e| BrokerError::Handler(e.to_string()))
                    })
                }),
            )
            .await?;
        Ok(())
    }

    async fn handle_task(&self, task: Task) -> Result<()> {
        debug!(task_id = %task.id, state = %task.state, "received task");
        match task.state {
            TaskState::Scheduled => self.run_task(task).await,
            TaskState::Cancelled => {
                self.cancel_task(&task);
                Ok(())
            }
            state => Err(WorkerError::InvalidState {
                task_id: task.id,
                state,
            }),
        }
    }

    /// Fire the cancellation token of a running task. Unknown ids are
    /// a no-op: the worker may have already finished the task.
    fn cancel_task(&self, task: &Task) {
        match self.inner.active.remove(&task.id) {
            Some((_, token)) => {
                info!(task_id = %task.id, "cancelling task");
                token.cancel();
            }
            None => debug!(task_id = %task.id, "unknown task, nothing to cancel"),
        }
    }

    async fn run_task(&self, mut task: Task) -> Result<()> {
        let token = self.inner.stop.child_token();
        self.inner.active.insert(task.id.clone(), token.clone());
        let result = self.execute(&mut task, token).await;
        self.inner.active.remove(&task.id);
        result
    }

    async fn execute(&self, task: &mut Task, token: CancellationToken) -> Result<()> {
        task.started_at = Some(Utc::now());
        task.state = TaskState::Running;
        task.node_id = self.inner.id.clone();
        self.inner.broker.publish_task(QUEUE_STARTED, task).await?;

        self.apply_default_limits(task);

        // Fresh scratch dir per named volume, shared across pre, main,
        // and post. The TempDir guards delete everything on return.
        let mut volume_guards = Vec::new();
        for mount in &mut task.mounts {
            if mount.mount_type == MountType::Volume {
                let dir = tempfile::Builder::new()
                    .prefix("vol-")
                    .tempdir_in(&self.inner.tempdir)?;
                *mount = Mount {
                    mount_type: MountType::Bind,
                    source: dir.path().to_string_lossy().into_owned(),
                    target: mount.target.clone(),
                };
                volume_guards.push(dir);
            }
        }

        // Pre steps run in the same volume/limit context; a failure
        // fails the whole task without running the main step.
        for pre in task.pre.clone() {
            if let Err(err) = self.run_step(task, pre, &token).await {
                return self.report_step_failure(task, err, "pre-task").await;
            }
        }

        let main = task.clone();
        if let Err(err) = self.run_step(task, main, &token).await {
            return self.report_step_failure(task, err, "task").await;
        }

        for post in task.post.clone() {
            if let Err(err) = self.run_step(task, post, &token).await {
                return self.report_step_failure(task, err, "post-task").await;
            }
        }

        task.completed_at = Some(Utc::now());
        task.state = TaskState::Completed;
        self.inner.broker.publish_task(QUEUE_COMPLETED, task).await?;
        Ok(())
    }

    /// Execute one step (pre, main, or post) of `owner`. The step
    /// inherits the owner's volumes and limits, gets a fresh run dir
    /// bind-mounted at the work path, and writes its output back into
    /// `owner.result` (only the main step produces one in practice;
    /// later steps overwrite earlier results).
    async fn run_step(
        &self,
        owner: &mut Task,
        mut step: Task,
        token: &CancellationToken,
    ) -> std::result::Result<(), RuntimeError> {
        // Log parts of every step attach to the owning task.
        step.id = owner.id.clone();
        step.mounts = owner.mounts.clone();
        step.limits = owner.limits.clone();

        let rundir = tempfile::Builder::new()
            .prefix("drover-")
            .tempdir_in(&self.inner.tempdir)
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;
        std::fs::write(rundir.path().join("run"), &step.run)
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;

        step.mounts.push(Mount {
            mount_type: MountType::Bind,
            source: rundir.path().to_string_lossy().into_owned(),
            target: drover_core::WORK_DIR.to_string(),
        });
        step.env.insert(
            drover_core::OUTPUT_ENV.to_string(),
            drover_core::OUTPUT_PATH.to_string(),
        );

        let run = self
            .inner
            .runtime
            .run(token.clone(), &step, self.inner.logs.clone());
        match step.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result?,
                // Dropping the run future kills the container.
                Err(_) => return Err(RuntimeError::Timeout(humantime_fmt(limit))),
            },
            None => run.await?,
        }

        // Bounded read of the output file, if the step produced one.
        let output_path = rundir.path().join("output");
        if let Ok(meta) = std::fs::metadata(&output_path) {
            if meta.len() > MAX_OUTPUT_BYTES {
                return Err(RuntimeError::NotRunnable(format!(
                    "output file exceeds {MAX_OUTPUT_BYTES} bytes"
                )));
            }
            owner.result = std::fs::read_to_string(&output_path)
                .map_err(|e| RuntimeError::Spawn(format!("error reading output file: {e}")))?;
        }
        Ok(())
    }

    /// Publish the owner task as Failed on the error queue, unless the
    /// failure was a cancellation (the coordinator already considers a
    /// cancelled task terminal and a report would race it).
    async fn report_step_failure(
        &self,
        task: &mut Task,
        err: RuntimeError,
        step_kind: &str,
    ) -> Result<()> {
        if matches!(err, RuntimeError::Cancelled) {
            info!(task_id = %task.id, "task cancelled, not reporting a terminal state");
            return Ok(());
        }
        error!(task_id = %task.id, error = %err, "error processing {step_kind}");
        task.failed_at = Some(Utc::now());
        task.state = TaskState::Failed;
        task.error = err.to_string();
        self.inner.broker.publish_task(QUEUE_ERROR, task).await?;
        Ok(())
    }

    fn apply_default_limits(&self, task: &mut Task) {
        let defaults = &self.inner.limits;
        if defaults.default_cpus.is_empty() && defaults.default_memory.is_empty() {
            return;
        }
        let limits = task.limits.get_or_insert_with(Default::default);
        if limits.cpus.is_empty() {
            limits.cpus = defaults.default_cpus.clone();
        }
        if limits.memory.is_empty() {
            limits.memory = defaults.default_memory.clone();
        }
    }

    fn spawn_log_forwarder(
        &self,
        mut rx: mpsc::UnboundedReceiver<drover_core::TaskLogPart>,
    ) {
        let broker = Arc::clone(&self.inner.broker);
        tokio::spawn(async move {
            while let Some(part) = rx.recv().await {
                if let Err(err) = broker.publish_task_log_part(&part).await {
                    debug!(error = %err, "dropping task log part");
                }
            }
        });
    }
}

fn humantime_fmt(d: std::time::Duration) -> String {
    humantime::format_duration(d).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use drover_broker::InMemoryBroker;
    use drover_runtime::ShellRuntime;
    use std::time::Duration;
    use tokio::sync::mpsc as tokio_mpsc;

    async fn started_and_terminal_queues(
        broker: &InMemoryBroker,
    ) -> (
        tokio_mpsc::UnboundedReceiver<Task>,
        tokio_mpsc::UnboundedReceiver<Task>,
        tokio_mpsc::UnboundedReceiver<Task>,
    ) {
        let (started_tx, started_rx) = tokio_mpsc::unbounded_channel();
        let (completed_tx, completed_rx) = tokio_mpsc::unbounded_channel();
        let (error_tx, error_rx) = tokio_mpsc::unbounded_channel();
        for (queue, tx) in [
            (QUEUE_STARTED, started_tx),
            (QUEUE_COMPLETED, completed_tx),
            (QUEUE_ERROR, error_tx),
        ] {
            broker
                .subscribe_tasks(
                    queue,
                    Arc::new(move |t: Task| {
                        let tx = tx.clone();
                        Box::pin(async move {
                            let _ = tx.send(t);
                            Ok(())
                        })
                    }),
                )
                .await
                .unwrap();
        }
        (started_rx, completed_rx, error_rx)
    }

    fn worker(broker: &InMemoryBroker) -> Worker {
        Worker::new(WorkerConfig {
            broker: Arc::new(broker.clone()),
            runtime: Arc::new(ShellRuntime::new()),
            queues: HashMap::from([("default".to_string(), 2)]),
            limits: WorkerLimits::default(),
            tempdir: None,
        })
    }

    fn scheduled_task(run: &str) -> Task {
        Task {
            id: drover_core::new_id(),
            job_id: drover_core::new_id(),
            name: "t".into(),
            state: TaskState::Scheduled,
            run: run.into(),
            ..Task::default()
        }
    }

    #[tokio::test]
    async fn runs_a_task_and_reports_completed() {
        let broker = InMemoryBroker::new();
        let (mut started, mut completed, _errors) = started_and_terminal_queues(&broker).await;
        let w = worker(&broker);
        w.start().await.unwrap();

        broker
            .publish_task("default", &scheduled_task("printf hello > \"$DROVER_OUTPUT\""))
            .await
            .unwrap();

        let s = started.recv().await.unwrap();
        assert_eq!(s.state, TaskState::Running);
        assert_eq!(s.node_id, w.id());
        assert!(s.started_at.is_some());

        let c = completed.recv().await.unwrap();
        assert_eq!(c.state, TaskState::Completed);
        assert_eq!(c.result, "hello");
        assert!(c.completed_at.is_some());
    }

    #[tokio::test]
    async fn failing_task_reports_error() {
        let broker = InMemoryBroker::new();
        let (_started, _completed, mut errors) = started_and_terminal_queues(&broker).await;
        let w = worker(&broker);
        w.start().await.unwrap();

        broker
            .publish_task("default", &scheduled_task("exit 7"))
            .await
            .unwrap();

        let failed = errors.recv().await.unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(failed.error.contains("status 7"), "got: {}", failed.error);
        assert!(failed.failed_at.is_some());
    }

    #[tokio::test]
    async fn pre_failure_skips_main_step() {
        let broker = InMemoryBroker::new();
        let (_started, mut completed, mut errors) = started_and_terminal_queues(&broker).await;
        let w = worker(&broker);
        w.start().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran-main");
        let mut task = scheduled_task(&format!("touch {}", marker.display()));
        task.pre = vec![Task {
            name: "pre".into(),
            run: "exit 1".into(),
            ..Task::default()
        }];
        broker.publish_task("default", &task).await.unwrap();

        let failed = errors.recv().await.unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(!marker.exists(), "main step must not run after a pre failure");
        assert!(
            tokio::time::timeout(Duration::from_millis(200), completed.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn post_runs_after_main_and_shares_volumes() {
        let broker = InMemoryBroker::new();
        let (_started, mut completed, _errors) = started_and_terminal_queues(&broker).await;
        let w = worker(&broker);
        w.start().await.unwrap();

        let mut task = scheduled_task("printf seed > /tmp/unused; printf 1 > $DROVER_OUTPUT");
        task.mounts = vec![Mount {
            mount_type: MountType::Volume,
            source: String::new(),
            target: "/shared".into(),
        }];
        task.post = vec![Task {
            name: "post".into(),
            run: "printf post-done > \"$DROVER_OUTPUT\"".into(),
            ..Task::default()
        }];
        broker.publish_task("default", &task).await.unwrap();

        let c = completed.recv().await.unwrap();
        assert_eq!(c.state, TaskState::Completed);
        // The post step's output is the last writer.
        assert_eq!(c.result, "post-done");
    }

    #[tokio::test]
    async fn timeout_fails_the_task() {
        let broker = InMemoryBroker::new();
        let (_started, _completed, mut errors) = started_and_terminal_queues(&broker).await;
        let w = worker(&broker);
        w.start().await.unwrap();

        let mut task = scheduled_task("sleep 20");
        task.timeout = Some(Duration::from_millis(250));
        broker.publish_task("default", &task).await.unwrap();

        let failed = errors.recv().await.unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(failed.error.contains("timeout:"), "got: {}", failed.error);
    }

    #[tokio::test]
    async fn directed_cancel_stops_the_task_silently() {
        let broker = InMemoryBroker::new();
        let (mut started, mut completed, mut errors) = started_and_terminal_queues(&broker).await;
        let w = worker(&broker);
        w.start().await.unwrap();

        let task = scheduled_task("sleep 20");
        broker.publish_task("default", &task).await.unwrap();
        started.recv().await.unwrap();

        let mut cancel = task.clone();
        cancel.state = TaskState::Cancelled;
        broker
            .publish_task(&exclusive_queue(w.id()), &cancel)
            .await
            .unwrap();

        // No terminal report arrives for a cancelled task.
        assert!(
            tokio::time::timeout(Duration::from_millis(500), completed.recv())
                .await
                .is_err()
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(100), errors.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn default_limits_are_applied() {
        let broker = InMemoryBroker::new();
        let w = Worker::new(WorkerConfig {
            broker: Arc::new(broker.clone()),
            runtime: Arc::new(ShellRuntime::new()),
            queues: HashMap::new(),
            limits: WorkerLimits {
                default_cpus: "2".into(),
                default_memory: "512m".into(),
            },
            tempdir: None,
        });

        let mut task = scheduled_task("true");
        w.apply_default_limits(&mut task);
        let limits = task.limits.unwrap();
        assert_eq!(limits.cpus, "2");
        assert_eq!(limits.memory, "512m");
    }

    #[tokio::test]
    async fn captured_logs_reach_the_logs_queue() {
        let broker = InMemoryBroker::new();
        let (log_tx, mut log_rx) = tokio_mpsc::unbounded_channel();
        broker
            .subscribe_task_log_parts(Arc::new(move |part| {
                let log_tx = log_tx.clone();
                Box::pin(async move {
                    let _ = log_tx.send(part);
                    Ok(())
                })
            }))
            .await
            .unwrap();

        let w = worker(&broker);
        w.start().await.unwrap();

        let task = scheduled_task("echo captured-line");
        broker.publish_task("default", &task).await.unwrap();

        let part = log_rx.recv().await.unwrap();
        assert_eq!(part.task_id, task.id);
        assert_eq!(part.contents, "captured-line");
        assert_eq!(part.number, 1);
    }
}
