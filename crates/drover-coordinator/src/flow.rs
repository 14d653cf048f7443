//! Job-level state machine.
//!
//! [`JobFlow`] owns every job transition: starting a Pending job,
//! restarting a Cancelled/Failed one, and finalizing the three
//! terminal states. Task handlers funnel into it when a top-level
//! task finishes (advance + re-plan) or when a composite child
//! reports (parent completion check, sibling cancellation).
//!
//! Every write is a predicated datastore mutator, so replays observe
//! an already-satisfied invariant and no-op. Cross-replica
//! serialization of advancement and parent completion uses the
//! [`Locker`] keyed by job id. Terminal transitions run through the
//! job middleware chain (the base handler is this struct), signal any
//! registered waiter, and emit `job.*` topic events.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use drover_broker::Broker;
use drover_core::queue::{
    QUEUE_COMPLETED, QUEUE_ERROR, TOPIC_JOB_CANCELLED, TOPIC_JOB_COMPLETED, TOPIC_JOB_FAILED,
    TOPIC_JOB_STATE_CHANGE, exclusive_queue,
};
use drover_core::{Job, JobState, Task, TaskState};
use drover_datastore::{Datastore, DatastoreError, Locker};

use crate::error::{CoordinatorError, Result};
use crate::middleware::{JobChain, JobEvent, JobHandler};
use crate::planner::{PlanOutcome, Planner};

/// The job-level engine shared by the queue handlers and the API.
pub struct JobFlow {
    ds: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
    locker: Arc<dyn Locker>,
    planner: Planner,
    waiters: DashMap<String, oneshot::Sender<Job>>,
    chain: OnceLock<JobChain>,
}

impl JobFlow {
    pub fn new(
        ds: Arc<dyn Datastore>,
        broker: Arc<dyn Broker>,
        locker: Arc<dyn Locker>,
    ) -> Self {
        Self {
            planner: Planner::new(Arc::clone(&ds), Arc::clone(&broker)),
            ds,
            broker,
            locker,
            waiters: DashMap::new(),
            chain: OnceLock::new(),
        }
    }

    /// Install the middleware-wrapped job chain. Called once during
    /// coordinator startup; transitions before that (or in tests
    /// without middleware) go straight to the base handler.
    pub fn set_chain(&self, chain: JobChain) {
        let _ = self.chain.set(chain);
    }

    /// Route a job event through the middleware chain into the base
    /// handler.
    pub async fn dispatch(&self, job: &mut Job) -> Result<()> {
        match self.chain.get() {
            Some(chain) => chain.call(JobEvent::StateChange, job).await,
            None => self.handle(job).await,
        }
    }

    /// The base job handler: routes on the event's target state.
    /// Boxed so the cancellation path may recurse through sub-jobs.
    pub fn handle<'a>(&'a self, job: &'a mut Job) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match job.state {
                JobState::Pending => self.start_job(job).await,
                JobState::Restart => self.restart_job(job).await,
                JobState::Completed => self.finalize_completed(job).await,
                JobState::Failed => self.finalize_failed(job).await,
                JobState::Cancelled => self.finalize_cancelled(job).await,
                JobState::Scheduled | JobState::Running => Ok(()),
            }
        })
    }

    // -- intake -------------------------------------------------------------

    async fn start_job(&self, job: &mut Job) -> Result<()> {
        let updated = self
            .try_update_job(&job.id, |j| {
                if j.state != JobState::Pending {
                    return Err(DatastoreError::Conflict(format!(
                        "job is {}, not PENDING",
                        j.state
                    )));
                }
                j.state = JobState::Scheduled;
                Ok(())
            })
            .await?;
        let Some(updated) = updated else {
            debug!(job_id = %job.id, "job already picked up, ignoring");
            return Ok(());
        };
        info!(job_id = %updated.id, job_name = %updated.name, "job scheduled");
        self.emit(TOPIC_JOB_STATE_CHANGE, &updated).await;
        self.plan(&job.id).await
    }

    async fn restart_job(&self, job: &mut Job) -> Result<()> {
        let updated = self
            .try_update_job(&job.id, |j| {
                if !matches!(j.state, JobState::Cancelled | JobState::Failed) {
                    return Err(DatastoreError::Conflict(format!(
                        "cannot restart a {} job",
                        j.state
                    )));
                }
                if j.is_exhausted() {
                    return Err(DatastoreError::Conflict(
                        "job has no more tasks to run".into(),
                    ));
                }
                j.state = JobState::Scheduled;
                j.error = String::new();
                j.failed_at = None;
                Ok(())
            })
            .await?;
        let Some(updated) = updated else {
            return Ok(());
        };
        info!(job_id = %updated.id, position = updated.position, "job restarted");
        self.emit(TOPIC_JOB_STATE_CHANGE, &updated).await;
        self.plan(&job.id).await
    }

    /// Run the planner and route its verdict.
    async fn plan(&self, job_id: &str) -> Result<()> {
        match self.planner.schedule_next(job_id).await? {
            PlanOutcome::Dispatched(_) => Ok(()),
            PlanOutcome::Exhausted => self.complete_job(job_id).await,
            PlanOutcome::Aborted { error } => self.fail_job(job_id, error).await,
        }
    }

    // -- task-driven progression --------------------------------------------

    /// A top-level task finished: fold it into the context, bump the
    /// position pointer, and plan what runs next.
    pub async fn advance_job(&self, task: &Task) -> Result<()> {
        let _lease = self.locker.acquire(&format!("job:{}", task.job_id)).await?;
        let snapshot = task.clone();
        let updated = self
            .try_update_job(&task.job_id, move |j| {
                if !j.state.is_active() {
                    return Err(DatastoreError::Conflict(format!(
                        "job is {}, not advancing",
                        j.state
                    )));
                }
                j.context.record(&snapshot);
                j.position += 1;
                Ok(())
            })
            .await?;
        if updated.is_none() {
            debug!(job_id = %task.job_id, "job no longer active, not advancing");
            return Ok(());
        }
        self.plan(&task.job_id).await
    }

    /// A composite child completed: if every sibling is now Completed
    /// or Skipped, report the parent as completed.
    pub async fn complete_parent_if_done(&self, parent_id: &str, job_id: &str) -> Result<()> {
        let _lease = self.locker.acquire(&format!("job:{job_id}")).await?;
        let children = self.ds.get_children(parent_id).await?;
        let all_done = children
            .iter()
            .all(|c| matches!(c.state, TaskState::Completed | TaskState::Skipped));
        if !all_done {
            return Ok(());
        }
        let mut parent = self.ds.get_task(parent_id).await?;
        if parent.state.is_terminal() {
            return Ok(());
        }
        debug!(task_id = %parent_id, "all children done, completing composite parent");
        parent.completed_at = Some(Utc::now());
        self.broker.publish_task(QUEUE_COMPLETED, &parent).await?;
        Ok(())
    }

    /// A composite child failed: cancel its live siblings, then fail
    /// the parent upward through the error queue.
    pub async fn fail_parent(&self, parent_id: &str, failed: &Task) -> Result<()> {
        let _lease = self
            .locker
            .acquire(&format!("job:{}", failed.job_id))
            .await?;
        for sibling in self.ds.get_children(parent_id).await? {
            if sibling.id != failed.id && sibling.state.is_active() {
                self.cancel_task_row(&sibling).await?;
            }
        }
        let mut parent = self.ds.get_task(parent_id).await?;
        if parent.state.is_terminal() {
            return Ok(());
        }
        parent.error = failed.error.clone();
        parent.failed_at = Some(Utc::now());
        self.broker.publish_task(QUEUE_ERROR, &parent).await?;
        Ok(())
    }

    // -- terminal transitions -----------------------------------------------

    /// Complete a job: evaluate its output expression and push the
    /// Completed event through the middleware chain.
    pub async fn complete_job(&self, job_id: &str) -> Result<()> {
        let job = self.ds.get_job(job_id).await?;
        if job.state.is_terminal() {
            return Ok(());
        }
        let result = if job.output.is_empty() {
            String::new()
        } else {
            match drover_eval::evaluate_to_string(&job.output, &job.context.to_eval_context()) {
                Ok(result) => result,
                Err(err) => {
                    return self
                        .fail_job(job_id, format!("output expression error: {err}"))
                        .await;
                }
            }
        };
        let mut candidate = job;
        candidate.state = JobState::Completed;
        candidate.result = result;
        self.dispatch(&mut candidate).await
    }

    pub async fn fail_job(&self, job_id: &str, error: String) -> Result<()> {
        let job = self.ds.get_job(job_id).await?;
        if job.state.is_terminal() {
            return Ok(());
        }
        let mut candidate = job;
        candidate.state = JobState::Failed;
        candidate.error = error;
        self.dispatch(&mut candidate).await
    }

    /// User- or cascade-initiated cancellation; idempotent from any
    /// state.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let job = self.ds.get_job(job_id).await?;
        if job.state.is_terminal() {
            return Ok(());
        }
        let mut candidate = job;
        candidate.state = JobState::Cancelled;
        self.dispatch(&mut candidate).await
    }

    async fn finalize_completed(&self, job: &mut Job) -> Result<()> {
        let result = job.result.clone();
        let updated = self
            .try_update_job(&job.id, move |j| {
                if j.state.is_terminal() {
                    return Err(DatastoreError::Conflict("job already terminal".into()));
                }
                j.state = JobState::Completed;
                j.completed_at = Some(Utc::now());
                j.result = result;
                Ok(())
            })
            .await?;
        let Some(updated) = updated else {
            return Ok(());
        };
        info!(job_id = %updated.id, job_name = %updated.name, "job completed");

        self.notify_waiter(&updated);
        self.emit(TOPIC_JOB_COMPLETED, &updated).await;
        if let Some(parent) = &updated.parent {
            self.report_parent_task(&parent.task_id, |t| {
                t.result = updated.result.clone();
                t.completed_at = Some(Utc::now());
            }, QUEUE_COMPLETED)
            .await;
        }
        self.schedule_auto_delete(&updated);
        Ok(())
    }

    pub(crate) async fn finalize_failed(&self, job: &mut Job) -> Result<()> {
        let error = job.error.clone();
        let updated = self
            .try_update_job(&job.id, move |j| {
                if j.state.is_terminal() {
                    return Err(DatastoreError::Conflict("job already terminal".into()));
                }
                j.state = JobState::Failed;
                j.failed_at = Some(Utc::now());
                j.error = error;
                Ok(())
            })
            .await?;
        let Some(updated) = updated else {
            return Ok(());
        };
        warn!(job_id = %updated.id, error = %updated.error, "job failed");

        self.cancel_active_tasks(&updated).await?;
        self.notify_waiter(&updated);
        self.emit(TOPIC_JOB_FAILED, &updated).await;
        if let Some(parent) = &updated.parent {
            let message = format!("sub-job failed: {}", updated.error);
            self.report_parent_task(&parent.task_id, move |t| {
                t.error = message;
                t.failed_at = Some(Utc::now());
            }, QUEUE_ERROR)
            .await;
        }
        self.schedule_auto_delete(&updated);
        Ok(())
    }

    async fn finalize_cancelled(&self, job: &mut Job) -> Result<()> {
        let updated = self
            .try_update_job(&job.id, |j| {
                if j.state.is_terminal() {
                    return Err(DatastoreError::Conflict("job already terminal".into()));
                }
                j.state = JobState::Cancelled;
                Ok(())
            })
            .await?;
        let Some(updated) = updated else {
            return Ok(());
        };
        info!(job_id = %updated.id, "job cancelled");

        self.cancel_active_tasks(&updated).await?;
        self.notify_waiter(&updated);
        self.emit(TOPIC_JOB_CANCELLED, &updated).await;
        self.schedule_auto_delete(&updated);
        Ok(())
    }

    // -- cancellation plumbing ----------------------------------------------

    /// Drive every in-flight task of `job` to a terminal state:
    /// waiting rows flip to Cancelled in place, running containers get
    /// a directed cancel on their node's exclusive queue, and
    /// materialized sub-jobs cancel recursively.
    async fn cancel_active_tasks(&self, job: &Job) -> Result<()> {
        for task in self.ds.get_active_tasks(&job.id).await? {
            if let Some(spec) = &task.subjob
                && !spec.job_id.is_empty()
            {
                if let Err(err) = self.cancel_job(&spec.job_id).await {
                    warn!(job_id = %spec.job_id, error = %err, "error cancelling sub-job");
                }
            }
            self.cancel_task_row(&task).await?;
        }
        Ok(())
    }

    /// Cancel one task row, notifying its node if it is running there.
    async fn cancel_task_row(&self, task: &Task) -> Result<()> {
        let was_running = task.state == TaskState::Running;
        let updated = match self
            .ds
            .update_task(
                &task.id,
                Box::new(|t| {
                    if t.state.is_terminal() {
                        return Err(DatastoreError::Conflict("task already terminal".into()));
                    }
                    t.state = TaskState::Cancelled;
                    Ok(())
                }),
            )
            .await
        {
            Ok(updated) => updated,
            Err(DatastoreError::Conflict(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if was_running && !updated.node_id.is_empty() && !updated.is_composite() {
            let queue = match self.ds.get_node(&updated.node_id).await {
                Ok(node) if !node.queue.is_empty() => node.queue,
                _ => exclusive_queue(&updated.node_id),
            };
            debug!(task_id = %updated.id, queue = %queue, "publishing directed cancel");
            self.broker.publish_task(&queue, &updated).await?;
        }
        Ok(())
    }

    // -- waiters & topics ---------------------------------------------------

    /// Register interest in a job's terminal state (`wait.timeout`).
    pub fn register_waiter(&self, job_id: &str) -> oneshot::Receiver<Job> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(job_id.to_string(), tx);
        rx
    }

    fn notify_waiter(&self, job: &Job) {
        if let Some((_, tx)) = self.waiters.remove(&job.id) {
            let _ = tx.send(job.clone());
        }
    }

    async fn emit(&self, topic: &str, job: &Job) {
        let payload = match serde_json::to_value(job.clone().redacted()) {
            Ok(payload) => payload,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "could not serialize job event");
                return;
            }
        };
        if topic != TOPIC_JOB_STATE_CHANGE
            && let Err(err) = self.broker.publish_event(topic, payload.clone()).await
        {
            warn!(topic = %topic, error = %err, "could not publish job event");
        }
        if let Err(err) = self
            .broker
            .publish_event(TOPIC_JOB_STATE_CHANGE, payload)
            .await
        {
            warn!(error = %err, "could not publish state-change event");
        }
    }

    /// Load the owning task of a finished sub-job, apply `prepare`,
    /// and report it on `queue`. Missing rows only get logged; the
    /// sub-job itself is already terminal.
    async fn report_parent_task<F>(&self, task_id: &str, prepare: F, queue: &str)
    where
        F: FnOnce(&mut Task),
    {
        match self.ds.get_task(task_id).await {
            Ok(mut task) => {
                if task.state.is_terminal() {
                    return;
                }
                prepare(&mut task);
                if let Err(err) = self.broker.publish_task(queue, &task).await {
                    error!(task_id = %task_id, error = %err, "could not report parent task");
                }
            }
            Err(err) => warn!(task_id = %task_id, error = %err, "parent task not found"),
        }
    }

    fn schedule_auto_delete(&self, job: &Job) {
        let Some(auto_delete) = &job.auto_delete else {
            return;
        };
        let after = auto_delete.after;
        let ds = Arc::clone(&self.ds);
        let job_id = job.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            match ds.delete_job(&job_id).await {
                Ok(()) => info!(job_id = %job_id, "auto-deleted job"),
                Err(err) => warn!(job_id = %job_id, error = %err, "auto-delete failed"),
            }
        });
    }

    // -- helpers ------------------------------------------------------------

    /// Apply a mutator, treating Conflict as "someone else already did
    /// this" and returning `None`.
    async fn try_update_job<F>(&self, id: &str, mutator: F) -> Result<Option<Job>>
    where
        F: FnOnce(&mut Job) -> std::result::Result<(), DatastoreError> + Send + 'static,
    {
        match self.ds.update_job(id, Box::new(mutator)).await {
            Ok(job) => Ok(Some(job)),
            Err(DatastoreError::Conflict(reason)) => {
                debug!(job_id = %id, reason = %reason, "job update skipped");
                Ok(None)
            }
            Err(err) => Err(CoordinatorError::Datastore(err)),
        }
    }
}

/// The innermost layer of the job middleware chain.
pub(crate) struct JobBase {
    pub flow: Arc<JobFlow>,
}

#[async_trait::async_trait]
impl JobHandler for JobBase {
    async fn call(&self, _event: JobEvent, job: &mut Job) -> Result<()> {
        self.flow.handle(job).await
    }
}
