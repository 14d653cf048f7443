//! Queue event handlers.
//!
//! One handler per coordinator queue, each the innermost layer of the
//! corresponding middleware chain. Handlers are deliberately thin:
//! idempotence check, predicated datastore write, then hand off to
//! [`JobFlow`](crate::flow::JobFlow) for anything job-level.

mod completed;
mod failed;
mod heartbeat;
mod pending;
mod started;

pub(crate) use completed::CompletedHandler;
pub(crate) use failed::FailedHandler;
pub(crate) use heartbeat::HeartbeatHandler;
pub(crate) use pending::PendingHandler;
pub(crate) use started::StartedHandler;

use std::sync::Arc;

use tracing::debug;

use drover_core::Task;
use drover_datastore::{Datastore, DatastoreError};

use crate::error::{CoordinatorError, Result};

/// Apply a predicated task mutator, treating Conflict as "the
/// invariant is already satisfied" (at-least-once replays).
pub(crate) async fn try_update_task<F>(
    ds: &Arc<dyn Datastore>,
    id: &str,
    mutator: F,
) -> Result<Option<Task>>
where
    F: FnOnce(&mut Task) -> std::result::Result<(), DatastoreError> + Send + 'static,
{
    match ds.update_task(id, Box::new(mutator)).await {
        Ok(task) => Ok(Some(task)),
        Err(DatastoreError::Conflict(reason)) => {
            debug!(task_id = %id, reason = %reason, "task update skipped");
            Ok(None)
        }
        Err(err) => Err(CoordinatorError::Datastore(err)),
    }
}

/// Handler for worker progress reports: best-effort update of the
/// task's completion fraction while it is still running.
pub(crate) struct ProgressHandler {
    pub ds: Arc<dyn Datastore>,
}

impl ProgressHandler {
    pub(crate) async fn handle(&self, task: Task) -> Result<()> {
        let progress = task.progress.clamp(0.0, 1.0);
        try_update_task(&self.ds, &task.id, move |t| {
            if t.state != drover_core::TaskState::Running {
                return Err(DatastoreError::Conflict("task is not running".into()));
            }
            t.progress = progress;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

/// Handler for captured stdout/stderr chunks.
pub(crate) struct LogsHandler {
    pub ds: Arc<dyn Datastore>,
}

impl LogsHandler {
    pub(crate) async fn handle(&self, part: drover_core::TaskLogPart) -> Result<()> {
        self.ds.create_task_log_part(&part).await?;
        Ok(())
    }
}
