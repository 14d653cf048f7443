//! Started-task handler: records a worker's "I began executing"
//! report.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use drover_broker::Broker;
use drover_core::queue::exclusive_queue;
use drover_core::{JobState, Task, TaskState};
use drover_datastore::{Datastore, DatastoreError};

use crate::error::Result;
use crate::handlers::try_update_task;
use crate::middleware::{TaskEvent, TaskHandler};

/// Moves a Scheduled task to Running, copying the reporting node and
/// start time. If the owning job already reached a terminal state the
/// report is answered with a directed cancellation instead.
pub(crate) struct StartedHandler {
    pub ds: Arc<dyn Datastore>,
    pub broker: Arc<dyn Broker>,
}

impl StartedHandler {
    async fn node_queue(&self, node_id: &str) -> String {
        match self.ds.get_node(node_id).await {
            Ok(node) if !node.queue.is_empty() => node.queue,
            _ => exclusive_queue(node_id),
        }
    }
}

#[async_trait]
impl TaskHandler for StartedHandler {
    async fn call(&self, _event: TaskEvent, task: &mut Task) -> Result<()> {
        let job = self.ds.get_job(&task.job_id).await?;
        if job.state.is_terminal() {
            // The worker raced a cancellation; tell it to stop and
            // leave the authoritative row untouched.
            debug!(task_id = %task.id, job_state = %job.state, "job terminal, cancelling reporter");
            let mut cancel = task.clone();
            cancel.state = TaskState::Cancelled;
            self.broker
                .publish_task(&self.node_queue(&task.node_id).await, &cancel)
                .await?;
            return Ok(());
        }

        let started_at = task.started_at;
        let node_id = task.node_id.clone();
        try_update_task(&self.ds, &task.id, move |t| {
            if t.state != TaskState::Scheduled {
                return Err(DatastoreError::Conflict(format!(
                    "task is {}, not SCHEDULED",
                    t.state
                )));
            }
            t.state = TaskState::Running;
            t.started_at = started_at.or_else(|| Some(Utc::now()));
            t.node_id = node_id;
            Ok(())
        })
        .await?;

        // First task to start moves the job to Running.
        if job.state == JobState::Scheduled {
            let result = self
                .ds
                .update_job(
                    &task.job_id,
                    Box::new(|j| {
                        if j.state != JobState::Scheduled {
                            return Err(DatastoreError::Conflict("job not scheduled".into()));
                        }
                        j.state = JobState::Running;
                        j.started_at = Some(Utc::now());
                        Ok(())
                    }),
                )
                .await;
            if let Err(err) = result
                && !matches!(err, DatastoreError::Conflict(_))
            {
                return Err(err.into());
            }
        }
        Ok(())
    }
}
