//! Failed-task handler: retries within policy, otherwise fails the
//! task and cascades.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use drover_broker::Broker;
use drover_core::queue::QUEUE_PENDING;
use drover_core::{Task, TaskState};
use drover_datastore::{Datastore, DatastoreError};

use crate::error::Result;
use crate::flow::JobFlow;
use crate::handlers::try_update_task;
use crate::middleware::{TaskEvent, TaskHandler};

/// Handles worker failure reports and dead-lettered tasks. Retries
/// are modeled: the persisted attempt counter advances only on a
/// transactionally-observed transition, never on broker redelivery.
pub(crate) struct FailedHandler {
    pub ds: Arc<dyn Datastore>,
    pub broker: Arc<dyn Broker>,
    pub flow: Arc<JobFlow>,
}

#[async_trait]
impl TaskHandler for FailedHandler {
    async fn call(&self, _event: TaskEvent, task: &mut Task) -> Result<()> {
        let authoritative = self.ds.get_task(&task.id).await?;
        if authoritative.state.is_terminal() {
            return Ok(());
        }
        let job = self.ds.get_job(&task.job_id).await?;

        // Retry while the policy allows and the job still wants work.
        let retryable = authoritative
            .retry
            .as_ref()
            .is_some_and(|r| r.attempts <= r.limit);
        if retryable && job.state.is_active() {
            let error = task.error.clone();
            let updated = try_update_task(&self.ds, &task.id, move |t| {
                if t.state.is_terminal() {
                    return Err(DatastoreError::Conflict("task already terminal".into()));
                }
                let Some(retry) = &mut t.retry else {
                    return Err(DatastoreError::Conflict("retry policy disappeared".into()));
                };
                retry.attempts += 1;
                t.state = TaskState::Scheduled;
                t.error = error;
                t.node_id = String::new();
                t.started_at = None;
                Ok(())
            })
            .await?;
            if let Some(updated) = updated {
                info!(
                    task_id = %updated.id,
                    attempt = updated.retry.as_ref().map(|r| r.attempts).unwrap_or(0),
                    "retrying failed task"
                );
                self.broker.publish_task(QUEUE_PENDING, &updated).await?;
            }
            return Ok(());
        }

        let error = task.error.clone();
        let failed_at = task.failed_at;
        let updated = try_update_task(&self.ds, &task.id, move |t| {
            if t.state.is_terminal() {
                return Err(DatastoreError::Conflict("task already terminal".into()));
            }
            t.state = TaskState::Failed;
            t.failed_at = failed_at.or_else(|| Some(Utc::now()));
            t.error = error;
            Ok(())
        })
        .await?;
        let Some(updated) = updated else {
            return Ok(());
        };
        warn!(task_id = %updated.id, error = %updated.error, "task failed");

        if !job.state.is_active() {
            // Late failure of an already-terminal job: record only.
            return Ok(());
        }
        match updated.parent_id.clone() {
            Some(parent_id) => self.flow.fail_parent(&parent_id, &updated).await,
            None => self.flow.fail_job(&updated.job_id, updated.error.clone()).await,
        }
    }
}
