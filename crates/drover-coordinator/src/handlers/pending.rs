//! Pending-task handler: routes freshly planned tasks to a work
//! queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use drover_broker::Broker;
use drover_core::{Task, TaskState};
use drover_datastore::{Datastore, DatastoreError};

use crate::error::Result;
use crate::handlers::try_update_task;
use crate::middleware::{TaskEvent, TaskHandler};

/// Moves a Pending task to Scheduled and publishes it on its target
/// queue. Tasks whose job is no longer active are cancelled in place
/// instead of dispatched.
pub(crate) struct PendingHandler {
    pub ds: Arc<dyn Datastore>,
    pub broker: Arc<dyn Broker>,
}

#[async_trait]
impl TaskHandler for PendingHandler {
    async fn call(&self, _event: TaskEvent, task: &mut Task) -> Result<()> {
        let job = self.ds.get_job(&task.job_id).await?;
        if !job.state.is_active() {
            debug!(task_id = %task.id, job_state = %job.state, "job inactive, cancelling task");
            try_update_task(&self.ds, &task.id, |t| {
                if t.state.is_terminal() {
                    return Err(DatastoreError::Conflict("task already terminal".into()));
                }
                t.state = TaskState::Cancelled;
                Ok(())
            })
            .await?;
            return Ok(());
        }

        let updated = try_update_task(&self.ds, &task.id, |t| {
            // Retried tasks come back through here already Scheduled.
            if !matches!(t.state, TaskState::Pending | TaskState::Scheduled) {
                return Err(DatastoreError::Conflict(format!(
                    "task is {}, not dispatchable",
                    t.state
                )));
            }
            t.state = TaskState::Scheduled;
            t.scheduled_at = Some(Utc::now());
            Ok(())
        })
        .await?;
        let Some(updated) = updated else {
            return Ok(());
        };

        self.broker
            .publish_task(updated.target_queue(), &updated)
            .await?;
        *task = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_broker::InMemoryBroker;
    use drover_core::{Job, JobState};
    use drover_datastore::InMemoryDatastore;

    async fn seed(state: JobState) -> (PendingHandler, InMemoryBroker, Task) {
        let ds = Arc::new(InMemoryDatastore::new());
        let broker = InMemoryBroker::new();
        let job = Job {
            id: drover_core::new_id(),
            name: "j".into(),
            state,
            created_at: Some(Utc::now()),
            position: 1,
            ..Job::default()
        };
        ds.create_job(&job).await.unwrap();
        let task = Task {
            id: drover_core::new_id(),
            job_id: job.id.clone(),
            name: "t".into(),
            state: TaskState::Pending,
            created_at: Some(Utc::now()),
            ..Task::default()
        };
        ds.create_task(&task).await.unwrap();
        let handler = PendingHandler {
            ds: ds.clone(),
            broker: Arc::new(broker.clone()),
        };
        (handler, broker, task)
    }

    #[tokio::test]
    async fn schedules_and_routes_to_default_queue() {
        let (handler, broker, mut task) = seed(JobState::Running).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        broker
            .subscribe_tasks(
                "default",
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

        handler
            .call(TaskEvent::StateChange, &mut task)
            .await
            .unwrap();

        let routed = rx.recv().await.unwrap();
        assert_eq!(routed.state, TaskState::Scheduled);
        assert!(routed.scheduled_at.is_some());
        assert_eq!(task.state, TaskState::Scheduled);
    }

    #[tokio::test]
    async fn cancels_task_of_inactive_job() {
        let (handler, _broker, mut task) = seed(JobState::Cancelled).await;
        handler
            .call(TaskEvent::StateChange, &mut task)
            .await
            .unwrap();

        let stored = handler.ds.get_task(&task.id).await.unwrap();
        assert_eq!(stored.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let (handler, _broker, mut task) = seed(JobState::Running).await;
        handler
            .call(TaskEvent::StateChange, &mut task)
            .await
            .unwrap();

        // Force the task into Running, then replay the pending event.
        handler
            .ds
            .update_task(
                &task.id,
                Box::new(|t| {
                    t.state = TaskState::Running;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        let mut replay = task.clone();
        replay.state = TaskState::Pending;
        handler
            .call(TaskEvent::StateChange, &mut replay)
            .await
            .unwrap();

        let stored = handler.ds.get_task(&task.id).await.unwrap();
        assert_eq!(stored.state, TaskState::Running);
    }
}
