//! Completed-task handler: persists results and drives the job
//! forward.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use drover_core::{Task, TaskState};
use drover_datastore::{Datastore, DatastoreError};

use crate::error::Result;
use crate::flow::JobFlow;
use crate::handlers::try_update_task;
use crate::middleware::{TaskEvent, TaskHandler};

/// Marks a task Completed, then either checks its composite parent
/// for completion or advances the owning job's position.
pub(crate) struct CompletedHandler {
    pub ds: Arc<dyn Datastore>,
    pub flow: Arc<JobFlow>,
}

#[async_trait]
impl TaskHandler for CompletedHandler {
    async fn call(&self, _event: TaskEvent, task: &mut Task) -> Result<()> {
        let authoritative = self.ds.get_task(&task.id).await?;
        if authoritative.state.is_terminal() {
            // Replayed delivery, or a late completion after the task
            // was cancelled: the terminal state stands.
            debug!(task_id = %task.id, state = %authoritative.state, "terminal report ignored");
            return Ok(());
        }

        let result = task.result.clone();
        let completed_at = task.completed_at;
        let updated = try_update_task(&self.ds, &task.id, move |t| {
            if t.state.is_terminal() {
                return Err(DatastoreError::Conflict("task already terminal".into()));
            }
            t.state = TaskState::Completed;
            t.completed_at = completed_at.or_else(|| Some(Utc::now()));
            t.result = result;
            Ok(())
        })
        .await?;
        let Some(updated) = updated else {
            return Ok(());
        };
        info!(task_id = %updated.id, task_name = %updated.name, "task completed");

        match updated.parent_id.clone() {
            Some(parent_id) => {
                self.flow
                    .complete_parent_if_done(&parent_id, &updated.job_id)
                    .await
            }
            None => self.flow.advance_job(&updated).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_broker::InMemoryBroker;
    use drover_core::{Job, JobState};
    use drover_datastore::{InMemoryDatastore, InMemoryLocker};

    struct Fixture {
        ds: Arc<InMemoryDatastore>,
        handler: CompletedHandler,
    }

    fn fixture() -> Fixture {
        let ds = Arc::new(InMemoryDatastore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let flow = Arc::new(JobFlow::new(
            ds.clone(),
            broker,
            Arc::new(InMemoryLocker::new()),
        ));
        Fixture {
            handler: CompletedHandler {
                ds: ds.clone(),
                flow,
            },
            ds,
        }
    }

    async fn seed_job(ds: &InMemoryDatastore, templates: Vec<Task>, position: u32) -> Job {
        let job = Job {
            id: drover_core::new_id(),
            name: "j".into(),
            state: JobState::Running,
            created_at: Some(Utc::now()),
            task_count: templates.len() as u32,
            tasks: templates,
            position,
            ..Job::default()
        };
        ds.create_job(&job).await.unwrap();
        job
    }

    fn running_task(job_id: &str) -> Task {
        Task {
            id: drover_core::new_id(),
            job_id: job_id.into(),
            name: "step".into(),
            state: TaskState::Running,
            created_at: Some(Utc::now()),
            ..Task::default()
        }
    }

    #[tokio::test]
    async fn persists_result_and_completes_job_at_end() {
        let f = fixture();
        let job = seed_job(
            &f.ds,
            vec![Task {
                name: "step".into(),
                run: "echo".into(),
                ..Task::default()
            }],
            1,
        )
        .await;
        let task = running_task(&job.id);
        f.ds.create_task(&task).await.unwrap();

        let mut report = task.clone();
        report.result = "out".into();
        f.handler
            .call(TaskEvent::StateChange, &mut report)
            .await
            .unwrap();

        let stored = f.ds.get_task(&task.id).await.unwrap();
        assert_eq!(stored.state, TaskState::Completed);
        assert_eq!(stored.result, "out");

        // Last task of the job: the position advances past the end
        // and the job completes.
        let job = f.ds.get_job(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.position, 2);
        assert_eq!(job.context.tasks["step"].result, "out");
    }

    #[tokio::test]
    async fn duplicate_completion_is_idempotent() {
        let f = fixture();
        let job = seed_job(
            &f.ds,
            vec![Task {
                name: "step".into(),
                run: "echo".into(),
                ..Task::default()
            }],
            1,
        )
        .await;
        let task = running_task(&job.id);
        f.ds.create_task(&task).await.unwrap();

        let mut first = task.clone();
        first.result = "first".into();
        f.handler
            .call(TaskEvent::StateChange, &mut first)
            .await
            .unwrap();

        let mut second = task.clone();
        second.result = "second".into();
        f.handler
            .call(TaskEvent::StateChange, &mut second)
            .await
            .unwrap();

        let stored = f.ds.get_task(&task.id).await.unwrap();
        assert_eq!(stored.result, "first");
        let job = f.ds.get_job(&job.id).await.unwrap();
        assert_eq!(job.position, 2, "duplicate must not advance twice");
    }

    #[tokio::test]
    async fn child_completion_waits_for_siblings() {
        let f = fixture();
        let job = seed_job(&f.ds, vec![], 1).await;

        let mut parent = running_task(&job.id);
        parent.name = "parent".into();
        f.ds.create_task(&parent).await.unwrap();

        let mut child_a = running_task(&job.id);
        child_a.parent_id = Some(parent.id.clone());
        let mut child_b = running_task(&job.id);
        child_b.parent_id = Some(parent.id.clone());
        child_b.position = 1;
        f.ds.create_task(&child_a).await.unwrap();
        f.ds.create_task(&child_b).await.unwrap();

        f.handler
            .call(TaskEvent::StateChange, &mut child_a.clone())
            .await
            .unwrap();

        // One sibling still running: the parent stays Running.
        let stored_parent = f.ds.get_task(&parent.id).await.unwrap();
        assert_eq!(stored_parent.state, TaskState::Running);
    }
}
