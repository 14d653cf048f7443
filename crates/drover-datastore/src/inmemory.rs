//! In-memory datastore.
//!
//! Rows live in [`DashMap`]s; `update_*` applies its mutator while the
//! row's shard lock is held, which gives the same observe-then-write
//! atomicity the SQLite store gets from transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use drover_core::{Job, Node, ScheduledJob, ScheduledJobState, Task, TaskLogPart, TaskState};

use crate::error::{DatastoreError, Result};
use crate::{Datastore, JobMutator, Page, ScheduledJobMutator, TaskMutator};

/// Datastore implementation backed by process-local maps. Suitable
/// for standalone deployments and tests.
#[derive(Clone, Default)]
pub struct InMemoryDatastore {
    jobs: std::sync::Arc<DashMap<String, Job>>,
    tasks: std::sync::Arc<DashMap<String, Task>>,
    nodes: std::sync::Arc<DashMap<String, Node>>,
    scheduled: std::sync::Arc<DashMap<String, ScheduledJob>>,
    logs: std::sync::Arc<DashMap<String, Vec<TaskLogPart>>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(kind: &'static str, id: &str) -> DatastoreError {
        DatastoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    fn sorted_job_tasks(&self, job_id: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.value().job_id == job_id)
            .map(|t| t.value().clone())
            .collect();
        // UUID v7 ids are time-ordered, so (created_at, id) gives a
        // stable creation order.
        tasks.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        tasks
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        let mut job = self
            .jobs
            .get(id)
            .map(|j| j.value().clone())
            .ok_or_else(|| Self::not_found("job", id))?;
        job.execution = self.sorted_job_tasks(id);
        Ok(job)
    }

    async fn update_job(&self, id: &str, mutator: JobMutator) -> Result<Job> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Self::not_found("job", id))?;
        mutator(entry.value_mut())?;
        Ok(entry.value().clone())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.jobs
            .remove(id)
            .ok_or_else(|| Self::not_found("job", id))?;
        // Cascade to owned tasks and their logs.
        let owned: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.value().job_id == id)
            .map(|t| t.key().clone())
            .collect();
        for task_id in owned {
            self.tasks.remove(&task_id);
            self.logs.remove(&task_id);
        }
        Ok(())
    }

    async fn get_jobs(&self, page: u32, size: u32) -> Result<Page<Job>> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        Ok(Page::slice(jobs, page, size))
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        self.tasks
            .get(id)
            .map(|t| t.value().clone())
            .ok_or_else(|| Self::not_found("task", id))
    }

    async fn update_task(&self, id: &str, mutator: TaskMutator) -> Result<Task> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Self::not_found("task", id))?;
        mutator(entry.value_mut())?;
        Ok(entry.value().clone())
    }

    async fn get_job_tasks(&self, job_id: &str) -> Result<Vec<Task>> {
        Ok(self.sorted_job_tasks(job_id))
    }

    async fn get_active_tasks(&self, job_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .sorted_job_tasks(job_id)
            .into_iter()
            .filter(|t| t.state.is_active())
            .collect())
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<Task>> {
        let mut children: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.value().parent_id.as_deref() == Some(parent_id))
            .map(|t| t.value().clone())
            .collect();
        children.sort_by_key(|t| t.position);
        Ok(children)
    }

    async fn get_node_active_tasks(&self, node_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .iter()
            .filter(|t| {
                t.value().node_id == node_id
                    && matches!(t.value().state, TaskState::Scheduled | TaskState::Running)
            })
            .map(|t| t.value().clone())
            .collect())
    }

    async fn upsert_node(&self, node: &Node) -> Result<()> {
        self.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Node> {
        self.nodes
            .get(id)
            .map(|n| n.value().clone())
            .ok_or_else(|| Self::not_found("node", id))
    }

    async fn get_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn get_active_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| n.value().last_heartbeat_at > cutoff)
            .map(|n| n.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn create_scheduled_job(&self, job: &ScheduledJob) -> Result<()> {
        self.scheduled.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_scheduled_job(&self, id: &str) -> Result<ScheduledJob> {
        self.scheduled
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Self::not_found("scheduled job", id))
    }

    async fn get_scheduled_jobs(&self, page: u32, size: u32) -> Result<Page<ScheduledJob>> {
        let mut jobs: Vec<ScheduledJob> =
            self.scheduled.iter().map(|s| s.value().clone()).collect();
        jobs.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        Ok(Page::slice(jobs, page, size))
    }

    async fn get_active_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        Ok(self
            .scheduled
            .iter()
            .filter(|s| s.value().state == ScheduledJobState::Active)
            .map(|s| s.value().clone())
            .collect())
    }

    async fn update_scheduled_job(
        &self,
        id: &str,
        mutator: ScheduledJobMutator,
    ) -> Result<ScheduledJob> {
        let mut entry = self
            .scheduled
            .get_mut(id)
            .ok_or_else(|| Self::not_found("scheduled job", id))?;
        mutator(entry.value_mut())?;
        Ok(entry.value().clone())
    }

    async fn delete_scheduled_job(&self, id: &str) -> Result<()> {
        self.scheduled
            .remove(id)
            .ok_or_else(|| Self::not_found("scheduled job", id))?;
        Ok(())
    }

    async fn create_task_log_part(&self, part: &TaskLogPart) -> Result<()> {
        self.logs
            .entry(part.task_id.clone())
            .or_default()
            .push(part.clone());
        Ok(())
    }

    async fn get_task_log_parts(
        &self,
        task_id: &str,
        page: u32,
        size: u32,
    ) -> Result<Page<TaskLogPart>> {
        let mut parts = self
            .logs
            .get(task_id)
            .map(|p| p.value().clone())
            .unwrap_or_default();
        parts.sort_by_key(|p| p.number);
        Ok(Page::slice(parts, page, size))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::JobState;

    fn job(name: &str) -> Job {
        Job {
            id: drover_core::new_id(),
            name: name.into(),
            state: JobState::Pending,
            created_at: Some(Utc::now()),
            position: 1,
            ..Job::default()
        }
    }

    fn task(job_id: &str, name: &str) -> Task {
        Task {
            id: drover_core::new_id(),
            job_id: job_id.into(),
            name: name.into(),
            created_at: Some(Utc::now()),
            ..Task::default()
        }
    }

    #[tokio::test]
    async fn job_crud_and_execution_log() {
        let ds = InMemoryDatastore::new();
        let j = job("test");
        ds.create_job(&j).await.unwrap();

        ds.create_task(&task(&j.id, "one")).await.unwrap();
        ds.create_task(&task(&j.id, "two")).await.unwrap();

        let loaded = ds.get_job(&j.id).await.unwrap();
        assert_eq!(loaded.execution.len(), 2);
        assert_eq!(loaded.execution[0].name, "one");

        ds.delete_job(&j.id).await.unwrap();
        assert!(ds.get_job(&j.id).await.is_err());
        assert!(ds.get_job_tasks(&j.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_job_applies_mutator_conflict() {
        let ds = InMemoryDatastore::new();
        let j = job("test");
        ds.create_job(&j).await.unwrap();

        let updated = ds
            .update_job(
                &j.id,
                Box::new(|job| {
                    job.state = JobState::Scheduled;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.state, JobState::Scheduled);

        let err = ds
            .update_job(
                &j.id,
                Box::new(|job| {
                    if job.state != JobState::Pending {
                        return Err(DatastoreError::Conflict("not pending".into()));
                    }
                    Ok(())
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatastoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn children_are_ordered_by_position() {
        let ds = InMemoryDatastore::new();
        let parent_id = drover_core::new_id();
        for position in [2u32, 0, 1] {
            let mut t = task("j", &format!("c{position}"));
            t.parent_id = Some(parent_id.clone());
            t.position = position;
            ds.create_task(&t).await.unwrap();
        }
        let children = ds.get_children(&parent_id).await.unwrap();
        let positions: Vec<u32> = children.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn node_activity_cutoff() {
        let ds = InMemoryDatastore::new();
        let fresh = Node {
            id: "fresh".into(),
            hostname: String::new(),
            started_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
            cpu_percent: 0.0,
            memory_used: 0,
            status: drover_core::NodeStatus::Up,
            queue: String::new(),
            version: String::new(),
            task_count: 0,
        };
        let mut stale = fresh.clone();
        stale.id = "stale".into();
        stale.last_heartbeat_at = Utc::now() - chrono::Duration::hours(1);

        ds.upsert_node(&fresh).await.unwrap();
        ds.upsert_node(&stale).await.unwrap();

        let active = ds
            .get_active_nodes(Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "fresh");
    }

    #[tokio::test]
    async fn log_parts_are_ordered() {
        let ds = InMemoryDatastore::new();
        for number in [3u32, 1, 2] {
            ds.create_task_log_part(&TaskLogPart {
                task_id: "t1".into(),
                number,
                contents: format!("line {number}"),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }
        let page = ds.get_task_log_parts("t1", 1, 10).await.unwrap();
        let numbers: Vec<u32> = page.items.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
}
