//! Persistence contract for drover.
//!
//! All coordinator state transitions go through [`Datastore::update_job`]
//! and [`Datastore::update_task`]: the mutator closure observes the
//! current row under the store's transaction and either applies the
//! transition or rejects it with [`DatastoreError::Conflict`]. This is
//! what makes handlers safe under at-least-once delivery and multiple
//! coordinator replicas; no in-process coordination is assumed.
//!
//! Non-idempotent multi-row operations (composite-parent completion,
//! cron materialization) additionally serialize on the [`Locker`].

mod db;
mod error;
mod inmemory;
mod locker;
mod sqlite;

pub use db::Database;
pub use error::{DatastoreError, Result};
pub use inmemory::InMemoryDatastore;
pub use locker::{InMemoryLocker, LockLease, Locker};
pub use sqlite::SqliteDatastore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use drover_core::{Job, Node, ScheduledJob, Task, TaskLogPart};

/// Mutator applied to a job row inside the store's transaction.
pub type JobMutator = Box<dyn FnOnce(&mut Job) -> Result<()> + Send>;
/// Mutator applied to a task row inside the store's transaction.
pub type TaskMutator = Box<dyn FnOnce(&mut Task) -> Result<()> + Send>;
/// Mutator applied to a scheduled-job row inside the store's transaction.
pub type ScheduledJobMutator = Box<dyn FnOnce(&mut ScheduledJob) -> Result<()> + Send>;

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 1-based page number.
    pub number: u32,
    /// Number of items on this page.
    pub size: usize,
    pub total_pages: u32,
    pub total_items: usize,
}

impl<T> Page<T> {
    /// Assemble a page from the full, already-ordered item set.
    pub fn slice(all: Vec<T>, number: u32, page_size: u32) -> Page<T> {
        let total_items = all.len();
        let page_size = page_size.max(1) as usize;
        let total_pages = total_items.div_ceil(page_size).max(1) as u32;
        let start = (number.max(1) as usize - 1) * page_size;
        let items: Vec<T> = all
            .into_iter()
            .skip(start)
            .take(page_size)
            .collect();
        Page {
            number: number.max(1),
            size: items.len(),
            items,
            total_pages,
            total_items,
        }
    }
}

/// The persistence capability for jobs, tasks, nodes, scheduled jobs,
/// and task logs.
///
/// Mutator closures run while the implementation holds the row (a
/// SQLite transaction or an in-memory shard lock): they must be quick
/// and must not call back into the datastore.
#[async_trait]
pub trait Datastore: Send + Sync {
    // -- jobs ---------------------------------------------------------------
    async fn create_job(&self, job: &Job) -> Result<()>;
    /// Fetch a job with its `execution` log populated from task rows.
    async fn get_job(&self, id: &str) -> Result<Job>;
    /// Apply `mutator` to the job row transactionally; returns the
    /// updated row.
    async fn update_job(&self, id: &str, mutator: JobMutator) -> Result<Job>;
    async fn delete_job(&self, id: &str) -> Result<()>;
    /// Jobs ordered newest-first, without execution logs.
    async fn get_jobs(&self, page: u32, size: u32) -> Result<Page<Job>>;

    // -- tasks --------------------------------------------------------------
    async fn create_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<Task>;
    async fn update_task(&self, id: &str, mutator: TaskMutator) -> Result<Task>;
    /// All tasks of a job, oldest-first.
    async fn get_job_tasks(&self, job_id: &str) -> Result<Vec<Task>>;
    /// Tasks of a job still in {Pending, Scheduled, Running}.
    async fn get_active_tasks(&self, job_id: &str) -> Result<Vec<Task>>;
    /// Children of a composite parent, ordered by position.
    async fn get_children(&self, parent_id: &str) -> Result<Vec<Task>>;
    /// Scheduled/Running tasks assigned to a node.
    async fn get_node_active_tasks(&self, node_id: &str) -> Result<Vec<Task>>;

    // -- nodes --------------------------------------------------------------
    /// Create the node on first heartbeat, update it afterwards.
    async fn upsert_node(&self, node: &Node) -> Result<()>;
    async fn get_node(&self, id: &str) -> Result<Node>;
    async fn get_nodes(&self) -> Result<Vec<Node>>;
    /// Nodes whose heartbeat is newer than `cutoff`.
    async fn get_active_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<Node>>;

    // -- scheduled jobs -----------------------------------------------------
    async fn create_scheduled_job(&self, job: &ScheduledJob) -> Result<()>;
    async fn get_scheduled_job(&self, id: &str) -> Result<ScheduledJob>;
    async fn get_scheduled_jobs(&self, page: u32, size: u32) -> Result<Page<ScheduledJob>>;
    async fn get_active_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>>;
    async fn update_scheduled_job(
        &self,
        id: &str,
        mutator: ScheduledJobMutator,
    ) -> Result<ScheduledJob>;
    async fn delete_scheduled_job(&self, id: &str) -> Result<()>;

    // -- task logs ----------------------------------------------------------
    async fn create_task_log_part(&self, part: &TaskLogPart) -> Result<()>;
    /// Log parts for a task ordered by sequence number.
    async fn get_task_log_parts(&self, task_id: &str, page: u32, size: u32)
    -> Result<Page<TaskLogPart>>;

    // -- misc ---------------------------------------------------------------
    async fn health_check(&self) -> Result<()>;
}
