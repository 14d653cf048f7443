//! SQLite-backed datastore.
//!
//! Rows are stored as JSON bodies with a few extracted columns for
//! filtering and ordering (`state`, `job_id`, `parent_id`, `node_id`,
//! `created_at`). `update_*` runs read-mutate-write inside a single
//! transaction, which is what lets mutators predicate transitions on
//! the observed state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use drover_core::{Job, Node, ScheduledJob, Task, TaskLogPart};

use crate::db::Database;
use crate::error::{DatastoreError, Result};
use crate::{Datastore, JobMutator, Page, ScheduledJobMutator, TaskMutator};

/// Datastore implementation persisting to a SQLite file.
#[derive(Clone)]
pub struct SqliteDatastore {
    db: Database,
}

impl SqliteDatastore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            db: Database::open(path)?,
        })
    }

    /// Fully-migrated in-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Database::open_in_memory()?,
        })
    }

    fn encode<T: serde::Serialize>(item: &T) -> Result<String> {
        Ok(serde_json::to_string(item)?)
    }

    fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
        Ok(serde_json::from_str(body)?)
    }

    fn millis(at: Option<DateTime<Utc>>) -> i64 {
        at.unwrap_or_else(Utc::now).timestamp_millis()
    }

    fn not_found(kind: &'static str, id: &str) -> DatastoreError {
        DatastoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    fn load_job_tasks(conn: &Connection, job_id: &str) -> Result<Vec<Task>> {
        let mut stmt = conn.prepare(
            "SELECT body FROM tasks WHERE job_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter().map(|body| Self::decode(body)).collect()
    }
}

#[async_trait]
impl Datastore for SqliteDatastore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let id = job.id.clone();
        let state = job.state.to_string();
        let created_at = Self::millis(job.created_at);
        let body = Self::encode(job)?;
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO jobs (id, state, created_at, body) VALUES (?1, ?2, ?3, ?4)",
                    params![id, state, created_at, body],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let body: Option<String> = conn
                    .query_row("SELECT body FROM jobs WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let body = body.ok_or_else(|| Self::not_found("job", &id))?;
                let mut job: Job = Self::decode(&body)?;
                job.execution = Self::load_job_tasks(conn, &id)?;
                Ok(job)
            })
            .await
    }

    async fn update_job(&self, id: &str, mutator: JobMutator) -> Result<Job> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let tx = conn.transaction()?;
                let body: Option<String> = tx
                    .query_row("SELECT body FROM jobs WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let body = body.ok_or_else(|| Self::not_found("job", &id))?;
                let mut job: Job = Self::decode(&body)?;
                mutator(&mut job)?;
                tx.execute(
                    "UPDATE jobs SET state = ?2, body = ?3 WHERE id = ?1",
                    params![id, job.state.to_string(), Self::encode(&job)?],
                )?;
                tx.commit()?;
                Ok(job)
            })
            .await
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM task_logs WHERE task_id IN (SELECT id FROM tasks WHERE job_id = ?1)",
                    params![id],
                )?;
                let deleted = tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
                tx.commit()?;
                if deleted == 0 {
                    return Err(Self::not_found("job", &id));
                }
                Ok(())
            })
            .await
    }

    async fn get_jobs(&self, page: u32, size: u32) -> Result<Page<Job>> {
        let page = page.max(1);
        let size = size.max(1);
        self.db
            .execute(move |conn| {
                let total_items: i64 =
                    conn.query_row("SELECT count(*) FROM jobs", [], |row| row.get(0))?;
                let mut stmt = conn.prepare(
                    "SELECT body FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(
                        params![size as i64, ((page - 1) * size) as i64],
                        |row| row.get::<_, String>(0),
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let items: Vec<Job> = rows
                    .iter()
                    .map(|body| Self::decode(body))
                    .collect::<Result<_>>()?;
                Ok(Page {
                    number: page,
                    size: items.len(),
                    items,
                    total_pages: ((total_items as usize).div_ceil(size as usize)).max(1) as u32,
                    total_items: total_items as usize,
                })
            })
            .await
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        let id = task.id.clone();
        let job_id = task.job_id.clone();
        let parent_id = task.parent_id.clone();
        let node_id = task.node_id.clone();
        let state = task.state.to_string();
        let position = task.position as i64;
        let created_at = Self::millis(task.created_at);
        let body = Self::encode(task)?;
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, job_id, parent_id, node_id, state, position, created_at, body) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![id, job_id, parent_id, node_id, state, position, created_at, body],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let body: Option<String> = conn
                    .query_row("SELECT body FROM tasks WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let body = body.ok_or_else(|| Self::not_found("task", &id))?;
                Self::decode(&body)
            })
            .await
    }

    async fn update_task(&self, id: &str, mutator: TaskMutator) -> Result<Task> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let tx = conn.transaction()?;
                let body: Option<String> = tx
                    .query_row("SELECT body FROM tasks WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let body = body.ok_or_else(|| Self::not_found("task", &id))?;
                let mut task: Task = Self::decode(&body)?;
                mutator(&mut task)?;
                tx.execute(
                    "UPDATE tasks SET state = ?2, node_id = ?3, body = ?4 WHERE id = ?1",
                    params![id, task.state.to_string(), task.node_id, Self::encode(&task)?],
                )?;
                tx.commit()?;
                Ok(task)
            })
            .await
    }

    async fn get_job_tasks(&self, job_id: &str) -> Result<Vec<Task>> {
        let job_id = job_id.to_string();
        self.db
            .execute(move |conn| Self::load_job_tasks(conn, &job_id))
            .await
    }

    async fn get_active_tasks(&self, job_id: &str) -> Result<Vec<Task>> {
        let job_id = job_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM tasks WHERE job_id = ?1 \
                     AND state IN ('PENDING', 'SCHEDULED', 'RUNNING') \
                     ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map(params![job_id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.iter().map(|body| Self::decode(body)).collect()
            })
            .await
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<Task>> {
        let parent_id = parent_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM tasks WHERE parent_id = ?1 ORDER BY position, id",
                )?;
                let rows = stmt
                    .query_map(params![parent_id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.iter().map(|body| Self::decode(body)).collect()
            })
            .await
    }

    async fn get_node_active_tasks(&self, node_id: &str) -> Result<Vec<Task>> {
        let node_id = node_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM tasks WHERE node_id = ?1 \
                     AND state IN ('SCHEDULED', 'RUNNING') ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map(params![node_id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.iter().map(|body| Self::decode(body)).collect()
            })
            .await
    }

    async fn upsert_node(&self, node: &Node) -> Result<()> {
        let id = node.id.clone();
        let heartbeat = node.last_heartbeat_at.timestamp_millis();
        let body = Self::encode(node)?;
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO nodes (id, last_heartbeat_at, body) VALUES (?1, ?2, ?3) \
                     ON CONFLICT (id) DO UPDATE SET \
                         last_heartbeat_at = excluded.last_heartbeat_at, \
                         body = excluded.body",
                    params![id, heartbeat, body],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_node(&self, id: &str) -> Result<Node> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let body: Option<String> = conn
                    .query_row("SELECT body FROM nodes WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let body = body.ok_or_else(|| Self::not_found("node", &id))?;
                Self::decode(&body)
            })
            .await
    }

    async fn get_nodes(&self) -> Result<Vec<Node>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare("SELECT body FROM nodes ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.iter().map(|body| Self::decode(body)).collect()
            })
            .await
    }

    async fn get_active_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<Node>> {
        let cutoff = cutoff.timestamp_millis();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM nodes WHERE last_heartbeat_at > ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.iter().map(|body| Self::decode(body)).collect()
            })
            .await
    }

    async fn create_scheduled_job(&self, job: &ScheduledJob) -> Result<()> {
        let id = job.id.clone();
        let state = format!("{:?}", job.state).to_uppercase();
        let created_at = job.created_at.timestamp_millis();
        let body = Self::encode(job)?;
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO scheduled_jobs (id, state, created_at, body) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, state, created_at, body],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_scheduled_job(&self, id: &str) -> Result<ScheduledJob> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let body: Option<String> = conn
                    .query_row(
                        "SELECT body FROM scheduled_jobs WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let body = body.ok_or_else(|| Self::not_found("scheduled job", &id))?;
                Self::decode(&body)
            })
            .await
    }

    async fn get_scheduled_jobs(&self, page: u32, size: u32) -> Result<Page<ScheduledJob>> {
        let page = page.max(1);
        let size = size.max(1);
        self.db
            .execute(move |conn| {
                let total_items: i64 =
                    conn.query_row("SELECT count(*) FROM scheduled_jobs", [], |row| row.get(0))?;
                let mut stmt = conn.prepare(
                    "SELECT body FROM scheduled_jobs ORDER BY created_at DESC, id DESC \
                     LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(
                        params![size as i64, ((page - 1) * size) as i64],
                        |row| row.get::<_, String>(0),
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let items: Vec<ScheduledJob> = rows
                    .iter()
                    .map(|body| Self::decode(body))
                    .collect::<Result<_>>()?;
                Ok(Page {
                    number: page,
                    size: items.len(),
                    items,
                    total_pages: ((total_items as usize).div_ceil(size as usize)).max(1) as u32,
                    total_items: total_items as usize,
                })
            })
            .await
    }

    async fn get_active_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn
                    .prepare("SELECT body FROM scheduled_jobs WHERE state = 'ACTIVE' ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.iter().map(|body| Self::decode(body)).collect()
            })
            .await
    }

    async fn update_scheduled_job(
        &self,
        id: &str,
        mutator: ScheduledJobMutator,
    ) -> Result<ScheduledJob> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let tx = conn.transaction()?;
                let body: Option<String> = tx
                    .query_row(
                        "SELECT body FROM scheduled_jobs WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let body = body.ok_or_else(|| Self::not_found("scheduled job", &id))?;
                let mut job: ScheduledJob = Self::decode(&body)?;
                mutator(&mut job)?;
                tx.execute(
                    "UPDATE scheduled_jobs SET state = ?2, body = ?3 WHERE id = ?1",
                    params![
                        id,
                        format!("{:?}", job.state).to_uppercase(),
                        Self::encode(&job)?
                    ],
                )?;
                tx.commit()?;
                Ok(job)
            })
            .await
    }

    async fn delete_scheduled_job(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id])?;
                if deleted == 0 {
                    return Err(Self::not_found("scheduled job", &id));
                }
                Ok(())
            })
            .await
    }

    async fn create_task_log_part(&self, part: &TaskLogPart) -> Result<()> {
        let task_id = part.task_id.clone();
        let number = part.number as i64;
        let created_at = part.created_at.timestamp_millis();
        let contents = part.contents.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO task_logs (task_id, number, created_at, contents) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![task_id, number, created_at, contents],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_task_log_parts(
        &self,
        task_id: &str,
        page: u32,
        size: u32,
    ) -> Result<Page<TaskLogPart>> {
        let task_id = task_id.to_string();
        let page = page.max(1);
        let size = size.max(1);
        self.db
            .execute(move |conn| {
                let total_items: i64 = conn.query_row(
                    "SELECT count(*) FROM task_logs WHERE task_id = ?1",
                    params![&task_id],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare(
                    "SELECT number, created_at, contents FROM task_logs \
                     WHERE task_id = ?1 ORDER BY number LIMIT ?2 OFFSET ?3",
                )?;
                let items = stmt
                    .query_map(
                        params![&task_id, size as i64, ((page - 1) * size) as i64],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        },
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?
                    .into_iter()
                    .map(|(number, created_at, contents)| TaskLogPart {
                        task_id: task_id.clone(),
                        number: number as u32,
                        contents,
                        created_at: DateTime::from_timestamp_millis(created_at)
                            .unwrap_or_else(Utc::now),
                    })
                    .collect::<Vec<_>>();
                Ok(Page {
                    number: page,
                    size: items.len(),
                    items,
                    total_pages: ((total_items as usize).div_ceil(size as usize)).max(1) as u32,
                    total_items: total_items as usize,
                })
            })
            .await
    }

    async fn health_check(&self) -> Result<()> {
        self.db
            .execute(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
