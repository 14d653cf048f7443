//! SQLite connection handling.
//!
//! [`Database`] wraps a `rusqlite::Connection` behind an `Arc<Mutex<>>`
//! and dispatches every operation onto the blocking thread pool via
//! `tokio::task::spawn_blocking`, keeping the async runtime free of
//! file I/O. Schema migrations are versioned through
//! `PRAGMA user_version`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{DatastoreError, Result};

/// Ordered migration scripts; `user_version` records how many have
/// been applied.
const MIGRATIONS: &[&str] = &[
    // 1: initial schema.
    "CREATE TABLE jobs (
         id          TEXT PRIMARY KEY,
         state       TEXT NOT NULL,
         created_at  INTEGER NOT NULL,
         body        TEXT NOT NULL
     );
     CREATE INDEX idx_jobs_created ON jobs (created_at DESC);

     CREATE TABLE tasks (
         id          TEXT PRIMARY KEY,
         job_id      TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
         parent_id   TEXT,
         node_id     TEXT,
         state       TEXT NOT NULL,
         position    INTEGER NOT NULL DEFAULT 0,
         created_at  INTEGER NOT NULL,
         body        TEXT NOT NULL
     );
     CREATE INDEX idx_tasks_job ON tasks (job_id, created_at);
     CREATE INDEX idx_tasks_parent ON tasks (parent_id);
     CREATE INDEX idx_tasks_node_state ON tasks (node_id, state);

     CREATE TABLE nodes (
         id                 TEXT PRIMARY KEY,
         last_heartbeat_at  INTEGER NOT NULL,
         body               TEXT NOT NULL
     );

     CREATE TABLE scheduled_jobs (
         id          TEXT PRIMARY KEY,
         state       TEXT NOT NULL,
         created_at  INTEGER NOT NULL,
         body        TEXT NOT NULL
     );

     CREATE TABLE task_logs (
         id          INTEGER PRIMARY KEY AUTOINCREMENT,
         task_id     TEXT NOT NULL,
         number      INTEGER NOT NULL,
         created_at  INTEGER NOT NULL,
         contents    TEXT NOT NULL
     );
     CREATE INDEX idx_task_logs_task ON task_logs (task_id, number);",
];

/// Thread-safe handle to a SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database at `path`, apply pragmas, and run
    /// pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create a fully-migrated in-memory database (used by tests and
    /// ephemeral standalone runs).
    pub fn open_in_memory() -> Result<Self> {
        debug!("opening in-memory database");
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        Self::apply_pragmas(&conn)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute a closure against the connection on the blocking pool.
    /// This is the only way the rest of the crate touches SQLite.
    pub async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| DatastoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    fn apply_pragmas(conn: &Connection) -> Result<()> {
        // WAL keeps readers unblocked during writes; NORMAL sync only
        // risks the last transaction on power loss, not corruption.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
        Ok(())
    }

    fn migrate(conn: &Connection) -> Result<()> {
        let applied: usize =
            conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))? as usize;
        for (i, script) in MIGRATIONS.iter().enumerate().skip(applied) {
            debug!(version = i + 1, "applying migration");
            conn.execute_batch(&format!(
                "BEGIN; {script}; PRAGMA user_version = {}; COMMIT;",
                i + 1
            ))?;
        }
        if applied < MIGRATIONS.len() {
            info!(
                from = applied,
                to = MIGRATIONS.len(),
                "database migrated"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_create_schema() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .execute(|conn| {
                let c = conn.query_row("SELECT count(*) FROM jobs", [], |row| row.get(0))?;
                Ok(c)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drover.db");
        {
            let _db = Database::open(&path).unwrap();
        }
        // Re-opening must not attempt to re-create tables.
        let db = Database::open(&path).unwrap();
        let version: i64 = db
            .execute(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(version as usize, 1);
    }
}
