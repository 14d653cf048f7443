//! Job model: a user-submitted composition of tasks executed as one
//! unit.
//!
//! The job row owns the *template* task list (pre-expansion) and a
//! 1-indexed `position` pointer; concrete task rows are instantiated
//! from the template by the planner as the job advances. `execution`
//! is derived on read from the job's persisted tasks.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::task::Task;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
///
/// Terminal states are absorbing; the only way back out is the
/// explicit `Restart` transition, accepted from Cancelled or Failed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Pending,
    Scheduled,
    Running,
    Completed,
    Cancelled,
    Failed,
    Restart,
}

impl JobState {
    /// Completed, Cancelled, and Failed absorb all further events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }

    /// Pending, Scheduled, and Running jobs still accept task events.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Pending | JobState::Scheduled | JobState::Running
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Scheduled => "SCHEDULED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
            JobState::Restart => "RESTART",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Snapshot of a finished task, exposed to expressions as
/// `tasks.<name>.result` / `tasks.<name>.state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSnapshot {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub state: String,
}

/// The evaluation context accumulated by a job as it runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobContext {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub secrets: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tasks: HashMap<String, TaskSnapshot>,
}

impl JobContext {
    /// Build the JSON object expressions are evaluated against.
    pub fn to_eval_context(&self) -> Value {
        json!({
            "inputs": self.inputs,
            "secrets": self.secrets,
            "tasks": self.tasks,
        })
    }

    /// Record a finished task's snapshot under its name.
    pub fn record(&mut self, task: &Task) {
        self.tasks.insert(
            task.name.clone(),
            TaskSnapshot {
                result: task.result.clone(),
                state: task.state.to_string(),
            },
        );
    }
}

/// Links a sub-job back to the task that spawned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParent {
    pub task_id: String,
}

/// Submitter-requested synchronous wait: the API blocks until the job
/// reaches a terminal state or the timeout expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitSpec {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Delete the job row this long after it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoDelete {
    #[serde(with = "humantime_serde")]
    pub after: Duration,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A user-submitted unit of work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub state: JobState,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// The template task list, pre-expansion.
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// 1-indexed pointer into `tasks`; may reach `tasks.len() + 1` on
    /// terminal states.
    #[serde(default)]
    pub position: u32,
    #[serde(default)]
    pub task_count: u32,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub context: JobContext,
    /// Expression evaluated on completion to produce `result`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    /// Flat append-only record of every task instantiated for this
    /// job; populated on read, never persisted on the job row itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution: Vec<Task>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<JobParent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete: Option<AutoDelete>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub secrets: HashMap<String, String>,
}

impl Job {
    /// The template task at the job's current position, if any.
    pub fn current_template(&self) -> Option<&Task> {
        if self.position == 0 {
            return None;
        }
        self.tasks.get(self.position as usize - 1)
    }

    /// Has the position pointer advanced past the last task?
    pub fn is_exhausted(&self) -> bool {
        self.position as usize > self.tasks.len()
    }

    /// Strip secret values before the job leaves the system (API
    /// responses, topic events). Keys are preserved so callers can see
    /// which secrets a job carries.
    pub fn redacted(mut self) -> Job {
        for value in self.secrets.values_mut() {
            *value = "[REDACTED]".to_string();
        }
        for value in self.context.secrets.values_mut() {
            *value = "[REDACTED]".to_string();
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
