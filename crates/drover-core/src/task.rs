//! Task model: the individual execution step of a job.
//!
//! A task is either a *leaf* (a concrete container invocation) or a
//! *composite* (`parallel`, `each`, `subjob`) that exists purely as a
//! structural parent for its children. Composite tasks never carry
//! execution fields; input validation enforces this before a job is
//! accepted.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// ```text
/// Pending --> Scheduled --> Running --> Completed
///                                  \--> Failed  (--> Scheduled on retry)
/// any non-terminal --> Cancelled
/// gated by `if` --> Skipped
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    #[default]
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskState {
    /// Completed, Failed, Cancelled, and Skipped are absorbing states;
    /// only an explicit retry re-schedules a Failed task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::Skipped
        )
    }

    /// Is the task still in flight (Pending, Scheduled, or Running)?
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Scheduled => "SCHEDULED",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
            TaskState::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Retry policy and bookkeeping.
///
/// `attempts` counts executions: the planner sets it to 1 when it
/// instantiates a task carrying a policy, and the coordinator retries
/// a failure while `attempts <= limit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRetry {
    pub limit: u32,
    #[serde(default)]
    pub attempts: u32,
}

/// Resource limits applied to the task's container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLimits {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpus: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,
}

/// Kind of filesystem mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    Bind,
    Volume,
    Tmpfs,
}

/// A filesystem mount attached to the task's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "type")]
    pub mount_type: MountType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
}

/// Fan-out composite: all children run concurrently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelTask {
    pub tasks: Vec<Task>,
}

/// Iteration composite: `list` is an expression producing a list; one
/// child per element with `var` bound in the child's context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EachTask {
    pub list: String,
    #[serde(default = "default_each_var")]
    pub var: String,
    pub task: Box<Task>,
}

fn default_each_var() -> String {
    "item".to_string()
}

/// Sub-job composite: materializes a nested job from an inline
/// template. `job_id` records the spawned job once it exists so
/// cancellation can cascade into it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubJobTask {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub secrets: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_id: String,
}

/// The structural kind of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Leaf,
    Parallel,
    Each,
    SubJob,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A single execution step of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub job_id: String,
    /// Set for children of composite tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Index within a parallel/each sibling group.
    #[serde(default)]
    pub position: u32,

    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub state: TaskState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub queue: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<TaskRetry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<TaskLimits>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Gating expression; when it evaluates false the task is Skipped.
    #[serde(default, rename = "if", skip_serializing_if = "String::is_empty")]
    pub if_expr: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub each: Option<EachTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subjob: Option<SubJobTask>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,
    /// Worker-reported completion fraction in `[0, 1]`.
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Task {
    /// The structural kind of this task.
    pub fn kind(&self) -> TaskKind {
        if self.parallel.is_some() {
            TaskKind::Parallel
        } else if self.each.is_some() {
            TaskKind::Each
        } else if self.subjob.is_some() {
            TaskKind::SubJob
        } else {
            TaskKind::Leaf
        }
    }

    /// Is this a structural parent rather than a container invocation?
    pub fn is_composite(&self) -> bool {
        self.kind() != TaskKind::Leaf
    }

    /// The work queue this task routes to.
    pub fn target_queue(&self) -> &str {
        if self.queue.is_empty() {
            crate::queue::QUEUE_DEFAULT
        } else {
            &self.queue
        }
    }
}

// ---------------------------------------------------------------------------
// Task log
// ---------------------------------------------------------------------------

/// A bounded chunk of a task's captured stdout/stderr, ordered per
/// task by `number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogPart {
    pub task_id: String,
    pub number: u32,
    pub contents: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
