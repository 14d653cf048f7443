//! Core data model for drover: jobs, tasks, nodes, scheduled jobs,
//! and the validated job-template input layer.
//!
//! This crate carries no behavior beyond the model itself; the
//! planner, coordinator, and worker live in their own crates and
//! share these types through the broker and datastore contracts.

pub mod error;
pub mod input;
pub mod job;
pub mod node;
pub mod queue;
pub mod scheduled;
pub mod task;

pub use error::{CoreError, Result};
pub use job::{AutoDelete, Job, JobContext, JobParent, JobState, TaskSnapshot, WaitSpec};
pub use node::{Node, NodeStatus};
pub use scheduled::{ScheduledJob, ScheduledJobState};
pub use task::{
    EachTask, Mount, MountType, ParallelTask, SubJobTask, Task, TaskKind, TaskLimits,
    TaskLogPart, TaskRetry, TaskState,
};

/// Directory bind-mounted into every task's container; holds the run
/// script and the output file.
pub const WORK_DIR: &str = "/drover";

/// Environment variable pointing tasks at their output file.
pub const OUTPUT_ENV: &str = "DROVER_OUTPUT";

/// Default path of the output file inside the container.
pub const OUTPUT_PATH: &str = "/drover/output";

/// How often workers (and coordinators) publish heartbeats. The
/// health sweep and the `/nodes` listing derive their thresholds from
/// this period.
pub const HEARTBEAT_PERIOD: std::time::Duration = std::time::Duration::from_secs(30);

/// The drover version, stamped into heartbeats.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Generate a new time-ordered identifier (UUID v7).
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
