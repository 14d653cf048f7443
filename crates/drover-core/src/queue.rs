//! Queue-name registry shared by the broker, coordinator, and worker.
//!
//! The coordinator owns a fixed set of reserved queues; workers own
//! exclusive queues prefixed with `x-`. Everything else is a shared
//! work queue that any worker may subscribe to.

/// Tasks freshly instantiated by the planner, awaiting routing.
pub const QUEUE_PENDING: &str = "pending";
/// Reserved for the scheduled transition; carries no consumer.
pub const QUEUE_SCHEDULED: &str = "scheduled";
/// Worker reports: task began executing.
pub const QUEUE_STARTED: &str = "started";
/// Worker reports: task finished successfully.
pub const QUEUE_COMPLETED: &str = "completed";
/// Worker reports: task failed (also the dead-letter queue).
pub const QUEUE_ERROR: &str = "error";
/// Worker and coordinator liveness reports.
pub const QUEUE_HEARTBEAT: &str = "heartbeat";
/// Job submissions and restarts.
pub const QUEUE_JOBS: &str = "jobs";
/// Incremental task progress reports.
pub const QUEUE_PROGRESS: &str = "progress";
/// Captured stdout/stderr chunks.
pub const QUEUE_LOGS: &str = "logs";

/// Prefix for worker-exclusive queues used for directed dispatch and
/// cancellation (`x-<workerId>`).
pub const QUEUE_EXCLUSIVE_PREFIX: &str = "x-";

/// The shared work queue used when a task declares none.
pub const QUEUE_DEFAULT: &str = "default";

/// Topic published on every job state change.
pub const TOPIC_JOB_STATE_CHANGE: &str = "job.state-change";
/// Topic published when a job completes.
pub const TOPIC_JOB_COMPLETED: &str = "job.completed";
/// Topic published when a job fails.
pub const TOPIC_JOB_FAILED: &str = "job.failed";
/// Topic published when a job is cancelled.
pub const TOPIC_JOB_CANCELLED: &str = "job.cancelled";

const COORDINATOR_QUEUES: &[&str] = &[
    QUEUE_PENDING,
    QUEUE_SCHEDULED,
    QUEUE_STARTED,
    QUEUE_COMPLETED,
    QUEUE_ERROR,
    QUEUE_HEARTBEAT,
    QUEUE_JOBS,
    QUEUE_PROGRESS,
    QUEUE_LOGS,
];

/// The exclusive queue name for a given worker/node id.
pub fn exclusive_queue(node_id: &str) -> String {
    format!("{QUEUE_EXCLUSIVE_PREFIX}{node_id}")
}

/// Is this one of the queues consumed by the coordinator?
pub fn is_coordinator_queue(name: &str) -> bool {
    COORDINATOR_QUEUES.contains(&name)
}

/// Is this a queue a worker may subscribe work from? Shared work
/// queues and exclusive queues qualify; coordinator queues do not.
pub fn is_worker_queue(name: &str) -> bool {
    !is_coordinator_queue(name)
}

/// May a job template route tasks to this queue? Exclusive and
/// coordinator queues cannot be requested by users.
pub fn is_valid_user_queue(name: &str) -> bool {
    !name.starts_with(QUEUE_EXCLUSIVE_PREFIX) && !is_coordinator_queue(name)
}
