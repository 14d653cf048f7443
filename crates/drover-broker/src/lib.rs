//! Message broker contract for drover.
//!
//! The broker carries every interaction between the coordinator and
//! its workers: named FIFO queues with competing consumers
//! (at-least-once delivery, each message to exactly one subscriber)
//! plus a topic channel with shell-style pattern subscriptions
//! (`job.*`). Queue names are governed by [`drover_core::queue`].
//!
//! Delivery is at-least-once: handlers must be idempotent, and a
//! handler error makes the broker redeliver the message (bounded, see
//! the in-memory implementation for the dead-letter policy).

mod error;
mod inmemory;

pub use error::{BrokerError, Result};
pub use inmemory::InMemoryBroker;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use drover_core::{Job, Node, Task, TaskLogPart};

/// Handler invoked for each task delivered on a subscribed queue.
pub type TaskHandler = Arc<dyn Fn(Task) -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Handler invoked for each job submission/restart message.
pub type JobHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Handler invoked for each heartbeat.
pub type NodeHandler = Arc<dyn Fn(Node) -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Handler invoked for each captured log chunk.
pub type LogHandler = Arc<dyn Fn(TaskLogPart) -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Handler invoked for each matching topic event. Events are
/// fire-and-forget; handlers cannot trigger redelivery.
pub type EventHandler = Arc<dyn Fn(TopicEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// An event published on the topic channel.
#[derive(Debug, Clone)]
pub struct TopicEvent {
    pub topic: String,
    pub payload: Value,
}

/// Introspection record for one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub name: String,
    /// Messages waiting in the queue.
    pub size: usize,
    /// Active subscriber loops.
    pub subscribers: usize,
    /// Messages handed to a subscriber but not yet acknowledged.
    pub unacked: usize,
}

/// The message-queue / pub-sub capability used to deliver tasks,
/// jobs, heartbeats, progress reports, and log chunks.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish_task(&self, queue: &str, task: &Task) -> Result<()>;
    /// Subscribe a competing consumer to `queue`. Call repeatedly for
    /// higher concurrency; each message goes to exactly one consumer.
    async fn subscribe_tasks(&self, queue: &str, handler: TaskHandler) -> Result<()>;

    async fn publish_job(&self, job: &Job) -> Result<()>;
    async fn subscribe_jobs(&self, handler: JobHandler) -> Result<()>;

    async fn publish_heartbeat(&self, node: &Node) -> Result<()>;
    async fn subscribe_heartbeats(&self, handler: NodeHandler) -> Result<()>;

    async fn publish_task_progress(&self, task: &Task) -> Result<()>;
    async fn subscribe_task_progress(&self, handler: TaskHandler) -> Result<()>;

    async fn publish_task_log_part(&self, part: &TaskLogPart) -> Result<()>;
    async fn subscribe_task_log_parts(&self, handler: LogHandler) -> Result<()>;

    /// Publish an event on the topic channel (`job.completed`, ...).
    async fn publish_event(&self, topic: &str, payload: Value) -> Result<()>;
    /// Subscribe to topics matching `pattern`, where `*` matches one
    /// dot-separated segment (`job.*`).
    async fn subscribe_events(&self, pattern: &str, handler: EventHandler) -> Result<()>;

    async fn queues(&self) -> Result<Vec<QueueInfo>>;
    async fn health_check(&self) -> Result<()>;
    /// Stop accepting publishes, then drain in-flight work (bounded).
    async fn shutdown(&self) -> Result<()>;
}
