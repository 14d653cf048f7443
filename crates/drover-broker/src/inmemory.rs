//! In-memory broker.
//!
//! Queues are unbounded [`async_channel`] channels: cloning the
//! receiver gives competing consumers, so each message is delivered to
//! exactly one subscriber. Topic subscriptions are plain handler
//! registrations fanned out on publish.
//!
//! Delivery is at-least-once. When a handler returns an error the
//! message is redelivered up to [`MAX_DELIVERY_ATTEMPTS`] total
//! attempts; after that, task payloads are dead-lettered onto the
//! `error` queue and anything else is dropped with a log line.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;

use drover_core::queue::{QUEUE_ERROR, QUEUE_HEARTBEAT, QUEUE_JOBS, QUEUE_LOGS, QUEUE_PROGRESS};
use drover_core::{Job, Node, Task, TaskLogPart};

use crate::error::{BrokerError, Result};
use crate::{Broker, EventHandler, JobHandler, LogHandler, NodeHandler, QueueInfo, TaskHandler, TopicEvent};

/// Total delivery attempts per message before dead-lettering.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// How long `shutdown` waits for queues to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type RawHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Delivery {
    payload: Value,
    attempt: u32,
}

#[derive(Clone)]
struct Queue {
    tx: async_channel::Sender<Delivery>,
    rx: async_channel::Receiver<Delivery>,
    subscribers: Arc<AtomicUsize>,
    unacked: Arc<AtomicUsize>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            tx,
            rx,
            subscribers: Arc::new(AtomicUsize::new(0)),
            unacked: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct TopicSub {
    pattern: String,
    handler: EventHandler,
}

struct Inner {
    queues: DashMap<String, Queue>,
    topics: std::sync::RwLock<Vec<TopicSub>>,
    closed: AtomicBool,
}

/// Broker implementation backed by process-local channels. Suitable
/// for standalone deployments and tests; a real cluster swaps in a
/// transport-backed implementation of the same trait.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: DashMap::new(),
                topics: std::sync::RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn queue(&self, name: &str) -> Queue {
        self.inner
            .queues
            .entry(name.to_string())
            .or_insert_with(Queue::new)
            .clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    async fn publish_raw(&self, queue: &str, payload: Value) -> Result<()> {
        self.ensure_open()?;
        self.send(queue, Delivery { payload, attempt: 1 }).await
    }

    async fn send(&self, queue: &str, delivery: Delivery) -> Result<()> {
        let q = self.queue(queue);
        q.tx.send(delivery)
            .await
            .map_err(|_| BrokerError::Closed)?;
        Ok(())
    }

    /// Spawn one competing-consumer loop on `queue`.
    ///
    /// `dead_letter` controls what happens when a message exhausts its
    /// delivery attempts: `true` republishes it onto the `error`
    /// queue, `false` drops it.
    fn subscribe_raw(&self, queue: &str, handler: RawHandler, dead_letter: bool) -> Result<()> {
        self.ensure_open()?;
        let q = self.queue(queue);
        q.subscribers.fetch_add(1, Ordering::Relaxed);

        let broker = self.clone();
        let queue = queue.to_string();
        let rx = q.rx.clone();
        let unacked = Arc::clone(&q.unacked);
        tokio::spawn(async move {
            while let Ok(delivery) = rx.recv().await {
                unacked.fetch_add(1, Ordering::Relaxed);
                let result = handler(delivery.payload.clone()).await;
                unacked.fetch_sub(1, Ordering::Relaxed);

                if let Err(err) = result {
                    broker
                        .redeliver(&queue, delivery, err, dead_letter)
                        .await;
                }
            }
            tracing::debug!(queue = %queue, "subscriber loop stopped");
        });
        Ok(())
    }

    async fn redeliver(&self, queue: &str, delivery: Delivery, err: BrokerError, dead_letter: bool) {
        if delivery.attempt < MAX_DELIVERY_ATTEMPTS {
            tracing::warn!(
                queue = %queue,
                attempt = delivery.attempt,
                error = %err,
                "handler failed, redelivering message"
            );
            let _ = self
                .send(
                    queue,
                    Delivery {
                        payload: delivery.payload,
                        attempt: delivery.attempt + 1,
                    },
                )
                .await;
            return;
        }

        if dead_letter && queue != QUEUE_ERROR {
            tracing::error!(
                queue = %queue,
                error = %err,
                "message exhausted delivery attempts, dead-lettering"
            );
            let mut payload = delivery.payload;
            if let Some(obj) = payload.as_object_mut() {
                obj.insert(
                    "error".to_string(),
                    Value::String(format!(
                        "handler failed after {MAX_DELIVERY_ATTEMPTS} delivery attempts: {err}"
                    )),
                );
            }
            let _ = self.publish_raw(QUEUE_ERROR, payload).await;
        } else {
            tracing::error!(
                queue = %queue,
                error = %err,
                "message exhausted delivery attempts, dropping"
            );
        }
    }

    fn typed_handler<T, F>(queue: &str, handler: F) -> RawHandler
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let queue = queue.to_string();
        Arc::new(move |payload: Value| {
            match serde_json::from_value::<T>(payload) {
                Ok(msg) => handler(msg),
                Err(err) => {
                    // A payload that cannot decode will never decode;
                    // redelivering it would loop forever.
                    tracing::error!(queue = %queue, error = %err, "dropping undecodable message");
                    Box::pin(async { Ok(()) })
                }
            }
        })
    }

    fn pattern_matches(pattern: &str, topic: &str) -> bool {
        let pattern: Vec<&str> = pattern.split('.').collect();
        let topic: Vec<&str> = topic.split('.').collect();
        pattern.len() == topic.len()
            && pattern
                .iter()
                .zip(topic.iter())
                .all(|(p, t)| *p == "*" || p == t)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish_task(&self, queue: &str, task: &Task) -> Result<()> {
        self.publish_raw(queue, serde_json::to_value(task)?).await
    }

    async fn subscribe_tasks(&self, queue: &str, handler: TaskHandler) -> Result<()> {
        let h = Self::typed_handler(queue, move |task: Task| handler(task));
        self.subscribe_raw(queue, h, true)
    }

    async fn publish_job(&self, job: &Job) -> Result<()> {
        self.publish_raw(QUEUE_JOBS, serde_json::to_value(job)?).await
    }

    async fn subscribe_jobs(&self, handler: JobHandler) -> Result<()> {
        let h = Self::typed_handler(QUEUE_JOBS, move |job: Job| handler(job));
        self.subscribe_raw(QUEUE_JOBS, h, false)
    }

    async fn publish_heartbeat(&self, node: &Node) -> Result<()> {
        self.publish_raw(QUEUE_HEARTBEAT, serde_json::to_value(node)?)
            .await
    }

    async fn subscribe_heartbeats(&self, handler: NodeHandler) -> Result<()> {
        let h = Self::typed_handler(QUEUE_HEARTBEAT, move |node: Node| handler(node));
        self.subscribe_raw(QUEUE_HEARTBEAT, h, false)
    }

    async fn publish_task_progress(&self, task: &Task) -> Result<()> {
        self.publish_raw(QUEUE_PROGRESS, serde_json::to_value(task)?)
            .await
    }

    async fn subscribe_task_progress(&self, handler: TaskHandler) -> Result<()> {
        let h = Self::typed_handler(QUEUE_PROGRESS, move |task: Task| handler(task));
        self.subscribe_raw(QUEUE_PROGRESS, h, false)
    }

    async fn publish_task_log_part(&self, part: &TaskLogPart) -> Result<()> {
        self.publish_raw(QUEUE_LOGS, serde_json::to_value(part)?)
            .await
    }

    async fn subscribe_task_log_parts(&self, handler: LogHandler) -> Result<()> {
        let h = Self::typed_handler(QUEUE_LOGS, move |part: TaskLogPart| handler(part));
        self.subscribe_raw(QUEUE_LOGS, h, false)
    }

    async fn publish_event(&self, topic: &str, payload: Value) -> Result<()> {
        self.ensure_open()?;
        let subs = self
            .inner
            .topics
            .read()
            .map_err(|_| BrokerError::Internal("topic registry poisoned".into()))?;
        for sub in subs.iter() {
            if Self::pattern_matches(&sub.pattern, topic) {
                let event = TopicEvent {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                tokio::spawn((sub.handler)(event));
            }
        }
        Ok(())
    }

    async fn subscribe_events(&self, pattern: &str, handler: EventHandler) -> Result<()> {
        self.ensure_open()?;
        let mut subs = self
            .inner
            .topics
            .write()
            .map_err(|_| BrokerError::Internal("topic registry poisoned".into()))?;
        subs.push(TopicSub {
            pattern: pattern.to_string(),
            handler,
        });
        Ok(())
    }

    async fn queues(&self) -> Result<Vec<QueueInfo>> {
        let mut infos: Vec<QueueInfo> = self
            .inner
            .queues
            .iter()
            .map(|entry| QueueInfo {
                name: entry.key().clone(),
                size: entry.value().tx.len(),
                subscribers: entry.value().subscribers.load(Ordering::Relaxed),
                unacked: entry.value().unacked.load(Ordering::Relaxed),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!("broker shutting down, draining queues");

        // Drain: wait until nothing is queued or in flight.
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                let busy = self.inner.queues.iter().any(|q| {
                    q.value().tx.len() > 0 || q.value().unacked.load(Ordering::Relaxed) > 0
                });
                if !busy {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!("broker drain timed out, closing with messages in flight");
        }
        for q in self.inner.queues.iter() {
            q.value().tx.close();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
