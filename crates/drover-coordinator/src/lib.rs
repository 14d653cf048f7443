//! The drover coordinator: a broker-driven event loop that owns all
//! job and task state transitions.
//!
//! The coordinator subscribes to the reserved queues (`pending`,
//! `started`, `completed`, `error`, `jobs`, `heartbeat`, `progress`,
//! `logs`), runs each event through its middleware chain into a thin
//! transactional handler, and drives jobs to a terminal state via the
//! planner. It also hosts the cron scheduler, the node health sweep,
//! and the administrative HTTP API.
//!
//! Every handler is safe under at-least-once delivery and multiple
//! coordinator replicas: writes are predicated on observed state and
//! non-idempotent sections serialize on the [`Locker`].

mod api;
pub mod error;
mod flow;
mod handlers;
mod health;
pub mod middleware;
mod planner;
mod scheduler;

pub use error::{CoordinatorError, Result};
pub use flow::JobFlow;
pub use planner::{PlanOutcome, Planner};
pub use scheduler::JobScheduler;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::Request;
use axum::response::Response;
use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use drover_broker::{Broker, BrokerError};
use drover_core::queue::{
    QUEUE_COMPLETED, QUEUE_ERROR, QUEUE_HEARTBEAT, QUEUE_JOBS, QUEUE_LOGS, QUEUE_PENDING,
    QUEUE_PROGRESS, QUEUE_STARTED,
};
use drover_core::{HEARTBEAT_PERIOD, Job, Node, NodeStatus, Task, TaskState};
use drover_datastore::{Datastore, DatastoreError, Locker};

use crate::flow::JobBase;
use crate::handlers::{
    CompletedHandler, FailedHandler, HeartbeatHandler, LogsHandler, PendingHandler,
    ProgressHandler, StartedHandler,
};
use crate::middleware::{
    JobChain, JobMiddleware, NodeChain, NodeHandler, NodeMiddleware, TaskChain, TaskEvent,
    TaskHandler, TaskMiddleware,
};

/// A user-registered HTTP endpoint, keyed as `"<METHOD> /path"`.
pub type CustomEndpoint =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Interception chains applied around the coordinator's handlers.
#[derive(Default)]
pub struct Middleware {
    pub task: Vec<Arc<dyn TaskMiddleware>>,
    pub job: Vec<Arc<dyn JobMiddleware>>,
    pub node: Vec<Arc<dyn NodeMiddleware>>,
}

/// Coordinator construction parameters.
pub struct Config {
    pub broker: Arc<dyn Broker>,
    pub datastore: Arc<dyn Datastore>,
    pub locker: Arc<dyn Locker>,
    /// HTTP bind address (`"0.0.0.0:8000"`); `None` disables the API.
    pub address: Option<String>,
    /// Consumer-concurrency overrides per coordinator queue.
    pub queues: HashMap<String, usize>,
    pub middleware: Middleware,
    /// Custom endpoints added to the API router.
    pub endpoints: Vec<(String, CustomEndpoint)>,
}

impl Config {
    pub fn new(
        broker: Arc<dyn Broker>,
        datastore: Arc<dyn Datastore>,
        locker: Arc<dyn Locker>,
    ) -> Self {
        Self {
            broker,
            datastore,
            locker,
            address: None,
            queues: HashMap::new(),
            middleware: Middleware::default(),
            endpoints: Vec::new(),
        }
    }
}

struct Inner {
    id: String,
    started_at: chrono::DateTime<Utc>,
    broker: Arc<dyn Broker>,
    ds: Arc<dyn Datastore>,
    flow: Arc<JobFlow>,
    scheduler: Arc<JobScheduler>,
    pending: TaskChain,
    started: TaskChain,
    completed: TaskChain,
    failed: TaskChain,
    nodes: NodeChain,
    progress: ProgressHandler,
    logs: LogsHandler,
    queues: HashMap<String, usize>,
    address: Option<String>,
    endpoints: Vec<(String, CustomEndpoint)>,
    stop: CancellationToken,
}

/// The orchestrator process handle. Cheaply cloneable.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: Config) -> Result<Coordinator> {
        let ds = config.datastore;
        let broker = config.broker;

        let flow = Arc::new(JobFlow::new(
            Arc::clone(&ds),
            Arc::clone(&broker),
            Arc::clone(&config.locker),
        ));
        flow.set_chain(JobChain::new(
            config.middleware.job,
            Arc::new(JobBase {
                flow: Arc::clone(&flow),
            }),
        ));

        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&ds),
            Arc::clone(&broker),
            Arc::clone(&config.locker),
        ));

        let task_chain = |base: Arc<dyn TaskHandler>| {
            TaskChain::new(config.middleware.task.clone(), base)
        };

        Ok(Coordinator {
            inner: Arc::new(Inner {
                id: drover_core::new_id(),
                started_at: Utc::now(),
                pending: task_chain(Arc::new(PendingHandler {
                    ds: Arc::clone(&ds),
                    broker: Arc::clone(&broker),
                })),
                started: task_chain(Arc::new(StartedHandler {
                    ds: Arc::clone(&ds),
                    broker: Arc::clone(&broker),
                })),
                completed: task_chain(Arc::new(CompletedHandler {
                    ds: Arc::clone(&ds),
                    flow: Arc::clone(&flow),
                })),
                failed: task_chain(Arc::new(FailedHandler {
                    ds: Arc::clone(&ds),
                    broker: Arc::clone(&broker),
                    flow: Arc::clone(&flow),
                })),
                nodes: NodeChain::new(
                    config.middleware.node,
                    Arc::new(HeartbeatHandler { ds: Arc::clone(&ds) }),
                ),
                progress: ProgressHandler { ds: Arc::clone(&ds) },
                logs: LogsHandler { ds: Arc::clone(&ds) },
                flow,
                scheduler,
                broker,
                ds,
                queues: config.queues,
                address: config.address,
                endpoints: config.endpoints,
                stop: CancellationToken::new(),
            }),
        })
    }

    /// This coordinator instance's node id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.inner.ds
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    /// The job-level engine (cancellation, restart, waiters).
    pub fn flow(&self) -> &Arc<JobFlow> {
        &self.inner.flow
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.inner.scheduler
    }

    /// Build the administrative API router. `start` serves this when
    /// an address is configured; tests drive it directly.
    pub fn api_router(&self) -> Result<axum::Router> {
        api::router(self.clone(), &self.inner.endpoints)
    }

    /// Subscribe all queue consumers and start the background loops.
    pub async fn start(&self) -> Result<()> {
        info!(coordinator_id = %self.inner.id, "starting coordinator");

        self.subscribe_tasks(QUEUE_PENDING, self.inner.pending.clone())
            .await?;
        self.subscribe_tasks(QUEUE_STARTED, self.inner.started.clone())
            .await?;
        self.subscribe_tasks(QUEUE_COMPLETED, self.inner.completed.clone())
            .await?;
        self.subscribe_tasks(QUEUE_ERROR, self.inner.failed.clone())
            .await?;
        self.subscribe_jobs().await?;
        self.subscribe_heartbeats().await?;
        self.subscribe_progress().await?;
        self.subscribe_logs().await?;

        self.inner.scheduler.start().await?;
        health::start_sweeper(
            Arc::clone(&self.inner.ds),
            Arc::clone(&self.inner.broker),
            self.inner.stop.clone(),
        );
        self.start_heartbeat();

        if let Some(address) = self.inner.address.clone() {
            api::serve(
                self.clone(),
                &self.inner.endpoints,
                &address,
                self.inner.stop.clone(),
            )
            .await?;
        }
        Ok(())
    }

    /// Stop background loops and the API listener. Queue consumers
    /// drain with the broker's own shutdown.
    pub fn stop(&self) {
        info!(coordinator_id = %self.inner.id, "stopping coordinator");
        self.inner.scheduler.stop();
        self.inner.stop.cancel();
    }

    // -- subscriptions ------------------------------------------------------

    fn concurrency(&self, queue: &str) -> usize {
        self.inner.queues.get(queue).copied().unwrap_or(1).max(1)
    }

    async fn subscribe_tasks(&self, queue: &'static str, chain: TaskChain) -> Result<()> {
        for _ in 0..self.concurrency(queue) {
            let this = self.clone();
            let chain = chain.clone();
            self.inner
                .broker
                .subscribe_tasks(
                    queue,
                    Arc::new(move |task: Task| {
                        let this = this.clone();
                        let chain = chain.clone();
                        Box::pin(async move { this.handle_task_event(&chain, task).await })
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn subscribe_jobs(&self) -> Result<()> {
        for _ in 0..self.concurrency(QUEUE_JOBS) {
            let this = self.clone();
            self.inner
                .broker
                .subscribe_jobs(Arc::new(move |job: Job| {
                    let this = this.clone();
                    Box::pin(async move { this.handle_job_event(job).await })
                }))
                .await?;
        }
        Ok(())
    }

    async fn subscribe_heartbeats(&self) -> Result<()> {
        for _ in 0..self.concurrency(QUEUE_HEARTBEAT) {
            let this = self.clone();
            self.inner
                .broker
                .subscribe_heartbeats(Arc::new(move |node: Node| {
                    let this = this.clone();
                    Box::pin(async move {
                        let mut node = node;
                        if let Err(err) = this.inner.nodes.call(&mut node).await {
                            error!(node_id = %node.id, error = %err, "heartbeat handler error");
                        }
                        Ok(())
                    })
                }))
                .await?;
        }
        Ok(())
    }

    async fn subscribe_progress(&self) -> Result<()> {
        for _ in 0..self.concurrency(QUEUE_PROGRESS) {
            let this = self.clone();
            self.inner
                .broker
                .subscribe_task_progress(Arc::new(move |task: Task| {
                    let this = this.clone();
                    Box::pin(async move {
                        this.inner
                            .progress
                            .handle(task)
                            .await
                            .map_err(|e| BrokerError::Handler(e.to_string()))
                    })
                }))
                .await?;
        }
        Ok(())
    }

    async fn subscribe_logs(&self) -> Result<()> {
        for _ in 0..self.concurrency(QUEUE_LOGS) {
            let this = self.clone();
            self.inner
                .broker
                .subscribe_task_log_parts(Arc::new(move |part| {
                    let this = this.clone();
                    Box::pin(async move {
                        this.inner
                            .logs
                            .handle(part)
                            .await
                            .map_err(|e| BrokerError::Handler(e.to_string()))
                    })
                }))
                .await?;
        }
        Ok(())
    }

    // -- entry wrappers -----------------------------------------------------

    /// Run a task event through its chain. Transient infrastructure
    /// errors bubble to the broker for redelivery; anything else
    /// (middleware rejections, handler bugs) fails the task and its
    /// job rather than crashing or looping.
    async fn handle_task_event(
        &self,
        chain: &TaskChain,
        mut task: Task,
    ) -> std::result::Result<(), BrokerError> {
        match chain.call(TaskEvent::StateChange, &mut task).await {
            Ok(()) => Ok(()),
            Err(err) if is_transient(&err) => Err(BrokerError::Handler(err.to_string())),
            Err(err) => {
                error!(task_id = %task.id, error = %err, "task event failed");
                self.poison_task(&task, &err).await;
                Ok(())
            }
        }
    }

    async fn handle_job_event(&self, mut job: Job) -> std::result::Result<(), BrokerError> {
        match self.inner.flow.dispatch(&mut job).await {
            Ok(()) => Ok(()),
            Err(err) if is_transient(&err) => Err(BrokerError::Handler(err.to_string())),
            Err(err) => {
                error!(job_id = %job.id, error = %err, "job event failed");
                let mut candidate = job;
                candidate.state = drover_core::JobState::Failed;
                candidate.error = err.to_string();
                if let Err(err) = self.inner.flow.finalize_failed(&mut candidate).await {
                    error!(error = %err, "could not mark job failed");
                }
                Ok(())
            }
        }
    }

    /// Best-effort terminal write after a non-transient handler error.
    async fn poison_task(&self, task: &Task, cause: &CoordinatorError) {
        if task.id.is_empty() {
            return;
        }
        let message = cause.to_string();
        let _ = handlers::try_update_task(&self.inner.ds, &task.id, move |t| {
            if t.state.is_terminal() {
                return Err(DatastoreError::Conflict("task already terminal".into()));
            }
            t.state = TaskState::Failed;
            t.failed_at = Some(Utc::now());
            t.error = message;
            Ok(())
        })
        .await;
        if !task.job_id.is_empty()
            && let Err(err) = self
                .inner
                .flow
                .fail_job(&task.job_id, cause.to_string())
                .await
        {
            error!(job_id = %task.job_id, error = %err, "could not fail job");
        }
    }

    // -- coordinator heartbeat ----------------------------------------------

    /// The coordinator reports itself like any node, so replicas show
    /// up in `/nodes`.
    fn start_heartbeat(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let node = Node {
                    id: this.inner.id.clone(),
                    hostname: String::new(),
                    started_at: this.inner.started_at,
                    last_heartbeat_at: Utc::now(),
                    cpu_percent: 0.0,
                    memory_used: 0,
                    status: NodeStatus::Up,
                    queue: String::new(),
                    version: drover_core::version().to_string(),
                    task_count: 0,
                };
                if let Err(err) = this.inner.broker.publish_heartbeat(&node).await {
                    error!(error = %err, "coordinator heartbeat failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_PERIOD) => {}
                    _ = this.inner.stop.cancelled() => return,
                }
            }
        });
    }
}

fn is_transient(err: &CoordinatorError) -> bool {
    matches!(
        err,
        CoordinatorError::Broker(_)
            | CoordinatorError::Datastore(
                DatastoreError::Sqlite(_)
                    | DatastoreError::TaskJoin(_)
                    | DatastoreError::LockHeld { .. }
            )
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use drover_broker::InMemoryBroker;
    use drover_core::{JobState, TaskState};
    use drover_datastore::{InMemoryDatastore, InMemoryLocker};

    fn coordinator_with(middleware: Middleware) -> (Coordinator, Arc<InMemoryDatastore>) {
        let ds = Arc::new(InMemoryDatastore::new());
        let mut config = Config::new(
            Arc::new(InMemoryBroker::new()),
            ds.clone(),
            Arc::new(InMemoryLocker::new()),
        );
        config.middleware = middleware;
        (Coordinator::new(config).unwrap(), ds)
    }

    async fn seed_running_job_with_task(ds: &InMemoryDatastore) -> Task {
        let job = Job {
            id: drover_core::new_id(),
            name: "j".into(),
            state: JobState::Running,
            created_at: Some(Utc::now()),
            position: 1,
            tasks: vec![Task {
                name: "t".into(),
                run: "x".into(),
                ..Task::default()
            }],
            task_count: 1,
            ..Job::default()
        };
        ds.create_job(&job).await.unwrap();
        let task = Task {
            id: drover_core::new_id(),
            job_id: job.id.clone(),
            name: "t".into(),
            state: TaskState::Pending,
            created_at: Some(Utc::now()),
            ..Task::default()
        };
        ds.create_task(&task).await.unwrap();
        task
    }

    struct MutatingMiddleware;

    #[async_trait]
    impl TaskMiddleware for MutatingMiddleware {
        async fn handle(
            &self,
            _event: TaskEvent,
            task: &mut Task,
            _next: &dyn middleware::TaskHandler,
        ) -> Result<()> {
            // Short-circuits the base handler, rewriting the task.
            task.result = "some result".into();
            Ok(())
        }
    }

    #[tokio::test]
    async fn task_middleware_can_rewrite_and_short_circuit() {
        let (c, ds) = coordinator_with(Middleware {
            task: vec![Arc::new(MutatingMiddleware)],
            ..Middleware::default()
        });
        let task = seed_running_job_with_task(&ds).await;

        let mut event = task.clone();
        c.handle_task_event(&c.inner.pending, event.clone())
            .await
            .unwrap();
        // The base handler never ran: the row is still Pending.
        assert_eq!(ds.get_task(&task.id).await.unwrap().state, TaskState::Pending);

        // Mutations are visible through the chain.
        c.inner
            .pending
            .call(TaskEvent::StateChange, &mut event)
            .await
            .unwrap();
        assert_eq!(event.result, "some result");
    }

    struct FailingMiddleware;

    #[async_trait]
    impl TaskMiddleware for FailingMiddleware {
        async fn handle(
            &self,
            _event: TaskEvent,
            _task: &mut Task,
            _next: &dyn middleware::TaskHandler,
        ) -> Result<()> {
            Err(CoordinatorError::Middleware("some error".into()))
        }
    }

    #[tokio::test]
    async fn task_middleware_error_fails_task_and_job() {
        let (c, ds) = coordinator_with(Middleware {
            task: vec![Arc::new(FailingMiddleware)],
            ..Middleware::default()
        });
        let task = seed_running_job_with_task(&ds).await;

        c.handle_task_event(&c.inner.pending, task.clone())
            .await
            .unwrap();

        let stored = ds.get_task(&task.id).await.unwrap();
        assert_eq!(stored.state, TaskState::Failed);
        assert!(stored.error.contains("some error"));

        let job = ds.get_job(&task.job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
    }

    struct FailingJobMiddleware;

    #[async_trait]
    impl JobMiddleware for FailingJobMiddleware {
        async fn handle(
            &self,
            _event: middleware::JobEvent,
            _job: &mut Job,
            _next: &dyn middleware::JobHandler,
        ) -> Result<()> {
            Err(CoordinatorError::Middleware("job rejected".into()))
        }
    }

    #[tokio::test]
    async fn job_middleware_error_fails_the_job() {
        let (c, ds) = coordinator_with(Middleware {
            job: vec![Arc::new(FailingJobMiddleware)],
            ..Middleware::default()
        });
        let job = Job {
            id: drover_core::new_id(),
            name: "j".into(),
            state: JobState::Pending,
            created_at: Some(Utc::now()),
            position: 1,
            tasks: vec![Task {
                name: "t".into(),
                run: "x".into(),
                ..Task::default()
            }],
            task_count: 1,
            ..Job::default()
        };
        ds.create_job(&job).await.unwrap();

        c.handle_job_event(job.clone()).await.unwrap();

        let stored = ds.get_job(&job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.error.contains("job rejected"));
    }

    #[tokio::test]
    async fn no_middleware_passes_through_to_the_base() {
        let (c, ds) = coordinator_with(Middleware::default());
        let task = seed_running_job_with_task(&ds).await;

        c.handle_task_event(&c.inner.pending, task.clone())
            .await
            .unwrap();
        assert_eq!(
            ds.get_task(&task.id).await.unwrap().state,
            TaskState::Scheduled
        );
    }
}
