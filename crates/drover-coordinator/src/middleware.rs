//! Interception chains for job, task, and node events.
//!
//! Each chain is an onion: middleware receives the event, the entity
//! (mutable, so it can rewrite fields in place), and a `next` handle.
//! Not calling `next` short-circuits; returning an error aborts the
//! event, and the coordinator's entry wrappers translate that into a
//! Failed task/job. The innermost layer is always the coordinator's
//! own handler.
//!
//! Web interception is not modeled here: the HTTP surface composes
//! tower layers in front of the axum router instead.

use std::sync::Arc;

use async_trait::async_trait;

use drover_core::{Job, Node, Task};

use crate::error::Result;

/// The event kind delivered to task middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// The task moved (or is about to move) between states.
    StateChange,
}

/// The event kind delivered to job middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// The job moved (or is about to move) between states.
    StateChange,
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// A task event handler: either a base handler or the tail of a chain.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, event: TaskEvent, task: &mut Task) -> Result<()>;
}

/// A job event handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn call(&self, event: JobEvent, job: &mut Job) -> Result<()>;
}

/// A node (heartbeat) handler.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn call(&self, node: &mut Node) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Middleware traits
// ---------------------------------------------------------------------------

/// Task-event interceptor.
#[async_trait]
pub trait TaskMiddleware: Send + Sync {
    async fn handle(
        &self,
        event: TaskEvent,
        task: &mut Task,
        next: &dyn TaskHandler,
    ) -> Result<()>;
}

/// Job-event interceptor.
#[async_trait]
pub trait JobMiddleware: Send + Sync {
    async fn handle(&self, event: JobEvent, job: &mut Job, next: &dyn JobHandler) -> Result<()>;
}

/// Heartbeat interceptor.
#[async_trait]
pub trait NodeMiddleware: Send + Sync {
    async fn handle(&self, node: &mut Node, next: &dyn NodeHandler) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

/// A middleware stack wrapped around a base task handler.
#[derive(Clone)]
pub struct TaskChain {
    middleware: Arc<[Arc<dyn TaskMiddleware>]>,
    base: Arc<dyn TaskHandler>,
}

impl TaskChain {
    pub fn new(middleware: Vec<Arc<dyn TaskMiddleware>>, base: Arc<dyn TaskHandler>) -> Self {
        Self {
            middleware: middleware.into(),
            base,
        }
    }
}

#[async_trait]
impl TaskHandler for TaskChain {
    async fn call(&self, event: TaskEvent, task: &mut Task) -> Result<()> {
        TaskLink {
            chain: self,
            index: 0,
        }
        .call(event, task)
        .await
    }
}

struct TaskLink<'a> {
    chain: &'a TaskChain,
    index: usize,
}

#[async_trait]
impl TaskHandler for TaskLink<'_> {
    async fn call(&self, event: TaskEvent, task: &mut Task) -> Result<()> {
        match self.chain.middleware.get(self.index) {
            Some(mw) => {
                let next = TaskLink {
                    chain: self.chain,
                    index: self.index + 1,
                };
                mw.handle(event, task, &next).await
            }
            None => self.chain.base.call(event, task).await,
        }
    }
}

/// A middleware stack wrapped around a base job handler.
#[derive(Clone)]
pub struct JobChain {
    middleware: Arc<[Arc<dyn JobMiddleware>]>,
    base: Arc<dyn JobHandler>,
}

impl JobChain {
    pub fn new(middleware: Vec<Arc<dyn JobMiddleware>>, base: Arc<dyn JobHandler>) -> Self {
        Self {
            middleware: middleware.into(),
            base,
        }
    }
}

#[async_trait]
impl JobHandler for JobChain {
    async fn call(&self, event: JobEvent, job: &mut Job) -> Result<()> {
        JobLink {
            chain: self,
            index: 0,
        }
        .call(event, job)
        .await
    }
}

struct JobLink<'a> {
    chain: &'a JobChain,
    index: usize,
}

#[async_trait]
impl JobHandler for JobLink<'_> {
    async fn call(&self, event: JobEvent, job: &mut Job) -> Result<()> {
        match self.chain.middleware.get(self.index) {
            Some(mw) => {
                let next = JobLink {
                    chain: self.chain,
                    index: self.index + 1,
                };
                mw.handle(event, job, &next).await
            }
            None => self.chain.base.call(event, job).await,
        }
    }
}

/// A middleware stack wrapped around a base node handler.
#[derive(Clone)]
pub struct NodeChain {
    middleware: Arc<[Arc<dyn NodeMiddleware>]>,
    base: Arc<dyn NodeHandler>,
}

impl NodeChain {
    pub fn new(middleware: Vec<Arc<dyn NodeMiddleware>>, base: Arc<dyn NodeHandler>) -> Self {
        Self {
            middleware: middleware.into(),
            base,
        }
    }
}

#[async_trait]
impl NodeHandler for NodeChain {
    async fn call(&self, node: &mut Node) -> Result<()> {
        NodeLink {
            chain: self,
            index: 0,
        }
        .call(node)
        .await
    }
}

struct NodeLink<'a> {
    chain: &'a NodeChain,
    index: usize,
}

#[async_trait]
impl NodeHandler for NodeLink<'_> {
    async fn call(&self, node: &mut Node) -> Result<()> {
        match self.chain.middleware.get(self.index) {
            Some(mw) => {
                let next = NodeLink {
                    chain: self.chain,
                    index: self.index + 1,
                };
                mw.handle(node, &next).await
            }
            None => self.chain.base.call(node).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordinatorError;
    use std::sync::Mutex;

    struct Recorder {
        log: Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
        short_circuit: bool,
    }

    #[async_trait]
    impl TaskMiddleware for Recorder {
        async fn handle(
            &self,
            event: TaskEvent,
            task: &mut Task,
            next: &dyn TaskHandler,
        ) -> Result<()> {
            self.log.lock().unwrap().push(self.label);
            if self.short_circuit {
                return Ok(());
            }
            next.call(event, task).await
        }
    }

    struct Base {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl TaskHandler for Base {
        async fn call(&self, _event: TaskEvent, task: &mut Task) -> Result<()> {
            self.log.lock().unwrap().push("base");
            task.result = "handled".into();
            Ok(())
        }
    }

    fn chain(
        log: &Arc<Mutex<Vec<&'static str>>>,
        labels: &[(&'static str, bool)],
    ) -> TaskChain {
        let middleware: Vec<Arc<dyn TaskMiddleware>> = labels
            .iter()
            .map(|(label, short_circuit)| {
                Arc::new(Recorder {
                    log: Arc::clone(log),
                    label,
                    short_circuit: *short_circuit,
                }) as Arc<dyn TaskMiddleware>
            })
            .collect();
        TaskChain::new(
            middleware,
            Arc::new(Base {
                log: Arc::clone(log),
            }),
        )
    }

    #[tokio::test]
    async fn onion_runs_outside_in_then_base() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log, &[("outer", false), ("inner", false)]);

        let mut task = Task::default();
        chain.call(TaskEvent::StateChange, &mut task).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner", "base"]);
        assert_eq!(task.result, "handled");
    }

    #[tokio::test]
    async fn short_circuit_skips_base() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log, &[("outer", true), ("inner", false)]);

        let mut task = Task::default();
        chain.call(TaskEvent::StateChange, &mut task).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["outer"]);
        assert!(task.result.is_empty());
    }

    struct Failing;

    #[async_trait]
    impl TaskMiddleware for Failing {
        async fn handle(
            &self,
            _event: TaskEvent,
            _task: &mut Task,
            _next: &dyn TaskHandler,
        ) -> Result<()> {
            Err(CoordinatorError::Middleware("nope".into()))
        }
    }

    #[tokio::test]
    async fn middleware_errors_propagate() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = TaskChain::new(
            vec![Arc::new(Failing)],
            Arc::new(Base {
                log: Arc::clone(&log),
            }),
        );
        let mut task = Task::default();
        let err = chain
            .call(TaskEvent::StateChange, &mut task)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Middleware(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_chain_is_just_the_base() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log, &[]);
        let mut task = Task::default();
        chain.call(TaskEvent::StateChange, &mut task).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["base"]);
    }
}
