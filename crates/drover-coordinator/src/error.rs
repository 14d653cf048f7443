//! Coordinator error types.

use drover_broker::BrokerError;
use drover_core::CoreError;
use drover_datastore::DatastoreError;

/// Unified error type for the coordinator crate.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// The requested transition is not legal from the current state
    /// (e.g. restarting a Running job). Surfaces as HTTP 400.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A middleware short-circuited with an error.
    #[error("middleware error: {0}")]
    Middleware(String),

    /// Required configuration is missing.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Catch-all for unexpected internal failures.
    #[error("internal coordinator error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the coordinator crate.
pub type Result<T> = std::result::Result<T, CoordinatorError>;
