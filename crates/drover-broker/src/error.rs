//! Broker error types.

/// Unified error type for broker implementations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker is shut down (or shutting down) and no longer
    /// accepts publishes or subscriptions.
    #[error("broker is closed")]
    Closed,

    /// A payload could not be serialized or deserialized.
    #[error("bad payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// A handler failed; the broker is free to redeliver.
    #[error("handler error: {0}")]
    Handler(String),

    /// Transport-level failure.
    #[error("broker error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the broker crate.
pub type Result<T> = std::result::Result<T, BrokerError>;
