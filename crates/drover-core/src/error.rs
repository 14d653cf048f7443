//! Core error types.

/// Errors produced by the core model and input validation.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A job or scheduled-job template failed validation. The message
    /// names at least one offending field.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A value could not be parsed (duration, cron expression, ...).
    #[error("invalid {what}: {reason}")]
    InvalidValue { what: &'static str, reason: String },
}

/// Convenience alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, CoreError>;
