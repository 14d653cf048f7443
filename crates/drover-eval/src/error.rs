//! Evaluator error types.

/// Unified error type for template parsing and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// The expression could not be parsed.
    #[error("parse error at offset {offset}: {message}")]
    Parse {
        /// Byte offset into the expression where parsing failed.
        offset: usize,
        message: String,
    },

    /// A root identifier is not present in the evaluation context.
    #[error("unknown identifier: {name}")]
    UnknownIdentifier { name: String },

    /// A function call references a helper that is not whitelisted.
    #[error("unknown function: {name}")]
    UnknownFunction { name: String },

    /// The expression parsed but could not be evaluated against the
    /// given context (type mismatch, bad argument count, etc.).
    #[error("evaluation error: {0}")]
    Eval(String),
}

/// Convenience alias used throughout the evaluator crate.
pub type Result<T> = std::result::Result<T, EvalError>;
