//! Error types for procpool.

use thiserror::Error;

/// Main error type for procpool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Cannot construct pool: {0}")]
    Construction(String),

    #[error("Worker {worker} failed to initialize its executor: {message}")]
    InitializationFailed { worker: usize, message: String },

    #[error("Worker {worker} crashed: {reason}")]
    WorkerCrashed { worker: usize, reason: String },

    #[error("{0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Nix(#[from] nix::Error),
}

/// Result type alias for procpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Outcome of a single task invocation that did not produce a value.
///
/// Returned from an executor to tell the worker what to do with the task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Put the task back on the input queue unchanged; the worker keeps running.
    #[error("task asked to be retried")]
    Retry,

    /// Uncaught failure: the task is resubmitted and the worker process exits.
    #[error("task failed: {0}")]
    Failed(String),
}

impl TaskError {
    /// Build a `Failed` from any displayable error.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Error from resolving a deferred executor inside the worker process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct InitError(pub String);

impl InitError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}
