use std::backtrace::Backtrace;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("queue {queue} is full: size {size}, max {max}")]
    QueueFull { queue: String, size: u64, max: u64 },
    #[error("invalid queue name '{0}'")]
    InvalidQueueName(String),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Invalid(String),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("halted by middleware: {0}")]
    Halted(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Storage(StorageError::Json(err))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("unknown worker {0}")]
    NotFound(String),
    #[error("invalid worker state '{0}'")]
    InvalidState(String),
}

/// An internal invariant violation. Carries the stack where it was noticed
/// so the log line is enough to diagnose it.
pub struct RuntimeError {
    message: String,
    backtrace: Backtrace,
}

impl RuntimeError {
    pub fn capture(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: Backtrace::force_capture(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn log(&self) {
        tracing::error!(
            error = %self.message,
            backtrace = %self.backtrace,
            "internal error"
        );
    }
}

impl fmt::Debug for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.message, self.backtrace)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RuntimeError {}
