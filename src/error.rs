//! Error types for the task farm.

use crate::client::{CompositeError, RemoteError};
use crate::task::TaskId;
use crate::worker::WorkerId;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Queue errors raised by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task {0} is not queued")]
    TaskNotQueued(TaskId),

    #[error("Worker {0} is not idle")]
    WorkerNotIdle(WorkerId),

    #[error("Task queue is empty")]
    NoTasks,

    #[error("Idle worker queue is empty")]
    NoWorkers,
}

/// Errors returned by the task controller's public contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Task {0} already completed")]
    AlreadyCompleted(TaskId),

    #[error("Task {0} already aborted")]
    AlreadyAborted(TaskId),

    #[error("Task {0} has not finished, its result cannot be purged")]
    NotTerminal(TaskId),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Task controller has shut down")]
    Shutdown,
}

/// Errors surfaced to callers of the client layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Remote(RemoteError),

    #[error("{0}")]
    Composite(CompositeError),

    #[error("Results not ready: {} task(s) still outstanding", .pending.len())]
    NotReady { pending: Vec<TaskId> },

    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),
}

impl ClientError {
    /// The remote failure behind this error, when there is exactly one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for the task farm.
pub type Result<T> = std::result::Result<T, Error>;
