//! Task outcomes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::{Namespace, TaskId};
use crate::worker::WorkerId;

/// Final status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ok,
    Error,
    Aborted,
    Timeout,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Aborted => "aborted",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Raised by the task's own code.
    Application,
    /// The worker crashed or disappeared mid-task.
    Engine,
    /// The task was cancelled.
    Aborted,
    /// No registered worker could satisfy the task within the idle timeout.
    Timeout,
    /// The worker cannot execute this kind of work.
    UnsupportedWork,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Application => "ApplicationError",
            Self::Engine => "EngineError",
            Self::Aborted => "TaskAborted",
            Self::Timeout => "TaskTimeout",
            Self::UnsupportedWork => "UnsupportedWork",
        };
        write!(f, "{s}")
    }
}

/// Structured failure captured at the worker boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl RemoteFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Application, message)
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Engine, message)
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Error returned by a task body.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkError {
    /// A genuine failure; consumes a retry.
    Failed(RemoteFailure),
    /// "Cannot run here": reschedule on another worker without consuming a retry.
    Rejected(String),
}

impl WorkError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(RemoteFailure::application(message))
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

impl From<RemoteFailure> for WorkError {
    fn from(failure: RemoteFailure) -> Self {
        Self::Failed(failure)
    }
}

/// Successful output of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutput {
    /// The callable's return value (no pull list).
    Value(Value),
    /// Pulled names and their values.
    Pulled(Namespace),
}

impl TaskOutput {
    /// Flatten into a single JSON value; pulled names become an object.
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(v) => v,
            Self::Pulled(ns) => Value::Object(ns),
        }
    }
}

/// Stored, immutable outcome of one task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    /// Worker that produced the outcome, if the task ever ran.
    pub engine_id: Option<WorkerId>,
    pub status: TaskStatus,
    pub outcome: Result<TaskOutput, RemoteFailure>,
    pub submitted: DateTime<Utc>,
    pub completed: DateTime<Utc>,
    pub duration: Duration,
    /// Number of times the task was handed to a worker.
    pub attempts: u32,
    /// Retry budget left when the task finished.
    pub retries: u32,
}

impl TaskResult {
    pub fn is_ok(&self) -> bool {
        self.status == TaskStatus::Ok
    }

    pub fn failure(&self) -> Option<&RemoteFailure> {
        self.outcome.as_ref().err()
    }

    pub fn output(&self) -> Option<&TaskOutput> {
        self.outcome.as_ref().ok()
    }

    pub fn into_value(self) -> Result<Value, RemoteFailure> {
        self.outcome.map(TaskOutput::into_value)
    }
}
