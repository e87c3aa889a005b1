//! Remote failures as Rust errors.

use std::fmt;

use serde_json::Value;

use crate::task::{FailureKind, RemoteFailure, TaskId, TaskResult};
use crate::worker::WorkerId;

/// A failure raised by one task on one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub task_id: TaskId,
    /// Worker the failure came from; `None` when the task never ran.
    pub engine_id: Option<WorkerId>,
    pub kind: FailureKind,
    pub message: String,
    pub traceback: Option<String>,
}

impl RemoteError {
    pub fn new(task_id: TaskId, engine_id: Option<WorkerId>, failure: RemoteFailure) -> Self {
        Self {
            task_id,
            engine_id,
            kind: failure.kind,
            message: failure.message,
            traceback: failure.traceback,
        }
    }

    /// Split a result into its value or its remote error.
    pub fn from_result(result: TaskResult) -> Result<Value, Self> {
        let (task_id, engine_id) = (result.task_id, result.engine_id);
        result
            .into_value()
            .map_err(|failure| Self::new(task_id, engine_id, failure))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.engine_id {
            Some(engine) => write!(f, "[engine {engine}] ")?,
            None => f.write_str("[no engine] ")?,
        }
        write!(f, "task {}: {}: {}", self.task_id, self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Failures from a fan-out, kept alongside the values that did succeed.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeError {
    members: Vec<(TaskId, Result<Value, RemoteError>)>,
}

impl CompositeError {
    pub fn new(members: Vec<(TaskId, Result<Value, RemoteError>)>) -> Self {
        Self { members }
    }

    /// Every member in submission order.
    pub fn members(&self) -> &[(TaskId, Result<Value, RemoteError>)] {
        &self.members
    }

    pub fn failures(&self) -> impl Iterator<Item = &RemoteError> {
        self.members.iter().filter_map(|(_, r)| r.as_ref().err())
    }

    /// Values of the members that succeeded.
    pub fn values(&self) -> Vec<(TaskId, &Value)> {
        self.members
            .iter()
            .filter_map(|(id, r)| r.as_ref().ok().map(|v| (*id, v)))
            .collect()
    }

    /// Surface the first constituent failure.
    pub fn raise_exception(&self) -> Result<(), RemoteError> {
        match self.failures().next() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// The bare error when exactly one member failed, otherwise `self`.
    pub fn unwrap_single(self) -> Result<RemoteError, Self> {
        let single = {
            let mut failures = self.failures();
            match (failures.next(), failures.next()) {
                (Some(e), None) => Some(e.clone()),
                _ => None,
            }
        };
        single.ok_or(self)
    }
}

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failures().count();
        write!(f, "{failed} of {} task(s) raised an error", self.members.len())?;
        for e in self.failures() {
            write!(f, "\n  {e}")?;
            if let Some(traceback) = &e.traceback {
                for line in traceback.lines() {
                    write!(f, "\n    {line}")?;
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for CompositeError {}
