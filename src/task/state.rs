//! Task state machine.

use serde::{Deserialize, Serialize};

use super::result::TaskStatus;

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Queued in the scheduler, waiting for an eligible worker.
    Pending,
    /// Handed to a worker; outcome not yet known.
    Assigned,
    Succeeded,
    Failed,
    Aborted,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            // From Pending (timeout fails a queued task directly)
            (Pending, Assigned) | (Pending, Aborted) | (Pending, Failed) |
            // From Assigned (back to Pending on retry, recovery or rejection)
            (Assigned, Succeeded) | (Assigned, Failed) |
            (Assigned, Aborted) | (Assigned, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Terminal state recorded for a final status.
    pub fn for_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Ok => Self::Succeeded,
            TaskStatus::Error | TaskStatus::Timeout => Self::Failed,
            TaskStatus::Aborted => Self::Aborted,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}
