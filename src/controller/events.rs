//! Lifecycle events emitted by the controller.

use serde::{Deserialize, Serialize};

use crate::task::{TaskId, TaskStatus};
use crate::worker::WorkerId;

/// Broadcast to every subscriber as tasks and workers change state.
///
/// Delivery is best-effort: slow subscribers lag, and nobody listening is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    Submitted {
        task_id: TaskId,
    },
    Dispatched {
        task_id: TaskId,
        worker_id: WorkerId,
        attempt: u32,
    },
    /// A failed task went back to the queue, spending one retry.
    Retrying {
        task_id: TaskId,
        retries_left: u32,
    },
    /// The recovery task replaced an exhausted task under the same id.
    Recovering {
        task_id: TaskId,
    },
    /// A worker refused the task; it was requeued for another worker.
    Rejected {
        task_id: TaskId,
        worker_id: WorkerId,
        reason: String,
    },
    Finished {
        task_id: TaskId,
        status: TaskStatus,
    },
    WorkerRegistered {
        worker_id: WorkerId,
    },
    WorkerUnregistered {
        worker_id: WorkerId,
    },
}

impl ControllerEvent {
    /// Task the event concerns, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Submitted { task_id }
            | Self::Dispatched { task_id, .. }
            | Self::Retrying { task_id, .. }
            | Self::Recovering { task_id }
            | Self::Rejected { task_id, .. }
            | Self::Finished { task_id, .. } => Some(*task_id),
            Self::WorkerRegistered { .. } | Self::WorkerUnregistered { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_type_tag() {
        let event = ControllerEvent::Finished {
            task_id: TaskId(3),
            status: TaskStatus::Aborted,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "type": "finished", "task_id": 3, "status": "aborted" })
        );
    }

    #[test]
    fn task_id_accessor() {
        assert_eq!(ControllerEvent::Submitted { task_id: TaskId(1) }.task_id(), Some(TaskId(1)));
        assert_eq!(
            ControllerEvent::WorkerRegistered { worker_id: WorkerId(1) }.task_id(),
            None
        );
    }
}
