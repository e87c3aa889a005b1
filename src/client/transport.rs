//! What the client layer needs from a controller.

use async_trait::async_trait;

use crate::controller::{ControllerHandle, QueueReport};
use crate::error::ControllerError;
use crate::task::{Task, TaskId, TaskResult};

/// Request/response contract between clients and a task controller.
///
/// Clients only ever exchange task ids and results through this trait, so
/// the controller may live behind any channel that can carry them.
#[async_trait]
pub trait TaskTransport: Send + Sync {
    async fn submit(&self, task: Task) -> Result<TaskId, ControllerError>;

    /// `None` means "not finished" and is only returned when `block` is false.
    async fn fetch(&self, id: TaskId, block: bool) -> Result<Option<TaskResult>, ControllerError>;

    async fn abort(&self, id: TaskId) -> Result<(), ControllerError>;

    async fn barrier(&self, ids: &[TaskId]) -> Result<(), ControllerError>;

    async fn spin(&self) -> Result<(), ControllerError>;

    async fn queue_status(&self, verbose: bool) -> Result<QueueReport, ControllerError>;

    async fn purge(&self, ids: Option<Vec<TaskId>>) -> Result<usize, ControllerError>;
}

#[async_trait]
impl TaskTransport for ControllerHandle {
    async fn submit(&self, task: Task) -> Result<TaskId, ControllerError> {
        self.run(task).await
    }

    async fn fetch(&self, id: TaskId, block: bool) -> Result<Option<TaskResult>, ControllerError> {
        self.get_task_result(id, block).await
    }

    async fn abort(&self, id: TaskId) -> Result<(), ControllerError> {
        ControllerHandle::abort(self, id).await
    }

    async fn barrier(&self, ids: &[TaskId]) -> Result<(), ControllerError> {
        ControllerHandle::barrier(self, ids).await
    }

    async fn spin(&self) -> Result<(), ControllerError> {
        ControllerHandle::spin(self).await
    }

    async fn queue_status(&self, verbose: bool) -> Result<QueueReport, ControllerError> {
        ControllerHandle::queue_status(self, verbose).await
    }

    async fn purge(&self, ids: Option<Vec<TaskId>>) -> Result<usize, ControllerError> {
        self.purge_results(ids).await
    }
}
