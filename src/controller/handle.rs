//! Public request/response contract of the task controller.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use super::actor::{Command, ControllerActor};
use super::events::ControllerEvent;
use super::status::QueueReport;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::task::{Properties, Task, TaskId, TaskResult};
use crate::worker::{Worker, WorkerId};

/// Cloneable handle to a running task controller.
///
/// Every call is a message to the controller actor; blocking calls park a
/// waiter there and suspend only the caller.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<ControllerEvent>,
}

impl ControllerHandle {
    /// Spawn a controller on the current tokio runtime.
    pub fn spawn(config: ControllerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let (events, _rx) = broadcast::channel(config.event_capacity.max(1));

        let actor = ControllerActor::new(config, tx.downgrade(), events.clone());
        tokio::spawn(actor.run(rx));

        Self { tx, events }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ControllerError::Shutdown)?;
        rx.await.map_err(|_| ControllerError::Shutdown)
    }

    /// Submit a task. Returns its id immediately; execution is asynchronous.
    pub async fn run(&self, task: Task) -> Result<TaskId, ControllerError> {
        self.request(|reply| Command::Submit { task, reply }).await
    }

    /// Fetch a task's result. Without `block`, an unfinished task yields `None`.
    pub async fn get_task_result(
        &self,
        id: TaskId,
        block: bool,
    ) -> Result<Option<TaskResult>, ControllerError> {
        self.request(|reply| Command::GetResult { id, block, reply }).await?
    }

    /// Abort a task. Pending tasks finish as aborted at once; running ones
    /// finish as aborted whenever their worker reports back.
    pub async fn abort(&self, id: TaskId) -> Result<(), ControllerError> {
        self.request(|reply| Command::Abort { id, reply }).await?
    }

    /// Wait until every id has reached a terminal state.
    pub async fn barrier(&self, ids: &[TaskId]) -> Result<(), ControllerError> {
        let ids = ids.to_vec();
        self.request(|reply| Command::Barrier { ids, reply }).await?
    }

    /// Force a dispatch pass.
    pub async fn spin(&self) -> Result<(), ControllerError> {
        self.tx
            .send(Command::Spin)
            .await
            .map_err(|_| ControllerError::Shutdown)
    }

    pub async fn queue_status(&self, verbose: bool) -> Result<QueueReport, ControllerError> {
        self.request(|reply| Command::QueueStatus { verbose, reply }).await
    }

    /// Drop cached results for `ids`, or for every finished task when `None`.
    pub async fn purge_results(&self, ids: Option<Vec<TaskId>>) -> Result<usize, ControllerError> {
        self.request(|reply| Command::Purge { ids, reply }).await?
    }

    /// Worker registration notification. Returns false for a duplicate id.
    pub async fn register_worker(
        &self,
        id: WorkerId,
        properties: Properties,
        worker: Arc<dyn Worker>,
    ) -> Result<bool, ControllerError> {
        self.request(|reply| Command::RegisterWorker {
            id,
            properties,
            worker,
            reply,
        })
        .await
    }

    /// Worker departure notification. A task it was running fails with an
    /// engine error. Returns false for an unknown id.
    pub async fn unregister_worker(&self, id: WorkerId) -> Result<bool, ControllerError> {
        self.request(|reply| Command::UnregisterWorker { id, reply }).await
    }

    /// Currently registered worker ids.
    pub async fn workers(&self) -> Result<Vec<WorkerId>, ControllerError> {
        self.request(|reply| Command::Workers { reply }).await
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Lifecycle events as a stream; lagged events are skipped.
    pub fn events(&self) -> impl Stream<Item = ControllerEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    /// Stop the controller. Outstanding waiters are released with
    /// [`ControllerError::Shutdown`].
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| ControllerError::Shutdown)
    }
}
