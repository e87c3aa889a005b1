//! Client facade over a task transport.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::async_result::AsyncResult;
use super::transport::TaskTransport;
use crate::controller::{ControllerHandle, QueueReport};
use crate::error::ClientError;
use crate::task::{Dependency, Task, TaskId, TaskResult, WorkError};

/// Options applied to every task a `map` submits.
#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    pub retries: u32,
    pub depend: Dependency,
    pub clear_after: bool,
}

/// Submits tasks and hands back [`AsyncResult`]s.
#[derive(Clone)]
pub struct TaskClient {
    transport: Arc<dyn TaskTransport>,
}

impl TaskClient {
    pub fn new(transport: Arc<dyn TaskTransport>) -> Self {
        Self { transport }
    }

    /// Client talking to an in-process controller.
    pub fn connect(handle: ControllerHandle) -> Self {
        Self::new(Arc::new(handle))
    }

    pub async fn submit(&self, task: Task) -> Result<TaskId, ClientError> {
        Ok(self.transport.submit(task).await?)
    }

    /// Submit and wrap the id in a single-result handle.
    pub async fn apply(&self, task: Task) -> Result<AsyncResult, ClientError> {
        let id = self.submit(task).await?;
        Ok(AsyncResult::single(Arc::clone(&self.transport), id))
    }

    /// Results for `ids`, in order. Unfinished tasks are `None` unless `block`.
    pub async fn get_result(
        &self,
        ids: &[TaskId],
        block: bool,
    ) -> Result<Vec<Option<TaskResult>>, ClientError> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.transport.fetch(*id, block).await?);
        }
        Ok(results)
    }

    /// Abort every id, even after one of them fails. The first error is returned.
    pub async fn abort(&self, ids: &[TaskId]) -> Result<(), ClientError> {
        let mut first_error = None;
        for id in ids {
            if let Err(err) = self.transport.abort(*id).await {
                debug!(task_id = %id, error = %err, "Abort failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub async fn barrier(&self, ids: &[TaskId]) -> Result<(), ClientError> {
        Ok(self.transport.barrier(ids).await?)
    }

    pub async fn queue_status(&self, verbose: bool) -> Result<QueueReport, ClientError> {
        Ok(self.transport.queue_status(verbose).await?)
    }

    pub async fn spin(&self) -> Result<(), ClientError> {
        Ok(self.transport.spin().await?)
    }

    /// Drop cached results on the controller; `None` purges every finished task.
    pub async fn purge(&self, ids: Option<Vec<TaskId>>) -> Result<usize, ClientError> {
        Ok(self.transport.purge(ids).await?)
    }

    /// Run `f` once per argument tuple zipped from `sequences`.
    ///
    /// The shortest sequence bounds the number of tasks.
    pub async fn map<F>(&self, f: F, sequences: Vec<Vec<Value>>) -> Result<AsyncResult, ClientError>
    where
        F: Fn(&[Value]) -> Result<Value, WorkError> + Send + Sync + 'static,
    {
        self.map_with(f, sequences, MapOptions::default()).await
    }

    pub async fn map_with<F>(
        &self,
        f: F,
        sequences: Vec<Vec<Value>>,
        options: MapOptions,
    ) -> Result<AsyncResult, ClientError>
    where
        F: Fn(&[Value]) -> Result<Value, WorkError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut ids = Vec::new();
        for args in zip_sequences(sequences) {
            let f = Arc::clone(&f);
            let task = Task::call(move |_| (*f)(&args))
                .retries(options.retries)
                .depend(options.depend.clone())
                .clear_after(options.clear_after);
            ids.push(self.submit(task).await?);
        }

        debug!(tasks = ids.len(), "Submitted map");
        Ok(AsyncResult::many(Arc::clone(&self.transport), ids))
    }
}

/// Transpose `sequences` into argument tuples, stopping at the shortest.
fn zip_sequences(sequences: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    let len = sequences.iter().map(Vec::len).min().unwrap_or(0);
    let mut columns: Vec<_> = sequences.into_iter().map(Vec::into_iter).collect();
    (0..len)
        .map(|_| columns.iter_mut().filter_map(Iterator::next).collect())
        .collect()
}
