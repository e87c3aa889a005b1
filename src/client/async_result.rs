//! Client-side handle on one or more outstanding tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{BoxStream, FuturesOrdered, FuturesUnordered, StreamExt};
use serde_json::Value;

use super::composite::{CompositeError, RemoteError};
use super::transport::TaskTransport;
use crate::error::{ClientError, ControllerError};
use crate::task::{TaskId, TaskResult};

/// Shape of the value `get` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultMode {
    /// One id; `get` returns its bare value.
    Single,
    /// Several ids (a map or gather); `get` returns an array in id order.
    Many,
}

/// Order in which [`AsyncResult::stream`] yields results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamOrder {
    /// Submission order, holding back later results until earlier ones land.
    #[default]
    Submission,
    /// First completed, first yielded.
    Completion,
}

type Cache = Arc<Mutex<HashMap<TaskId, TaskResult>>>;

/// Correlates task ids with their eventual results.
///
/// Construction is free; nothing is fetched until `ready`, `wait`, `get`,
/// or `stream` is called. Results are cached once seen.
#[derive(Clone)]
pub struct AsyncResult {
    transport: Arc<dyn TaskTransport>,
    ids: Vec<TaskId>,
    mode: ResultMode,
    cache: Cache,
}

impl AsyncResult {
    pub fn single(transport: Arc<dyn TaskTransport>, id: TaskId) -> Self {
        Self::new(transport, vec![id], ResultMode::Single)
    }

    pub fn many(transport: Arc<dyn TaskTransport>, ids: Vec<TaskId>) -> Self {
        Self::new(transport, ids, ResultMode::Many)
    }

    fn new(transport: Arc<dyn TaskTransport>, ids: Vec<TaskId>, mode: ResultMode) -> Self {
        Self {
            transport,
            ids,
            mode,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ids(&self) -> &[TaskId] {
        &self.ids
    }

    pub fn mode(&self) -> ResultMode {
        self.mode
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<TaskId, TaskResult>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn outstanding(&self) -> Vec<TaskId> {
        let cache = self.cache();
        self.ids.iter().copied().filter(|id| !cache.contains_key(id)).collect()
    }

    /// Poll each outstanding id once without blocking.
    pub async fn ready(&self) -> Result<bool, ClientError> {
        let mut complete = true;
        for id in self.outstanding() {
            match self.transport.fetch(id, false).await? {
                Some(result) => {
                    self.cache().insert(id, result);
                }
                None => complete = false,
            }
        }
        Ok(complete)
    }

    /// Wait until every id has finished or `timeout` elapses.
    ///
    /// Returns whether everything finished; a timeout is not an error.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<bool, ClientError> {
        let outstanding = self.outstanding();
        if outstanding.is_empty() {
            return Ok(true);
        }

        let collect = async {
            self.transport.barrier(&outstanding).await?;
            for id in &outstanding {
                if let Some(result) = self.transport.fetch(*id, false).await? {
                    self.cache().insert(*id, result);
                }
            }
            Ok::<_, ControllerError>(())
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(done) => done?,
                Err(_) => return Ok(false),
            },
            None => collect.await?,
        }
        Ok(self.outstanding().is_empty())
    }

    /// Wait, then return the value(s) or raise the remote failure(s).
    ///
    /// A lone id raises its bare [`RemoteError`]; several ids raise a
    /// [`CompositeError`] that still carries the successful values.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Value, ClientError> {
        let results = self.results(timeout).await?;

        let mut members: Vec<(TaskId, Result<Value, RemoteError>)> = results
            .into_iter()
            .map(|result| (result.task_id, RemoteError::from_result(result)))
            .collect();

        if members.iter().any(|(_, r)| r.is_err()) {
            if self.ids.len() == 1
                && let Some((_, Err(e))) = members.pop()
            {
                return Err(ClientError::Remote(e));
            }
            return Err(ClientError::Composite(CompositeError::new(members)));
        }

        let mut values = members.into_iter().filter_map(|(_, r)| r.ok());
        match self.mode {
            ResultMode::Single => Ok(values.next().unwrap_or(Value::Null)),
            ResultMode::Many => Ok(Value::Array(values.collect())),
        }
    }

    /// Raw results in id order once everything has finished.
    pub async fn results(&self, timeout: Option<Duration>) -> Result<Vec<TaskResult>, ClientError> {
        if !self.wait(timeout).await? {
            return Err(ClientError::NotReady {
                pending: self.outstanding(),
            });
        }

        let cache = self.cache();
        let results = self
            .ids
            .iter()
            .filter_map(|id| cache.get(id).cloned())
            .collect::<Vec<_>>();
        if results.len() < self.ids.len() {
            drop(cache);
            return Err(ClientError::NotReady {
                pending: self.outstanding(),
            });
        }
        Ok(results)
    }

    /// `None` until every result has been seen, then whether all succeeded.
    pub fn successful(&self) -> Option<bool> {
        let cache = self.cache();
        let mut all_ok = true;
        for id in &self.ids {
            all_ok &= cache.get(id)?.is_ok();
        }
        Some(all_ok)
    }

    /// Abort every id that has not finished yet.
    pub async fn abort(&self) -> Result<(), ClientError> {
        for id in self.outstanding() {
            match self.transport.abort(id).await {
                Ok(())
                | Err(
                    ControllerError::AlreadyCompleted(_) | ControllerError::AlreadyAborted(_),
                ) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Yield each result as it becomes available.
    pub fn stream(
        &self,
        order: StreamOrder,
    ) -> BoxStream<'static, Result<TaskResult, ClientError>> {
        let fetches = self.ids.iter().map(|&id| {
            let transport = Arc::clone(&self.transport);
            let cache = Arc::clone(&self.cache);
            async move {
                let cached = cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .get(&id)
                    .cloned();
                if let Some(result) = cached {
                    return Ok::<TaskResult, ClientError>(result);
                }

                let result = transport
                    .fetch(id, true)
                    .await?
                    .ok_or(ClientError::NotReady { pending: vec![id] })?;
                cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(id, result.clone());
                Ok(result)
            }
        });

        match order {
            StreamOrder::Submission => fetches.collect::<FuturesOrdered<_>>().boxed(),
            StreamOrder::Completion => fetches.collect::<FuturesUnordered<_>>().boxed(),
        }
    }
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("ids", &self.ids)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
