//! Registry of live workers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::worker::Worker;
use crate::task::Properties;

/// Identity of a registered worker (engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worker known to the registry.
#[derive(Clone)]
pub struct RegisteredWorker {
    pub id: WorkerId,
    pub properties: Arc<Properties>,
    pub worker: Arc<dyn Worker>,
    pub registered_at: DateTime<Utc>,
}

/// Live set of worker identities.
///
/// Owned by the task controller; nothing else mutates it.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, RegisteredWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. A duplicate id is logged and ignored.
    pub fn register(
        &mut self,
        id: WorkerId,
        properties: Properties,
        worker: Arc<dyn Worker>,
    ) -> bool {
        if self.workers.contains_key(&id) {
            tracing::warn!(worker_id = %id, "Ignoring duplicate worker registration");
            return false;
        }

        self.workers.insert(
            id,
            RegisteredWorker {
                id,
                properties: Arc::new(properties),
                worker,
                registered_at: Utc::now(),
            },
        );
        tracing::info!(worker_id = %id, "Worker registered");
        true
    }

    /// Remove a worker, returning it if it was known.
    pub fn unregister(&mut self, id: WorkerId) -> Option<RegisteredWorker> {
        let removed = self.workers.remove(&id);
        match &removed {
            Some(w) => tracing::info!(
                worker_id = %id,
                registered_at = %w.registered_at,
                uptime_secs = (Utc::now() - w.registered_at).num_seconds(),
                "Worker unregistered"
            ),
            None => tracing::warn!(worker_id = %id, "Unregister for unknown worker"),
        }
        removed
    }

    pub fn get(&self, id: WorkerId) -> Option<&RegisteredWorker> {
        self.workers.get(&id)
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    /// Snapshot of registered ids, sorted.
    pub fn ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
