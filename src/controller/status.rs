//! Queue status reports.

use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Full id lists per category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Queued, waiting for an eligible worker.
    pub pending: Vec<TaskId>,
    /// Handed to a worker, outcome not yet known.
    pub scheduled: Vec<TaskId>,
    pub succeeded: Vec<TaskId>,
    /// Finished with an error, a timeout, or an abort.
    pub failed: Vec<TaskId>,
}

impl QueueStatus {
    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            pending: self.pending.len(),
            scheduled: self.scheduled.len(),
            succeeded: self.succeeded.len(),
            failed: self.failed.len(),
        }
    }
}

/// Per-category counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub scheduled: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Answer to `queue_status(verbose)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueReport {
    Counts(QueueCounts),
    Verbose(QueueStatus),
}

impl QueueReport {
    pub fn new(status: QueueStatus, verbose: bool) -> Self {
        if verbose {
            Self::Verbose(status)
        } else {
            Self::Counts(status.counts())
        }
    }

    /// Counts regardless of verbosity.
    pub fn counts(&self) -> QueueCounts {
        match self {
            Self::Counts(counts) => *counts,
            Self::Verbose(status) => status.counts(),
        }
    }

    pub fn ids(&self) -> Option<&QueueStatus> {
        match self {
            Self::Verbose(status) => Some(status),
            Self::Counts(_) => None,
        }
    }
}
