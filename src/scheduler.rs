//! Greedy task/worker matcher.
//!
//! Holds the pending task queue and the idle worker queue. `schedule()` walks
//! tasks in queue order and, for each, idle workers in queue order, returning
//! the first eligible pair. This is O(tasks × workers) and deterministic.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::task::{Properties, Task, TaskId};
use crate::worker::WorkerId;

/// Where new entries land in a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Append at the back.
    #[default]
    Fifo,
    /// Push at the front, so workers that drain fast come back first.
    Lifo,
}

impl FromStr for QueuePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "lifo" | "stack" => Ok(Self::Lifo),
            other => Err(format!("unknown queue policy '{other}' (expected fifo or lifo)")),
        }
    }
}

/// A submitted task waiting in, or travelling through, the scheduler.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: TaskId,
    pub task: Task,
    /// Workers that rejected this task; never paired with it again.
    pub rejected_by: HashSet<WorkerId>,
    /// Set once the recovery task has been substituted in.
    pub recovered: bool,
    /// Times this id has been handed to a worker.
    pub attempts: u32,
}

impl QueuedTask {
    pub fn new(id: TaskId, task: Task) -> Self {
        Self {
            id,
            task,
            rejected_by: HashSet::new(),
            recovered: false,
            attempts: 0,
        }
    }

    /// Whether this task may run on `worker`.
    pub fn is_eligible_on(&self, worker: &IdleWorker) -> bool {
        !self.rejected_by.contains(&worker.id)
            && self.task.dependency().is_satisfied_by(&worker.properties)
    }
}

/// A worker waiting for a task.
#[derive(Debug, Clone)]
pub struct IdleWorker {
    pub id: WorkerId,
    pub properties: Arc<Properties>,
}

/// Pending-task and idle-worker queues under one ordering policy.
#[derive(Debug, Default)]
pub struct Scheduler {
    policy: QueuePolicy,
    tasks: VecDeque<QueuedTask>,
    workers: VecDeque<IdleWorker>,
}

impl Scheduler {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            tasks: VecDeque::new(),
            workers: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub fn add_task(&mut self, task: QueuedTask) {
        match self.policy {
            QueuePolicy::Fifo => self.tasks.push_back(task),
            QueuePolicy::Lifo => self.tasks.push_front(task),
        }
    }

    pub fn add_worker(&mut self, worker: IdleWorker) {
        match self.policy {
            QueuePolicy::Fifo => self.workers.push_back(worker),
            QueuePolicy::Lifo => self.workers.push_front(worker),
        }
    }

    /// Remove a task by id, or the head of the queue.
    pub fn pop_task(&mut self, id: Option<TaskId>) -> Result<QueuedTask, SchedulerError> {
        match id {
            Some(id) => {
                let index = self
                    .tasks
                    .iter()
                    .position(|t| t.id == id)
                    .ok_or(SchedulerError::TaskNotQueued(id))?;
                self.tasks.remove(index).ok_or(SchedulerError::TaskNotQueued(id))
            }
            None => self.tasks.pop_front().ok_or(SchedulerError::NoTasks),
        }
    }

    /// Remove a worker by id, or the head of the queue.
    pub fn pop_worker(&mut self, id: Option<WorkerId>) -> Result<IdleWorker, SchedulerError> {
        match id {
            Some(id) => {
                let index = self
                    .workers
                    .iter()
                    .position(|w| w.id == id)
                    .ok_or(SchedulerError::WorkerNotIdle(id))?;
                self.workers.remove(index).ok_or(SchedulerError::WorkerNotIdle(id))
            }
            None => self.workers.pop_front().ok_or(SchedulerError::NoWorkers),
        }
    }

    /// Take the first eligible (worker, task) pair out of both queues.
    ///
    /// `None` just means nothing is runnable right now.
    pub fn schedule(&mut self) -> Option<(IdleWorker, QueuedTask)> {
        let (ti, wi) = self.tasks.iter().enumerate().find_map(|(ti, task)| {
            self.workers
                .iter()
                .position(|worker| task.is_eligible_on(worker))
                .map(|wi| (ti, wi))
        })?;

        let task = self.tasks.remove(ti)?;
        let worker = self.workers.remove(wi)?;
        Some((worker, task))
    }

    /// Drain every pending task in queue order.
    pub fn drain_tasks(&mut self) -> Vec<QueuedTask> {
        self.tasks.drain(..).collect()
    }

    pub fn ntasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn nworkers(&self) -> usize {
        self.workers.len()
    }

    pub fn has_worker(&self, id: WorkerId) -> bool {
        self.workers.iter().any(|w| w.id == id)
    }

    /// Pending task ids in queue order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id).collect()
    }

    /// Idle worker ids in queue order.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id).collect()
    }
}
