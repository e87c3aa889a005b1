//! Controller mailbox loop.
//!
//! Every queue mutation happens here, one command at a time. Worker runs are
//! spawned as separate tokio tasks that post `Completed` back into the
//! mailbox; timers (failure penalty, idle timeout) do the same.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::events::ControllerEvent;
use super::status::{QueueReport, QueueStatus};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::scheduler::{IdleWorker, QueuedTask, Scheduler};
use crate::task::{
    FailureKind, Properties, RemoteFailure, Task, TaskId, TaskOutput, TaskResult, TaskState,
    TaskStatus,
};
use crate::worker::{Execution, Worker, WorkerId, WorkerRegistry};

pub(super) type Reply<T> = oneshot::Sender<T>;
type ResultWaiter = Reply<Result<Option<TaskResult>, ControllerError>>;

/// Messages accepted by the controller.
pub(super) enum Command {
    Submit {
        task: Task,
        reply: Reply<TaskId>,
    },
    GetResult {
        id: TaskId,
        block: bool,
        reply: ResultWaiter,
    },
    Abort {
        id: TaskId,
        reply: Reply<Result<(), ControllerError>>,
    },
    Barrier {
        ids: Vec<TaskId>,
        reply: Reply<Result<(), ControllerError>>,
    },
    Spin,
    QueueStatus {
        verbose: bool,
        reply: Reply<QueueReport>,
    },
    Purge {
        ids: Option<Vec<TaskId>>,
        reply: Reply<Result<usize, ControllerError>>,
    },
    RegisterWorker {
        id: WorkerId,
        properties: Properties,
        worker: Arc<dyn Worker>,
        reply: Reply<bool>,
    },
    UnregisterWorker {
        id: WorkerId,
        reply: Reply<bool>,
    },
    Workers {
        reply: Reply<Vec<WorkerId>>,
    },
    Completed {
        task_id: TaskId,
        worker_id: WorkerId,
        token: u64,
        execution: Execution,
    },
    Readmit {
        worker_id: WorkerId,
        token: u64,
    },
    IdleTimeout {
        generation: u64,
    },
    Shutdown,
}

struct TaskRecord {
    state: TaskState,
    submitted: DateTime<Utc>,
    /// Set when `abort` arrives while the task is running.
    abort_requested: bool,
}

struct Assignment {
    worker_id: WorkerId,
    /// Identifies this dispatch; completions carrying another token are stale.
    token: u64,
    queued: QueuedTask,
}

struct BarrierWaiter {
    remaining: HashSet<TaskId>,
    reply: Reply<Result<(), ControllerError>>,
}

pub(super) struct ControllerActor {
    config: ControllerConfig,
    scheduler: Scheduler,
    registry: WorkerRegistry,
    records: HashMap<TaskId, TaskRecord>,
    assigned: HashMap<TaskId, Assignment>,
    results: HashMap<TaskId, TaskResult>,
    waiters: HashMap<TaskId, Vec<ResultWaiter>>,
    barriers: Vec<BarrierWaiter>,
    /// Workers serving a failure penalty, keyed to the pending readmission.
    penalized: HashMap<WorkerId, u64>,
    next_task_id: u64,
    next_token: u64,
    idle_generation: u64,
    idle_armed: bool,
    mailbox: mpsc::WeakSender<Command>,
    events: broadcast::Sender<ControllerEvent>,
}

impl ControllerActor {
    pub(super) fn new(
        config: ControllerConfig,
        mailbox: mpsc::WeakSender<Command>,
        events: broadcast::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(config.queue_policy),
            config,
            registry: WorkerRegistry::new(),
            records: HashMap::new(),
            assigned: HashMap::new(),
            results: HashMap::new(),
            waiters: HashMap::new(),
            barriers: Vec::new(),
            penalized: HashMap::new(),
            next_task_id: 0,
            next_token: 0,
            idle_generation: 0,
            idle_armed: false,
            mailbox,
            events,
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!(policy = ?self.scheduler.policy(), "Task controller started");

        while let Some(command) = rx.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
        }

        info!(
            pending = self.scheduler.ntasks(),
            running = self.assigned.len(),
            "Task controller stopped"
        );
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { task, reply } => {
                let id = self.submit(task);
                let _ = reply.send(id);
                self.distribute();
            }
            Command::GetResult { id, block, reply } => self.get_result(id, block, reply),
            Command::Abort { id, reply } => {
                let _ = reply.send(self.abort(id));
            }
            Command::Barrier { ids, reply } => self.barrier(ids, reply),
            Command::Spin => {
                self.distribute();
            }
            Command::QueueStatus { verbose, reply } => {
                let _ = reply.send(QueueReport::new(self.queue_status(), verbose));
            }
            Command::Purge { ids, reply } => {
                let _ = reply.send(self.purge(ids));
            }
            Command::RegisterWorker {
                id,
                properties,
                worker,
                reply,
            } => {
                let _ = reply.send(self.register_worker(id, properties, worker));
            }
            Command::UnregisterWorker { id, reply } => {
                let _ = reply.send(self.unregister_worker(id));
            }
            Command::Workers { reply } => {
                let _ = reply.send(self.registry.ids());
            }
            Command::Completed {
                task_id,
                worker_id,
                token,
                execution,
            } => self.task_completed(task_id, worker_id, token, execution),
            Command::Readmit { worker_id, token } => self.readmit(worker_id, token),
            Command::IdleTimeout { generation } => self.idle_timeout_fired(generation),
            Command::Shutdown => {}
        }
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ── Submission & queries ────────────────────────────────────────

    fn submit(&mut self, task: Task) -> TaskId {
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;

        self.records.insert(
            id,
            TaskRecord {
                state: TaskState::Pending,
                submitted: Utc::now(),
                abort_requested: false,
            },
        );
        self.scheduler.add_task(QueuedTask::new(id, task));

        debug!(task_id = %id, "Task submitted");
        self.emit(ControllerEvent::Submitted { task_id: id });
        id
    }

    fn get_result(&mut self, id: TaskId, block: bool, reply: ResultWaiter) {
        if let Some(result) = self.results.get(&id) {
            let _ = reply.send(Ok(Some(result.clone())));
            return;
        }
        if !self.records.contains_key(&id) {
            let _ = reply.send(Err(ControllerError::NotFound(id)));
            return;
        }
        if !block {
            let _ = reply.send(Ok(None));
            return;
        }

        let waiters = self.waiters.entry(id).or_default();
        // Callers that gave up waiting leave closed senders behind.
        waiters.retain(|w| !w.is_closed());
        waiters.push(reply);
    }

    fn barrier(&mut self, ids: Vec<TaskId>, reply: Reply<Result<(), ControllerError>>) {
        if let Some(missing) = ids.iter().find(|id| !self.records.contains_key(*id)) {
            let _ = reply.send(Err(ControllerError::NotFound(*missing)));
            return;
        }

        let remaining: HashSet<TaskId> = ids
            .into_iter()
            .filter(|id| !self.records.get(id).is_some_and(|r| r.state.is_terminal()))
            .collect();

        if remaining.is_empty() {
            let _ = reply.send(Ok(()));
        } else {
            self.barriers.retain(|b| !b.reply.is_closed());
            self.barriers.push(BarrierWaiter { remaining, reply });
        }
    }

    fn queue_status(&self) -> QueueStatus {
        let mut scheduled: Vec<TaskId> = self.assigned.keys().copied().collect();
        scheduled.sort();

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (id, result) in &self.results {
            if result.is_ok() {
                succeeded.push(*id);
            } else {
                failed.push(*id);
            }
        }
        succeeded.sort();
        failed.sort();

        QueueStatus {
            pending: self.scheduler.task_ids(),
            scheduled,
            succeeded,
            failed,
        }
    }

    fn purge(&mut self, ids: Option<Vec<TaskId>>) -> Result<usize, ControllerError> {
        let ids = match ids {
            Some(ids) => {
                for id in &ids {
                    if !self.records.contains_key(id) {
                        return Err(ControllerError::NotFound(*id));
                    }
                    if !self.results.contains_key(id) {
                        return Err(ControllerError::NotTerminal(*id));
                    }
                }
                ids
            }
            None => self.results.keys().copied().collect(),
        };

        let mut purged = 0;
        for id in ids {
            if self.results.remove(&id).is_some() {
                self.records.remove(&id);
                purged += 1;
            }
        }
        debug!(count = purged, "Purged cached results");
        Ok(purged)
    }

    // ── Abort ───────────────────────────────────────────────────────

    fn abort(&mut self, id: TaskId) -> Result<(), ControllerError> {
        let state = self
            .records
            .get(&id)
            .map(|r| r.state)
            .ok_or(ControllerError::NotFound(id))?;

        match state {
            TaskState::Pending => {
                let queued = self.scheduler.pop_task(Some(id))?;
                info!(task_id = %id, "Aborted pending task");
                self.finalize_aborted(queued, None);
                self.check_idle();
                Ok(())
            }
            TaskState::Assigned => {
                if let Some(record) = self.records.get_mut(&id) {
                    record.abort_requested = true;
                }
                info!(task_id = %id, "Abort deferred until the running task reports back");
                Ok(())
            }
            TaskState::Succeeded | TaskState::Failed => Err(ControllerError::AlreadyCompleted(id)),
            TaskState::Aborted => Err(ControllerError::AlreadyAborted(id)),
        }
    }

    // ── Workers ─────────────────────────────────────────────────────

    fn register_worker(
        &mut self,
        id: WorkerId,
        properties: Properties,
        worker: Arc<dyn Worker>,
    ) -> bool {
        if !self.registry.register(id, properties, worker) {
            return false;
        }

        self.emit(ControllerEvent::WorkerRegistered { worker_id: id });
        self.return_worker(id);
        self.distribute();
        true
    }

    fn unregister_worker(&mut self, id: WorkerId) -> bool {
        if self.registry.unregister(id).is_none() {
            return false;
        }

        // The worker may be idle, penalized, or running a task.
        let _ = self.scheduler.pop_worker(Some(id));
        self.penalized.remove(&id);
        self.emit(ControllerEvent::WorkerUnregistered { worker_id: id });

        let running = self
            .assigned
            .iter()
            .find(|(_, a)| a.worker_id == id)
            .map(|(task_id, a)| (*task_id, a.token));

        match running {
            Some((task_id, token)) => {
                warn!(task_id = %task_id, worker_id = %id, "Worker left while running a task");
                let failure = RemoteFailure::engine(format!(
                    "worker {id} unregistered while running task {task_id}"
                ));
                self.task_completed(task_id, id, token, Execution::Failed(failure));
            }
            None => self.check_idle(),
        }
        true
    }

    /// Put a registered worker back in the idle pool.
    fn return_worker(&mut self, id: WorkerId) {
        if let Some(registered) = self.registry.get(id) {
            let properties = Arc::clone(&registered.properties);
            self.scheduler.add_worker(IdleWorker { id, properties });
        }
    }

    /// Hold a failed worker out of the idle pool for the failure penalty.
    fn penalize(&mut self, id: WorkerId) {
        let delay = self.config.failure_penalty;
        if delay.is_zero() {
            self.return_worker(id);
            return;
        }

        let token = self.next_token;
        self.next_token += 1;
        self.penalized.insert(id, token);
        debug!(worker_id = %id, ?delay, "Worker penalized after failure");

        self.schedule_message(delay, Command::Readmit { worker_id: id, token });
    }

    fn readmit(&mut self, id: WorkerId, token: u64) {
        if self.penalized.get(&id) != Some(&token) {
            return;
        }
        self.penalized.remove(&id);

        if self.registry.contains(id) && !self.scheduler.has_worker(id) {
            debug!(worker_id = %id, "Worker readmitted after failure penalty");
            self.return_worker(id);
            self.distribute();
        }
    }

    /// Post `command` back into the mailbox after `delay`.
    fn schedule_message(&self, delay: Duration, command: Command) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(command).await;
            }
        });
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Drain every eligible pair, then re-evaluate the idle timer.
    fn distribute(&mut self) -> usize {
        let mut dispatched = 0;
        while let Some((worker, queued)) = self.scheduler.schedule() {
            self.dispatch(worker, queued);
            dispatched += 1;
        }
        self.check_idle();
        dispatched
    }

    fn dispatch(&mut self, idle: IdleWorker, mut queued: QueuedTask) {
        let worker_id = idle.id;
        let Some(registered) = self.registry.get(worker_id) else {
            warn!(worker_id = %worker_id, "Idle worker missing from registry; dropping it");
            self.scheduler.add_task(queued);
            return;
        };
        let worker = Arc::clone(&registered.worker);

        let token = self.next_token;
        self.next_token += 1;
        queued.attempts += 1;
        let task_id = queued.id;
        let attempt = queued.attempts;

        self.transition(task_id, TaskState::Assigned);

        let task = queued.task.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            // Run in its own task so a panicking worker becomes an engine error.
            let execution = match tokio::spawn(async move { worker.run(task).await }).await {
                Ok(execution) => execution,
                Err(e) => {
                    let message = format!("worker {worker_id} crashed: {e}");
                    Execution::Failed(RemoteFailure::engine(message))
                }
            };
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx
                    .send(Command::Completed {
                        task_id,
                        worker_id,
                        token,
                        execution,
                    })
                    .await;
            }
        });

        debug!(task_id = %task_id, worker_id = %worker_id, attempt, "Task dispatched");
        self.emit(ControllerEvent::Dispatched {
            task_id,
            worker_id,
            attempt,
        });
        self.assigned.insert(
            task_id,
            Assignment {
                worker_id,
                token,
                queued,
            },
        );
    }

    // ── Completion ──────────────────────────────────────────────────

    fn task_completed(
        &mut self,
        task_id: TaskId,
        worker_id: WorkerId,
        token: u64,
        execution: Execution,
    ) {
        let current = self
            .assigned
            .get(&task_id)
            .is_some_and(|a| a.token == token && a.worker_id == worker_id);
        if !current {
            debug!(task_id = %task_id, worker_id = %worker_id, "Discarding stale completion");
            return;
        }
        let Some(Assignment { queued, .. }) = self.assigned.remove(&task_id) else {
            return;
        };

        let abort_requested = self.records.get(&task_id).is_some_and(|r| r.abort_requested);
        let worker_alive = self.registry.contains(worker_id);

        match execution {
            Execution::Succeeded(output) => {
                if worker_alive {
                    self.return_worker(worker_id);
                }
                if abort_requested {
                    self.finalize_aborted(queued, Some(worker_id));
                } else {
                    self.finalize(queued, Some(worker_id), TaskStatus::Ok, Ok(output));
                }
            }
            Execution::Rejected(reason) => {
                if worker_alive {
                    self.return_worker(worker_id);
                }
                if abort_requested {
                    self.finalize_aborted(queued, Some(worker_id));
                } else {
                    self.requeue_rejected(queued, worker_id, reason);
                }
            }
            Execution::Failed(failure) => {
                if worker_alive {
                    self.penalize(worker_id);
                }
                if abort_requested {
                    self.finalize_aborted(queued, Some(worker_id));
                } else {
                    self.handle_failure(queued, worker_id, failure);
                }
            }
        }

        self.distribute();
    }

    /// Retry, recover, or finalize a failed task.
    fn handle_failure(
        &mut self,
        mut queued: QueuedTask,
        worker_id: WorkerId,
        failure: RemoteFailure,
    ) {
        let id = queued.id;

        if queued.task.consume_retry() {
            let retries_left = queued.task.retries_left();
            warn!(
                task_id = %id,
                worker_id = %worker_id,
                retries_left,
                error = %failure,
                "Task failed, resubmitting"
            );
            self.emit(ControllerEvent::Retrying {
                task_id: id,
                retries_left,
            });
            self.requeue(queued);
            return;
        }

        // A substituted recovery task runs once and is never itself recovered.
        if !queued.recovered
            && let Some(mut recovery) = queued.task.take_recovery()
        {
            warn!(
                task_id = %id,
                error = %failure,
                "Task out of retries, running its recovery task"
            );
            recovery.clear_retries();
            queued.task = recovery;
            queued.recovered = true;
            queued.rejected_by.clear();
            self.emit(ControllerEvent::Recovering { task_id: id });
            self.requeue(queued);
            return;
        }

        self.finalize(queued, Some(worker_id), TaskStatus::Error, Err(failure));
    }

    fn requeue_rejected(&mut self, mut queued: QueuedTask, worker_id: WorkerId, reason: String) {
        warn!(
            task_id = %queued.id,
            worker_id = %worker_id,
            reason = %reason,
            "Task rejected by worker"
        );
        queued.rejected_by.insert(worker_id);
        self.emit(ControllerEvent::Rejected {
            task_id: queued.id,
            worker_id,
            reason,
        });
        self.requeue(queued);
    }

    fn requeue(&mut self, queued: QueuedTask) {
        self.transition(queued.id, TaskState::Pending);
        self.scheduler.add_task(queued);
    }

    fn transition(&mut self, id: TaskId, target: TaskState) {
        if let Some(record) = self.records.get_mut(&id) {
            if !record.state.can_transition_to(target) {
                warn!(
                    task_id = %id,
                    from = %record.state,
                    to = %target,
                    "Unexpected task state transition"
                );
            }
            record.state = target;
        }
    }

    fn finalize_aborted(&mut self, queued: QueuedTask, engine_id: Option<WorkerId>) {
        let failure =
            RemoteFailure::new(FailureKind::Aborted, format!("task {} was aborted", queued.id));
        self.finalize(queued, engine_id, TaskStatus::Aborted, Err(failure));
    }

    /// Store the terminal result and release everyone waiting on it.
    fn finalize(
        &mut self,
        queued: QueuedTask,
        engine_id: Option<WorkerId>,
        status: TaskStatus,
        outcome: Result<TaskOutput, RemoteFailure>,
    ) {
        let id = queued.id;
        let completed = Utc::now();
        self.transition(id, TaskState::for_status(status));
        let submitted = match self.records.get_mut(&id) {
            Some(record) => {
                record.abort_requested = false;
                record.submitted
            }
            None => completed,
        };

        let result = TaskResult {
            task_id: id,
            engine_id,
            status,
            outcome,
            submitted,
            completed,
            duration: (completed - submitted).to_std().unwrap_or_default(),
            attempts: queued.attempts,
            retries: queued.task.retries_left(),
        };

        match &result.outcome {
            Ok(_) => info!(task_id = %id, attempts = result.attempts, "Task succeeded"),
            Err(failure) => warn!(
                task_id = %id,
                status = %status,
                error = %failure,
                "Task finished without success"
            ),
        }

        if let Some(waiters) = self.waiters.remove(&id) {
            for waiter in waiters {
                let _ = waiter.send(Ok(Some(result.clone())));
            }
        }

        let (released, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.barriers)
            .into_iter()
            .map(|mut barrier| {
                barrier.remaining.remove(&id);
                barrier
            })
            .partition(|barrier| barrier.remaining.is_empty());
        self.barriers = waiting;
        for barrier in released {
            let _ = barrier.reply.send(Ok(()));
        }

        self.results.insert(id, result);
        self.emit(ControllerEvent::Finished { task_id: id, status });
    }

    // ── Idle timeout ────────────────────────────────────────────────

    /// Disarm the idle timer and re-arm it if every registered worker is idle
    /// yet none can take any pending task.
    fn check_idle(&mut self) {
        self.idle_generation += 1;
        self.idle_armed = false;

        let Some(timeout) = self.config.idle_timeout else {
            return;
        };
        let stuck = self.scheduler.ntasks() > 0
            && !self.registry.is_empty()
            && self.scheduler.nworkers() == self.registry.len();
        if !stuck {
            return;
        }

        self.idle_armed = true;
        debug!(
            pending = self.scheduler.ntasks(),
            idle = ?self.scheduler.worker_ids(),
            ?timeout,
            "No idle worker can take the pending tasks; idle timeout armed"
        );
        self.schedule_message(
            timeout,
            Command::IdleTimeout {
                generation: self.idle_generation,
            },
        );
    }

    fn idle_timeout_fired(&mut self, generation: u64) {
        if !self.idle_armed || generation != self.idle_generation {
            return;
        }
        self.idle_armed = false;

        if self.distribute() > 0 {
            return;
        }

        let stuck = self.scheduler.drain_tasks();
        warn!(count = stuck.len(), "Idle timeout: failing tasks with unmet dependencies");
        for queued in stuck {
            let failure = RemoteFailure::new(
                FailureKind::Timeout,
                format!("task {} failed to execute due to unmet dependencies", queued.id),
            );
            self.finalize(queued, None, TaskStatus::Timeout, Err(failure));
        }
        self.check_idle();
    }
}
