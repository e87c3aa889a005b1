//! End-to-end controller behavior: dispatch, retries, recovery, abort,
//! barriers, worker churn and the idle timeout.
//!
//! Workers are in-process stubs; every wait is bounded so a hang fails the
//! test instead of blocking the run.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use task_farm::controller::ControllerEvent;
use task_farm::task::{FailureKind, TaskOutput};
use task_farm::{
    Comparison, ControllerConfig, ControllerError, ControllerHandle, Dependency, Execution,
    LocalWorker, Properties, Task, TaskId, TaskResult, TaskStatus, WorkError, Worker, WorkerId,
};

/// Maximum time any single wait may take before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> ControllerConfig {
    ControllerConfig {
        idle_timeout: None,
        failure_penalty: Duration::ZERO,
        ..ControllerConfig::default()
    }
}

/// Succeeds only once the test hands it a permit.
struct Gated {
    gate: Arc<Semaphore>,
}

impl Gated {
    fn new() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Arc::new(Self { gate: Arc::clone(&gate) }), gate)
    }
}

#[async_trait]
impl Worker for Gated {
    async fn run(&self, _task: Task) -> Execution {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        Execution::Succeeded(TaskOutput::Value(json!("released")))
    }
}

/// Refuses everything.
struct Refuser;

#[async_trait]
impl Worker for Refuser {
    async fn run(&self, _task: Task) -> Execution {
        Execution::Rejected("not on this engine".into())
    }
}

/// Flags any overlapping run on the same worker.
#[derive(Default)]
struct OverlapCheck {
    in_flight: AtomicU32,
    overlapped: AtomicBool,
}

#[async_trait]
impl Worker for OverlapCheck {
    async fn run(&self, _task: Task) -> Execution {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Execution::Succeeded(TaskOutput::Value(Value::Null))
    }
}

async fn register(
    handle: &ControllerHandle,
    id: u64,
    properties: Properties,
    worker: Arc<dyn Worker>,
) {
    assert!(handle.register_worker(WorkerId(id), properties, worker).await.unwrap());
}

async fn result_of(handle: &ControllerHandle, id: TaskId) -> TaskResult {
    timeout(TEST_TIMEOUT, handle.get_task_result(id, true))
        .await
        .expect("task did not finish in time")
        .unwrap()
        .expect("blocking get returns a result")
}

fn props(value: Value) -> Properties {
    match value {
        Value::Object(map) => map,
        _ => Properties::new(),
    }
}

#[tokio::test]
async fn single_task_on_single_worker_succeeds() {
    let handle = ControllerHandle::spawn(config());
    register(&handle, 0, Properties::new(), Arc::new(LocalWorker::new())).await;

    let id = handle.run(Task::call(|_| Ok(json!("hello")))).await.unwrap();
    let result = result_of(&handle, id).await;

    assert_eq!(result.status, TaskStatus::Ok);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.into_value().unwrap(), json!("hello"));
}

#[tokio::test]
async fn failing_task_runs_once_plus_each_retry() {
    let handle = ControllerHandle::spawn(config());
    register(&handle, 0, Properties::new(), Arc::new(LocalWorker::new())).await;

    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    let task = Task::call(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(WorkError::failed("always broken"))
    })
    .retries(2);

    let id = handle.run(task).await.unwrap();
    let result = result_of(&handle, id).await;

    assert_eq!(result.status, TaskStatus::Error);
    assert_eq!(result.retries, 0);
    assert_eq!(result.attempts, 3);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(result.failure().unwrap().message, "always broken");
}

#[tokio::test]
async fn queued_tasks_wait_for_a_worker_then_dispatch_fifo() {
    let handle = ControllerHandle::spawn(config());
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(handle.run(Task::call(move |_| Ok(json!(n)))).await.unwrap());
    }

    let status = handle.queue_status(true).await.unwrap();
    let status = status.ids().unwrap();
    assert_eq!(status.pending, ids);
    assert!(status.scheduled.is_empty());

    let (worker, gate) = Gated::new();
    register(&handle, 0, Properties::new(), worker).await;
    handle.spin().await.unwrap();

    let counts = handle.queue_status(false).await.unwrap().counts();
    assert_eq!(counts.pending, 4);
    assert_eq!(counts.scheduled, 1);
    let verbose = handle.queue_status(true).await.unwrap();
    assert_eq!(verbose.ids().unwrap().scheduled, vec![ids[0]]);

    gate.add_permits(5);
    timeout(TEST_TIMEOUT, handle.barrier(&ids)).await.unwrap().unwrap();
    assert_eq!(handle.queue_status(false).await.unwrap().counts().succeeded, 5);
}

#[tokio::test]
async fn aborted_pending_task_never_runs() {
    let handle = ControllerHandle::spawn(config());
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let id = handle
        .run(Task::call(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        }))
        .await
        .unwrap();

    handle.abort(id).await.unwrap();
    let result = handle.get_task_result(id, false).await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Aborted);
    assert_eq!(result.engine_id, None);

    register(&handle, 0, Properties::new(), Arc::new(LocalWorker::new())).await;
    let later = handle.run(Task::call(|_| Ok(Value::Null))).await.unwrap();
    result_of(&handle, later).await;

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(result_of(&handle, id).await.status, TaskStatus::Aborted);
    assert_eq!(handle.abort(id).await, Err(ControllerError::AlreadyAborted(id)));
}

#[tokio::test]
async fn aborting_a_running_task_discards_its_late_success() {
    let handle = ControllerHandle::spawn(config());
    let (worker, gate) = Gated::new();
    register(&handle, 0, Properties::new(), worker).await;

    let id = handle.run(Task::source("slow")).await.unwrap();
    handle.abort(id).await.unwrap();
    gate.add_permits(1);

    let result = result_of(&handle, id).await;
    assert_eq!(result.status, TaskStatus::Aborted);
    assert_eq!(result.failure().unwrap().kind, FailureKind::Aborted);
    assert_eq!(handle.abort(id).await, Err(ControllerError::AlreadyAborted(id)));
}

#[tokio::test]
async fn completed_task_cannot_be_aborted() {
    let handle = ControllerHandle::spawn(config());
    register(&handle, 0, Properties::new(), Arc::new(LocalWorker::new())).await;

    let id = handle.run(Task::call(|_| Ok(Value::Null))).await.unwrap();
    result_of(&handle, id).await;
    assert_eq!(handle.abort(id).await, Err(ControllerError::AlreadyCompleted(id)));
}

#[tokio::test]
async fn recovery_task_replaces_exhausted_task_under_same_id() {
    let handle = ControllerHandle::spawn(config());
    register(&handle, 0, Properties::new(), Arc::new(LocalWorker::new())).await;
    let mut events = handle.subscribe();

    let task = Task::call(|_| Err(WorkError::failed("primary failed")))
        .recovery(Task::call(|_| Ok(json!("recovered"))));
    let id = handle.run(task).await.unwrap();
    let result = result_of(&handle, id).await;

    assert_eq!(result.task_id, id);
    assert_eq!(result.status, TaskStatus::Ok);
    assert_eq!(result.into_value().unwrap(), json!("recovered"));

    let mut saw_recovering = false;
    while let Ok(event) = events.try_recv() {
        saw_recovering |= event == ControllerEvent::Recovering { task_id: id };
    }
    assert!(saw_recovering);
}

#[tokio::test]
async fn recovery_task_runs_once_and_is_not_itself_recovered() {
    let handle = ControllerHandle::spawn(config());
    register(&handle, 0, Properties::new(), Arc::new(LocalWorker::new())).await;

    let recovery_runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&recovery_runs);
    let nested_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&nested_ran);
    let recovery = Task::call(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(WorkError::failed("recovery failed"))
    })
    .retries(2)
    .recovery(Task::call(move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(Value::Null)
    }));
    let task = Task::call(|_| Err(WorkError::failed("primary failed"))).recovery(recovery);

    let id = handle.run(task).await.unwrap();
    let result = result_of(&handle, id).await;

    assert_eq!(result.status, TaskStatus::Error);
    assert_eq!(result.failure().unwrap().message, "recovery failed");
    // One primary attempt, then the recovery task exactly once.
    assert_eq!(recovery_runs.load(Ordering::SeqCst), 1);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.retries, 0);
    assert!(!nested_ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn barrier_waits_for_every_id() {
    let handle = ControllerHandle::spawn(config());
    let mut gates = Vec::new();
    for n in 0..3 {
        let (worker, gate) = Gated::new();
        register(&handle, n, Properties::new(), worker).await;
        gates.push(gate);
    }

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(handle.run(Task::source("work")).await.unwrap());
    }

    let barrier = {
        let handle = handle.clone();
        let ids = ids.clone();
        tokio::spawn(async move { handle.barrier(&ids).await })
    };

    gates[0].add_permits(1);
    gates[2].add_permits(1);
    result_of(&handle, ids[0]).await;
    result_of(&handle, ids[2]).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!barrier.is_finished());

    gates[1].add_permits(1);
    timeout(TEST_TIMEOUT, barrier).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn dependency_routes_task_to_matching_worker() {
    let handle = ControllerHandle::spawn(config());
    register(&handle, 0, props(json!({ "gpu": false })), Arc::new(LocalWorker::new())).await;
    register(&handle, 1, props(json!({ "gpu": true })), Arc::new(LocalWorker::new())).await;

    let mut ids = Vec::new();
    for _ in 0..4 {
        let task = Task::call(|_| Ok(Value::Null))
            .depend(Dependency::require("gpu", Comparison::Eq, true));
        ids.push(handle.run(task).await.unwrap());
    }
    for id in ids {
        assert_eq!(result_of(&handle, id).await.engine_id, Some(WorkerId(1)));
    }
}

#[tokio::test]
async fn no_worker_runs_two_tasks_at_once() {
    let handle = ControllerHandle::spawn(config());
    let checks: Vec<Arc<OverlapCheck>> =
        (0..3).map(|_| Arc::new(OverlapCheck::default())).collect();
    for (n, check) in checks.iter().enumerate() {
        let worker = Arc::clone(check) as Arc<dyn Worker>;
        register(&handle, n as u64, Properties::new(), worker).await;
    }
    let mut events = handle.subscribe();

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(handle.run(Task::source("overlap")).await.unwrap());
    }
    timeout(TEST_TIMEOUT, handle.barrier(&ids)).await.unwrap().unwrap();

    let mut dispatched = HashSet::new();
    while let Ok(event) = events.try_recv() {
        if let ControllerEvent::Dispatched { task_id, .. } = event {
            assert!(dispatched.insert(task_id), "task {task_id} dispatched twice");
        }
    }
    assert_eq!(dispatched.len(), 20);
    assert!(checks.iter().all(|p| !p.overlapped.load(Ordering::SeqCst)));
}

#[tokio::test]
async fn unregistering_a_busy_worker_fails_its_task() {
    let handle = ControllerHandle::spawn(config());
    let (worker, gate) = Gated::new();
    register(&handle, 0, Properties::new(), worker).await;

    let id = handle.run(Task::source("doomed")).await.unwrap();
    // Wait until the task is actually on the worker.
    timeout(TEST_TIMEOUT, async {
        while handle.queue_status(false).await.unwrap().counts().scheduled == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    assert!(handle.unregister_worker(WorkerId(0)).await.unwrap());
    let result = result_of(&handle, id).await;
    assert_eq!(result.status, TaskStatus::Error);
    assert_eq!(result.failure().unwrap().kind, FailureKind::Engine);

    // The worker finishing afterwards changes nothing.
    gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(result_of(&handle, id).await.status, TaskStatus::Error);
    assert!(handle.workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn unregistered_worker_task_is_retried_elsewhere() {
    let handle = ControllerHandle::spawn(config());
    let (worker, _gate) = Gated::new();
    register(&handle, 0, Properties::new(), worker).await;

    let id = handle.run(Task::call(|_| Ok(json!("second engine"))).retries(1)).await.unwrap();
    timeout(TEST_TIMEOUT, async {
        while handle.queue_status(false).await.unwrap().counts().scheduled == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    handle.unregister_worker(WorkerId(0)).await.unwrap();
    register(&handle, 1, Properties::new(), Arc::new(LocalWorker::new())).await;

    let result = result_of(&handle, id).await;
    assert_eq!(result.status, TaskStatus::Ok);
    assert_eq!(result.engine_id, Some(WorkerId(1)));
}

#[tokio::test]
async fn panicking_worker_reports_engine_error() {
    struct Crashes;

    #[async_trait]
    impl Worker for Crashes {
        async fn run(&self, _task: Task) -> Execution {
            panic!("engine died")
        }
    }

    let handle = ControllerHandle::spawn(config());
    register(&handle, 0, Properties::new(), Arc::new(Crashes)).await;

    let id = handle.run(Task::source("anything")).await.unwrap();
    let result = result_of(&handle, id).await;
    assert_eq!(result.status, TaskStatus::Error);
    assert_eq!(result.failure().unwrap().kind, FailureKind::Engine);
}

#[tokio::test]
async fn unmet_dependency_times_out_after_idle_timeout() {
    let idle = Duration::from_millis(200);
    let handle = ControllerHandle::spawn(ControllerConfig {
        idle_timeout: Some(idle),
        ..config()
    });
    register(&handle, 0, props(json!({ "os": "linux" })), Arc::new(LocalWorker::new())).await;

    let started = Instant::now();
    let task = Task::call(|_| Ok(Value::Null))
        .depend(Dependency::require("os", Comparison::Eq, "plan9"));
    let id = handle.run(task).await.unwrap();
    let result = result_of(&handle, id).await;
    let elapsed = started.elapsed();

    assert_eq!(result.status, TaskStatus::Timeout);
    assert_eq!(result.failure().unwrap().kind, FailureKind::Timeout);
    assert!(elapsed >= idle, "timed out early after {elapsed:?}");
    assert!(elapsed < idle * 10, "timed out late after {elapsed:?}");
}

#[tokio::test]
async fn new_capacity_disarms_idle_timeout() {
    let handle = ControllerHandle::spawn(ControllerConfig {
        idle_timeout: Some(Duration::from_millis(100)),
        ..config()
    });
    register(&handle, 0, props(json!({ "gpu": false })), Arc::new(LocalWorker::new())).await;

    let task = Task::call(|_| Ok(json!("on gpu")))
        .depend(Dependency::require("gpu", Comparison::Eq, true));
    let id = handle.run(task).await.unwrap();
    register(&handle, 1, props(json!({ "gpu": true })), Arc::new(LocalWorker::new())).await;

    let result = result_of(&handle, id).await;
    assert_eq!(result.status, TaskStatus::Ok);
    assert_eq!(result.engine_id, Some(WorkerId(1)));
}

#[tokio::test]
async fn task_rejected_by_every_worker_times_out_without_spending_retries() {
    let handle = ControllerHandle::spawn(ControllerConfig {
        idle_timeout: Some(Duration::from_millis(100)),
        ..config()
    });
    register(&handle, 0, Properties::new(), Arc::new(Refuser)).await;

    let id = handle.run(Task::source("nowhere").retries(3)).await.unwrap();
    let result = result_of(&handle, id).await;

    assert_eq!(result.status, TaskStatus::Timeout);
    assert_eq!(result.retries, 3);
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn failed_worker_sits_out_the_penalty() {
    let penalty = Duration::from_millis(150);
    let handle = ControllerHandle::spawn(ControllerConfig {
        failure_penalty: penalty,
        ..config()
    });
    register(&handle, 0, Properties::new(), Arc::new(LocalWorker::new())).await;

    let started = Instant::now();
    let failing = handle.run(Task::call(|_| Err(WorkError::failed("bad")))).await.unwrap();
    result_of(&handle, failing).await;

    let next = handle.run(Task::call(|_| Ok(Value::Null))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(handle.get_task_result(next, false).await.unwrap(), None);

    let result = result_of(&handle, next).await;
    assert_eq!(result.status, TaskStatus::Ok);
    assert_eq!(result.engine_id, Some(WorkerId(0)));
    assert!(started.elapsed() >= penalty);
}
