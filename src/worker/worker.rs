//! Worker execution capability.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::task::{FailureKind, Namespace, RemoteFailure, Task, TaskOutput, Work, WorkError};

/// Outcome of handing a task to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Succeeded(TaskOutput),
    Failed(RemoteFailure),
    /// The worker refused the task; it should be tried elsewhere.
    Rejected(String),
}

impl From<Result<TaskOutput, WorkError>> for Execution {
    fn from(result: Result<TaskOutput, WorkError>) -> Self {
        match result {
            Ok(output) => Self::Succeeded(output),
            Err(WorkError::Failed(failure)) => Self::Failed(failure),
            Err(WorkError::Rejected(reason)) => Self::Rejected(reason),
        }
    }
}

/// Something that can run one task at a time.
///
/// The controller does not care whether this is a local thread, a remote
/// engine behind a transport, or a test stub. Every failure must come back
/// as an [`Execution`]; a panic inside `run` is reported as an engine error.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, task: Task) -> Execution;
}

/// Evaluates source-string tasks.
pub trait Interpreter: Send + Sync {
    fn execute(&self, source: &str, namespace: &mut Namespace) -> Result<Value, WorkError>;
}

/// In-process worker with its own persistent namespace.
#[derive(Clone, Default)]
pub struct LocalWorker {
    namespace: Arc<Mutex<Namespace>>,
    interpreter: Option<Arc<dyn Interpreter>>,
}

impl LocalWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable source-string tasks.
    pub fn with_interpreter(mut self, interpreter: Arc<dyn Interpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    /// Snapshot of the worker's namespace.
    pub fn namespace(&self) -> Namespace {
        self.namespace
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Worker for LocalWorker {
    async fn run(&self, task: Task) -> Execution {
        let namespace = Arc::clone(&self.namespace);
        let interpreter = self.interpreter.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let mut ns = namespace.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            execute_in(&task, &mut ns, interpreter.as_deref())
        })
        .await;

        match joined {
            Ok(execution) => execution,
            Err(e) => {
                Execution::Failed(RemoteFailure::engine(format!("worker thread failed: {e}")))
            }
        }
    }
}

/// Run one task against `ns`: clear, push, execute, pull, clear.
pub fn execute_in(
    task: &Task,
    ns: &mut Namespace,
    interpreter: Option<&dyn Interpreter>,
) -> Execution {
    if task.clears_before() {
        ns.clear();
    }
    for (name, value) in task.push_values() {
        ns.insert(name.clone(), value.clone());
    }

    let returned = match task.work() {
        Work::Call(f) => f(ns),
        Work::Source(code) => match interpreter {
            Some(interp) => interp.execute(code, ns),
            None => Err(WorkError::Failed(RemoteFailure::new(
                FailureKind::UnsupportedWork,
                "worker has no interpreter for source tasks",
            ))),
        },
    };

    let result = returned.and_then(|value| collect_output(task, ns, value));

    if task.clears_after() {
        ns.clear();
    }
    result.into()
}

fn collect_output(task: &Task, ns: &Namespace, value: Value) -> Result<TaskOutput, WorkError> {
    if task.pull_names().is_empty() {
        return Ok(TaskOutput::Value(value));
    }

    let mut pulled = Namespace::new();
    for name in task.pull_names() {
        let value = ns
            .get(name)
            .ok_or_else(|| WorkError::failed(format!("name '{name}' is not defined")))?;
        pulled.insert(name.clone(), value.clone());
    }
    Ok(TaskOutput::Pulled(pulled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl Interpreter for Echo {
        fn execute(&self, source: &str, namespace: &mut Namespace) -> Result<Value, WorkError> {
            namespace.insert("last".into(), json!(source));
            Ok(json!(source.len()))
        }
    }

    #[tokio::test]
    async fn push_then_pull() {
        let worker = LocalWorker::new();
        let task = Task::call(|ns| {
            let a = ns.get("a").and_then(Value::as_i64).unwrap_or(0);
            ns.insert("b".into(), json!(a * 2));
            Ok(Value::Null)
        })
        .push("a", 21)
        .pull("b");

        let execution = worker.run(task).await;
        let mut expected = Namespace::new();
        expected.insert("b".into(), json!(42));
        assert_eq!(execution, Execution::Succeeded(TaskOutput::Pulled(expected)));
    }

    #[tokio::test]
    async fn namespace_persists_between_tasks_unless_cleared() {
        let worker = LocalWorker::new();
        worker
            .run(Task::call(|_| Ok(Value::Null)).push("keep", 1))
            .await;
        assert_eq!(worker.namespace().get("keep"), Some(&json!(1)));

        worker
            .run(Task::call(|_| Ok(Value::Null)).clear_after(true))
            .await;
        assert!(worker.namespace().is_empty());
    }

    #[tokio::test]
    async fn clear_before_hides_previous_state() {
        let worker = LocalWorker::new();
        worker.run(Task::call(|_| Ok(Value::Null)).push("x", 1)).await;

        let execution = worker
            .run(Task::call(|ns| Ok(json!(ns.contains_key("x")))).clear_before(true))
            .await;
        assert_eq!(execution, Execution::Succeeded(TaskOutput::Value(json!(false))));
    }

    #[tokio::test]
    async fn missing_pull_name_is_an_application_failure() {
        let worker = LocalWorker::new();
        let execution = worker.run(Task::call(|_| Ok(Value::Null)).pull("ghost")).await;
        match execution {
            Execution::Failed(f) => {
                assert_eq!(f.kind, FailureKind::Application);
                assert!(f.message.contains("ghost"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_is_distinct_from_failure() {
        let worker = LocalWorker::new();
        let execution = worker.run(Task::call(|_| Err(WorkError::reject("wrong engine")))).await;
        assert_eq!(execution, Execution::Rejected("wrong engine".into()));
    }

    #[tokio::test]
    async fn panic_becomes_engine_error() {
        let worker = LocalWorker::new();
        let execution = worker.run(Task::call(|_| panic!("segfault"))).await;
        assert!(matches!(execution, Execution::Failed(f) if f.kind == FailureKind::Engine));
    }

    #[tokio::test]
    async fn source_tasks_need_an_interpreter() {
        let bare = LocalWorker::new();
        assert!(matches!(
            bare.run(Task::source("1+1")).await,
            Execution::Failed(f) if f.kind == FailureKind::UnsupportedWork
        ));

        let worker = LocalWorker::new().with_interpreter(Arc::new(Echo));
        assert_eq!(
            worker.run(Task::source("abc")).await,
            Execution::Succeeded(TaskOutput::Value(json!(3)))
        );
        assert_eq!(worker.namespace().get("last"), Some(&json!("abc")));
    }
}
