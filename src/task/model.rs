//! The `Task` value object.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dependency::Dependency;
use super::result::WorkError;

/// Key/value context injected into and collected out of a task execution.
pub type Namespace = serde_json::Map<String, Value>;

/// Signature of a callable task body.
pub type CallFn = dyn Fn(&mut Namespace) -> Result<Value, WorkError> + Send + Sync;

/// Identifier assigned to a task at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The work a task performs.
#[derive(Clone)]
pub enum Work {
    /// A closure run against the worker's namespace.
    Call(Arc<CallFn>),
    /// Source text handed to the worker's interpreter.
    Source(String),
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(_) => f.write_str("Call(<fn>)"),
            Self::Source(code) => f.debug_tuple("Source").field(code).finish(),
        }
    }
}

/// One unit of work destined for a worker.
///
/// Built with [`Task::call`] or [`Task::source`] and the builder methods.
/// Once submitted, the controller only ever touches the retry budget and
/// (once) swaps in the recovery task.
#[derive(Debug, Clone)]
pub struct Task {
    work: Work,
    push: Namespace,
    pull: Vec<String>,
    clear_before: bool,
    clear_after: bool,
    retries: u32,
    recovery: Option<Box<Task>>,
    depend: Dependency,
}

impl Task {
    /// A task running `f` against the worker namespace.
    pub fn call<F>(f: F) -> Self
    where
        F: Fn(&mut Namespace) -> Result<Value, WorkError> + Send + Sync + 'static,
    {
        Self::with_work(Work::Call(Arc::new(f)))
    }

    /// A task evaluating `code` with the worker's interpreter.
    pub fn source(code: impl Into<String>) -> Self {
        Self::with_work(Work::Source(code.into()))
    }

    fn with_work(work: Work) -> Self {
        Self {
            work,
            push: Namespace::new(),
            pull: Vec::new(),
            clear_before: false,
            clear_after: false,
            retries: 0,
            recovery: None,
            depend: Dependency::Always,
        }
    }

    /// Inject `value` under `name` before execution.
    pub fn push(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push.insert(name.into(), value.into());
        self
    }

    /// Collect `name` from the namespace after execution.
    pub fn pull(mut self, name: impl Into<String>) -> Self {
        self.pull.push(name.into());
        self
    }

    pub fn clear_before(mut self, clear: bool) -> Self {
        self.clear_before = clear;
        self
    }

    pub fn clear_after(mut self, clear: bool) -> Self {
        self.clear_after = clear;
        self
    }

    /// Number of resubmissions allowed after failures.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Task substituted in once the retry budget is exhausted.
    pub fn recovery(mut self, recovery: Task) -> Self {
        self.recovery = Some(Box::new(recovery));
        self
    }

    /// Restrict the workers this task may run on.
    pub fn depend(mut self, depend: Dependency) -> Self {
        self.depend = depend;
        self
    }

    pub fn work(&self) -> &Work {
        &self.work
    }

    pub fn push_values(&self) -> &Namespace {
        &self.push
    }

    pub fn pull_names(&self) -> &[String] {
        &self.pull
    }

    pub fn clears_before(&self) -> bool {
        self.clear_before
    }

    pub fn clears_after(&self) -> bool {
        self.clear_after
    }

    /// Remaining retry budget.
    pub fn retries_left(&self) -> u32 {
        self.retries
    }

    pub fn recovery_task(&self) -> Option<&Task> {
        self.recovery.as_deref()
    }

    pub fn dependency(&self) -> &Dependency {
        &self.depend
    }

    /// Spend one retry. Returns false when the budget is already empty.
    pub(crate) fn consume_retry(&mut self) -> bool {
        if self.retries == 0 {
            return false;
        }
        self.retries -= 1;
        true
    }

    pub(crate) fn take_recovery(&mut self) -> Option<Task> {
        self.recovery.take().map(|task| *task)
    }

    /// Drop whatever retry budget is left so the task runs at most once more.
    pub(crate) fn clear_retries(&mut self) {
        self.retries = 0;
    }
}
