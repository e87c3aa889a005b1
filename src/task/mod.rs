//! Task value types.
//!
//! - `model`: the `Task` description (work, push/pull, retries, recovery)
//! - `dependency`: worker eligibility predicates
//! - `result`: `TaskResult` and the structured failure record
//! - `state`: per-task state machine tracked by the controller

pub mod dependency;
pub mod model;
pub mod result;
pub mod state;

pub use dependency::{Comparison, Dependency, Properties, Requirement};
pub use model::{Namespace, Task, TaskId, Work};
pub use result::{FailureKind, RemoteFailure, TaskOutput, TaskResult, TaskStatus, WorkError};
pub use state::TaskState;
