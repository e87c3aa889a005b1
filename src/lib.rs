//! Task Farm: parallel task scheduling and execution tracking.

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use client::{
    AsyncResult, CompositeError, RemoteError, StreamOrder, TaskClient, TaskTransport,
};
pub use config::ControllerConfig;
pub use controller::{ControllerEvent, ControllerHandle, QueueReport, QueueStatus};
pub use error::{ClientError, ControllerError, Error, Result};
pub use scheduler::{QueuePolicy, Scheduler};
pub use task::{
    Comparison, Dependency, Namespace, Properties, Task, TaskId, TaskResult, TaskStatus, WorkError,
};
pub use worker::{Execution, LocalWorker, Worker, WorkerId};
