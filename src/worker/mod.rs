//! Worker side of the farm.
//!
//! Core components:
//! - `worker`: the `Worker` execution capability and an in-process `LocalWorker`
//! - `registry`: the live set of registered workers and their properties

pub mod registry;
pub mod worker;

pub use registry::{RegisteredWorker, WorkerId, WorkerRegistry};
pub use worker::{Execution, Interpreter, LocalWorker, Worker};
