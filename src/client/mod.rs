//! Client correlation layer.
//!
//! Core components:
//! - `transport`: the `TaskTransport` contract the client consumes
//! - `task_client`: `TaskClient` with submit, apply, map, and pass-through queries
//! - `async_result`: `AsyncResult` with wait, get, and streaming over task ids
//! - `composite`: `RemoteError` and `CompositeError`

pub mod async_result;
pub mod composite;
pub mod task_client;
pub mod transport;

pub use async_result::{AsyncResult, ResultMode, StreamOrder};
pub use composite::{CompositeError, RemoteError};
pub use task_client::{MapOptions, TaskClient};
pub use transport::TaskTransport;
