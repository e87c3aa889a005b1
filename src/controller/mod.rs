//! Task controller, the single owner of every queue.
//!
//! Core components:
//! - `actor`: mailbox loop for submission, dispatch, completion, retry/recovery,
//!   abort, barrier, idle timeout
//! - `handle`: cloneable `ControllerHandle`, the public request/response contract
//! - `status`: `queue_status` report types
//! - `events`: lifecycle events broadcast to subscribers

mod actor;
pub mod events;
pub mod handle;
pub mod status;

pub use events::ControllerEvent;
pub use handle::ControllerHandle;
pub use status::{QueueCounts, QueueReport, QueueStatus};
