//! Scan Tasks
//!
//! A Task is one supervised run of an external scan tool:
//!
//! - [`Task`]: the record, its status machine and request types
//! - [`command`]: argv construction for xmap and zgrab2
//! - [`TaskManager`]: admission, cancellation, deletion and persistence

pub mod command;
mod manager;
mod model;

#[cfg(all(test, unix))]
pub(crate) mod testing;

pub use manager::{TaskManager, TaskSignal, RESTART_MESSAGE};
pub use model::{
    InlineFile, Task, TaskArtifact, TaskFilter, TaskOrigin, TaskRequest, TaskStatus, ToolKind,
};
