//! Monitoring Module
//!
//! Observes running work without changing its semantics.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: node start/end events stored with each Execution
//! - [`Watchdog`]: optional wall-clock budget for running Tasks

pub mod timeline;
pub mod watchdog;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
pub use watchdog::Watchdog;
