//! Workflow Execution Module
//!
//! Runs Workflows: one Execution per start request, driven by its own
//! Tokio task that promotes ready nodes, reacts to finished work and
//! answers pause, resume and cancel requests.
//!
//! # Architecture
//!
//! - [`engine`]: Workflow and Execution lifecycle, the public entry point
//! - [`model`]: Execution records, node states and failure policy
//! - `driver`: the per-Execution driving loop
//! - `node`: turns a ready node into a Task, an inline job or an output

mod driver;
pub mod engine;
pub mod model;
mod node;

pub use driver::CANCELLED;
pub use engine::WorkflowEngine;
pub use model::{
    Execution, ExecutionFilter, ExecutionStatus, FailurePolicy, NodeState, NodeStatus, Progress,
};
