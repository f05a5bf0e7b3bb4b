//! Workflow Definition Module
//!
//! Data structures and rules for workflow graphs.
//!
//! # Structure
//!
//! - [`model`]: Workflow, node and edge definitions
//! - [`validator`]: Graph and config validation, topological ordering
//! - [`planner`]: Node scheduling for a running Execution

pub mod model;
pub mod planner;
pub mod validator;

pub use model::{Edge, NodeDefinition, Workflow, WorkflowDefinition, WorkflowStatus};
pub use planner::ExecutionPlanner;
pub use validator::{topological_order, validate_definition};
