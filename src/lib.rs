//! ScanRunner - IPv6 Scan Orchestration Engine
//!
//! Runs long-lived network reconnaissance tools (xmap for discovery,
//! zgrab2 for application-layer grabbing) as supervised Tasks, and chains
//! them with in-process extraction steps into Workflows.
//!
//! # Architecture
//!
//! - [`task`]: Task lifecycle, admission under a global cap, cancellation
//! - [`process`]: spawning and terminating external tool processes
//! - [`workflow`]: Workflow definitions, graph validation and planning
//! - [`execution`]: the Workflow Engine and per-Execution driving loops
//! - [`catalog`]: tool schemas, node types and workflow templates
//! - [`artifact`] / [`store`]: artifact files and JSON record persistence
//! - [`monitoring`]: execution timelines and the task watchdog
//! - [`api`]: the HTTP surface
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use scanrunner::artifact::FsArtifactStore;
//! use scanrunner::catalog::Catalog;
//! use scanrunner::config::Settings;
//! use scanrunner::store::RecordStore;
//! use scanrunner::{CallerContext, TaskManager, WorkflowEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::default();
//!     let artifacts = FsArtifactStore::new("/tmp/scanrunner/artifacts")?;
//!     let tasks = TaskManager::new(
//!         &settings,
//!         Arc::new(Catalog::builtin()),
//!         Arc::new(artifacts),
//!         RecordStore::ephemeral(),
//!         RecordStore::ephemeral(),
//!     );
//!     let engine = WorkflowEngine::new(
//!         &settings,
//!         tasks,
//!         RecordStore::ephemeral(),
//!         RecordStore::ephemeral(),
//!     );
//!
//!     let ctx = CallerContext::user("alice");
//!     let workflow = engine.instantiate_template(&ctx, "xmap_only_scan", None)?;
//!     println!("created workflow {}", workflow.id);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod artifact;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod pagination;
pub mod process;
pub mod store;
pub mod task;
pub mod workflow;

// Re-export commonly used types
pub use context::CallerContext;
pub use error::{Error, Result};
pub use execution::{Execution, ExecutionStatus, WorkflowEngine};
pub use task::{Task, TaskManager, TaskRequest, TaskStatus};
pub use workflow::{Workflow, WorkflowDefinition};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ScanRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "ScanRunner");
    }

    #[test]
    fn test_module_exports_definition() {
        let definition = WorkflowDefinition::new("discovery");
        assert_eq!(definition.name, "discovery");
        assert!(definition.nodes.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
