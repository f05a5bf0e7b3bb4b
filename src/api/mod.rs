//! HTTP API
//!
//! REST surface over the Task Manager and Workflow Engine:
//!
//! - [`response`]: the `{success, data?, error?}` envelope, error to status
//!   mapping and the caller extractor
//! - `tasks`: Task, batch and file routes
//! - `workflows`: Workflow, Execution and catalog routes
//!
//! The caller is named by the `x-caller-id` header; `x-caller-role: admin`
//! lifts the ownership scoping.

pub mod response;
mod tasks;
mod workflows;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::execution::WorkflowEngine;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
}

impl AppState {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self { engine }
    }
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route("/tasks/batch/cancel", post(tasks::cancel_batch))
        .route("/tasks/batch/delete", post(tasks::delete_batch))
        .route("/tasks/{id}", get(tasks::get_task).delete(tasks::delete_task))
        .route("/tasks/{id}/cancel", post(tasks::cancel_task))
        .route("/tasks/{id}/result", get(tasks::task_result))
        .route("/tasks/{id}/log", get(tasks::task_log))
        .route("/files", post(tasks::upload_file))
        .route("/files/{file_ref}", delete(tasks::delete_file))
        .route(
            "/workflows",
            post(workflows::create_workflow).get(workflows::list_workflows),
        )
        .route(
            "/workflows/{id}",
            get(workflows::get_workflow)
                .put(workflows::update_workflow)
                .delete(workflows::delete_workflow),
        )
        .route("/workflows/{id}/status", post(workflows::set_workflow_status))
        .route(
            "/workflows/{id}/executions",
            post(workflows::start_execution).get(workflows::list_workflow_executions),
        )
        .route("/executions", get(workflows::list_executions))
        .route(
            "/executions/{id}",
            get(workflows::get_execution).delete(workflows::delete_execution),
        )
        .route("/executions/{id}/pause", post(workflows::pause_execution))
        .route("/executions/{id}/resume", post(workflows::resume_execution))
        .route("/executions/{id}/cancel", post(workflows::cancel_execution))
        .route("/node-types", get(workflows::node_types))
        .route("/tool-schemas", get(workflows::tool_schemas))
        .route("/workflow-templates", get(workflows::workflow_templates))
        .route(
            "/workflow-templates/{id}/instantiate",
            post(workflows::instantiate_template),
        )
        .with_state(state)
}
