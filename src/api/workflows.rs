//! Workflow, Execution and catalog routes.

use axum::body::Bytes;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::response::{optional_body, parse_query, ApiJson, ApiQuery, ApiResponse, ApiResult, Caller};
use super::tasks::page_of;
use super::AppState;
use crate::catalog::{NodeType, ToolSchema, WorkflowTemplate};
use crate::error::Error;
use crate::execution::{Execution, ExecutionFilter};
use crate::pagination::Page;
use crate::workflow::{Workflow, WorkflowDefinition, WorkflowStatus};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    status: Option<String>,
    workflow_id: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    status: WorkflowStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstantiateRequest {
    name: Option<String>,
}

pub async fn create_workflow(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    ApiJson(definition): ApiJson<WorkflowDefinition>,
) -> ApiResult<Workflow> {
    Ok(ApiResponse::created(state.engine.create_workflow(&ctx, definition)?))
}

pub async fn list_workflows(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<Page<Workflow>> {
    let status = parse_query("status", query.status.as_deref())?;
    let page = state
        .engine
        .list_workflows(&ctx, status, page_of(query.page, query.limit));
    Ok(ApiResponse::ok(page))
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Workflow> {
    let id = Error::parse_id("workflow", &id)?;
    Ok(ApiResponse::ok(state.engine.get_workflow(&ctx, id)?))
}

pub async fn update_workflow(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiJson(definition): ApiJson<WorkflowDefinition>,
) -> ApiResult<Workflow> {
    let id = Error::parse_id("workflow", &id)?;
    Ok(ApiResponse::ok(state.engine.update_workflow(&ctx, id, definition)?))
}

pub async fn delete_workflow(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Workflow> {
    let id = Error::parse_id("workflow", &id)?;
    Ok(ApiResponse::ok(state.engine.delete_workflow(&ctx, id)?))
}

pub async fn set_workflow_status(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<StatusRequest>,
) -> ApiResult<Workflow> {
    let id = Error::parse_id("workflow", &id)?;
    let workflow = state.engine.set_workflow_status(&ctx, id, request.status)?;
    Ok(ApiResponse::ok(workflow))
}

pub async fn start_execution(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Execution> {
    let id = Error::parse_id("workflow", &id)?;
    let params: Map<String, Value> = optional_body(&body)?;
    Ok(ApiResponse::created(state.engine.start_execution(&ctx, id, params)?))
}

pub async fn list_workflow_executions(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<Page<Execution>> {
    let id = Error::parse_id("workflow", &id)?;
    // Unknown or foreign workflows are a 404, not an empty list
    state.engine.get_workflow(&ctx, id)?;
    let filter = ExecutionFilter {
        workflow_id: Some(id),
        status: parse_query("status", query.status.as_deref())?,
    };
    let page = state
        .engine
        .list_executions(&ctx, filter, page_of(query.page, query.limit));
    Ok(ApiResponse::ok(page))
}

pub async fn list_executions(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<Page<Execution>> {
    let workflow_id = match query.workflow_id.as_deref() {
        Some(raw) => Some(Error::parse_id("workflow", raw)?),
        None => None,
    };
    let filter = ExecutionFilter {
        workflow_id,
        status: parse_query("status", query.status.as_deref())?,
    };
    let page = state
        .engine
        .list_executions(&ctx, filter, page_of(query.page, query.limit));
    Ok(ApiResponse::ok(page))
}

pub async fn get_execution(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Execution> {
    let id = Error::parse_id("execution", &id)?;
    Ok(ApiResponse::ok(state.engine.get_execution(&ctx, id)?))
}

pub async fn pause_execution(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Execution> {
    let id = Error::parse_id("execution", &id)?;
    Ok(ApiResponse::ok(state.engine.pause_execution(&ctx, id).await?))
}

pub async fn resume_execution(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Execution> {
    let id = Error::parse_id("execution", &id)?;
    Ok(ApiResponse::ok(state.engine.resume_execution(&ctx, id).await?))
}

pub async fn cancel_execution(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Execution> {
    let id = Error::parse_id("execution", &id)?;
    Ok(ApiResponse::ok(state.engine.cancel_execution(&ctx, id).await?))
}

pub async fn delete_execution(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Execution> {
    let id = Error::parse_id("execution", &id)?;
    Ok(ApiResponse::ok(state.engine.delete_execution(&ctx, id)?))
}

pub async fn node_types(State(state): State<AppState>) -> ApiResult<Vec<NodeType>> {
    let catalog = state.engine.tasks().catalog();
    Ok(ApiResponse::ok(catalog.node_types().to_vec()))
}

pub async fn workflow_templates(State(state): State<AppState>) -> ApiResult<Vec<WorkflowTemplate>> {
    let catalog = state.engine.tasks().catalog();
    Ok(ApiResponse::ok(catalog.templates().to_vec()))
}

pub async fn tool_schemas(State(state): State<AppState>) -> ApiResult<Vec<ToolSchema>> {
    let catalog = state.engine.tasks().catalog();
    Ok(ApiResponse::ok(catalog.tools().into_iter().cloned().collect()))
}

pub async fn instantiate_template(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Workflow> {
    let request: InstantiateRequest = optional_body(&body)?;
    let workflow = state.engine.instantiate_template(&ctx, &id, request.name)?;
    Ok(ApiResponse::created(workflow))
}
