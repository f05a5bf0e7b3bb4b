//! Task and file routes.

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use super::response::{
    batch_response, parse_query, ApiError, ApiJson, ApiQuery, ApiResponse, ApiResult, Caller,
};
use super::AppState;
use crate::artifact::FileRef;
use crate::error::Error;
use crate::pagination::{Page, PageRequest};
use crate::task::{Task, TaskArtifact, TaskFilter, TaskRequest, ToolKind};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQuery {
    status: Option<String>,
    tool_kind: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    name: Option<String>,
}

pub(super) fn page_of(page: Option<usize>, limit: Option<usize>) -> PageRequest {
    let default = PageRequest::default();
    PageRequest::new(page.unwrap_or(default.page), limit.unwrap_or(default.limit))
}

pub async fn create_task(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    ApiJson(request): ApiJson<TaskRequest>,
) -> ApiResult<Task> {
    let task = state.engine.tasks().create_task(&ctx, request)?;
    Ok(ApiResponse::created(task))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    ApiQuery(query): ApiQuery<TaskQuery>,
) -> ApiResult<Page<Task>> {
    let tool_kind: Option<ToolKind> = match query.tool_kind.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse().map_err(|e: String| ApiError(Error::Validation(e)))?),
    };
    let filter = TaskFilter {
        status: parse_query("status", query.status.as_deref())?,
        tool_kind,
    };
    let page = state
        .engine
        .tasks()
        .list_tasks(&ctx, filter, page_of(query.page, query.limit));
    Ok(ApiResponse::ok(page))
}

pub async fn get_task(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Task> {
    let id = Error::parse_id("task", &id)?;
    Ok(ApiResponse::ok(state.engine.tasks().get_task(&ctx, id)?))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Task> {
    let id = Error::parse_id("task", &id)?;
    let tasks = state.engine.tasks();
    tasks.cancel_task(&ctx, id)?;
    Ok(ApiResponse::ok(tasks.get_task(&ctx, id)?))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Task> {
    let id = Error::parse_id("task", &id)?;
    Ok(ApiResponse::ok(state.engine.tasks().delete_task(&ctx, id)?))
}

pub async fn cancel_batch(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    ApiJson(request): ApiJson<BatchRequest>,
) -> Response {
    batch_response(state.engine.tasks().cancel_batch(&ctx, &request.ids))
}

pub async fn delete_batch(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    ApiJson(request): ApiJson<BatchRequest>,
) -> Response {
    batch_response(state.engine.tasks().delete_batch(&ctx, &request.ids))
}

pub async fn task_result(
    state: State<AppState>,
    caller: Caller,
    id: Path<String>,
) -> Result<Response, ApiError> {
    download(state, caller, id, TaskArtifact::Result).await
}

pub async fn task_log(
    state: State<AppState>,
    caller: Caller,
    id: Path<String>,
) -> Result<Response, ApiError> {
    download(state, caller, id, TaskArtifact::Log).await
}

/// Streams a Task artifact without loading it into memory.
async fn download(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    which: TaskArtifact,
) -> Result<Response, ApiError> {
    let id = Error::parse_id("task", &id)?;
    let (file, handle) = state.engine.tasks().open_artifact(&ctx, id, which)?;

    let content_type = match which {
        TaskArtifact::Log => "text/plain; charset=utf-8",
        TaskArtifact::Result if file.as_str().ends_with(".json") => "application/json",
        TaskArtifact::Result => "application/octet-stream",
    };
    let stream = tokio_util::io::ReaderStream::new(tokio::fs::File::from_std(handle));
    let disposition = format!("attachment; filename=\"{}\"", file);

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

pub async fn upload_file(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    ApiQuery(query): ApiQuery<UploadQuery>,
    body: Bytes,
) -> ApiResult<Value> {
    let name = query
        .name
        .ok_or_else(|| ApiError(Error::Validation("missing name parameter".to_string())))?;
    let file = state.engine.tasks().upload_artifact(&ctx, &name, &body)?;
    Ok(ApiResponse::created(json!({ "fileRef": file, "size": body.len() })))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(raw): Path<String>,
) -> ApiResult<Value> {
    let file = FileRef::parse(&raw).map_err(Error::from)?;
    state.engine.tasks().delete_artifact(&ctx, &file)?;
    Ok(ApiResponse::ok(json!({ "fileRef": file })))
}
