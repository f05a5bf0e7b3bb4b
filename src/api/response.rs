//! Response envelope, error mapping and request extractors.
//!
//! Every JSON response has the shape `{success, data?, error?{code, message}}`.

use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::batch::{BatchOutcome, BatchReport};
use crate::context::{CallerContext, Role};
use crate::error::{Error, ErrorKind};

/// Header naming the caller.
pub const CALLER_ID_HEADER: &str = "x-caller-id";

/// Header carrying the caller's role (`user` or `admin`).
pub const CALLER_ROLE_HEADER: &str = "x-caller-role";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: ErrorKind,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// A successful response.
pub struct ApiResponse<T> {
    status: StatusCode,
    data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: StatusCode::OK,
            data,
        }
    }

    pub fn created(data: T) -> Self {
        Self {
            status: StatusCode::CREATED,
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let body = Envelope {
            success: true,
            data: Some(self.data),
            error: None,
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

/// An orchestration error rendered as an envelope.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_of(self.0.kind())
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError | ErrorKind::InvalidGraph => StatusCode::BAD_REQUEST,
        ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::ProcessFault => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Request failed: {}", self.0);
        } else {
            log::debug!("Request rejected: {}", self.0);
        }
        let body: Envelope<Value> = Envelope {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: self.0.kind(),
                message: self.0.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

/// Renders a batch report: 200 when every item succeeded, 207 when some
/// did, 400 when none did.
pub fn batch_response<T: Serialize>(report: BatchReport<T>) -> Response {
    let (status, error) = match report.outcome {
        BatchOutcome::Succeeded => (StatusCode::OK, None),
        BatchOutcome::Partial => (StatusCode::MULTI_STATUS, None),
        BatchOutcome::Failed => {
            let code = report
                .items
                .iter()
                .find_map(|item| item.error.as_ref().map(|e| e.code))
                .unwrap_or(ErrorKind::ValidationError);
            let error = ErrorBody {
                code,
                message: format!("all {} items failed", report.failed),
            };
            (StatusCode::BAD_REQUEST, Some(error))
        }
    };
    let body = Envelope {
        success: error.is_none(),
        data: Some(report),
        error,
    };
    (status, Json(body)).into_response()
}

/// JSON body whose rejections are reported in the envelope.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| Self(value))
            .map_err(|rejection| ApiError(Error::Validation(rejection.body_text())))
    }
}

/// Query string whose rejections are reported in the envelope.
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| Self(value))
            .map_err(|rejection| ApiError(Error::Validation(rejection.body_text())))
    }
}

/// Parses an optional JSON body; an empty body yields the default.
pub fn optional_body<T: DeserializeOwned + Default>(bytes: &[u8]) -> Result<T, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| ApiError(Error::Validation(format!("invalid JSON body: {}", e))))
}

/// The caller of a request, taken from the `x-caller-*` headers.
#[derive(Debug, Clone)]
pub struct Caller(pub CallerContext);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let caller_id = header(parts, CALLER_ID_HEADER).ok_or_else(|| {
            ApiError(Error::Validation(format!("missing {} header", CALLER_ID_HEADER)))
        })?;
        let role = match header(parts, CALLER_ROLE_HEADER) {
            None | Some("user") => Role::User,
            Some("admin") => Role::Admin,
            Some(other) => {
                return Err(ApiError(Error::Validation(format!(
                    "unknown caller role '{}'",
                    other
                ))))
            }
        };

        Ok(Self(CallerContext {
            caller_id: caller_id.to_string(),
            role,
        }))
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Parses a lowercase enum from a query parameter.
pub fn parse_query<T: DeserializeOwned>(name: &str, raw: Option<&str>) -> Result<Option<T>, ApiError> {
    match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        None => Ok(None),
        Some(raw) => serde_json::from_value(Value::String(raw.to_string()))
            .map(Some)
            .map_err(|_| ApiError(Error::Validation(format!("invalid {} '{}'", name, raw)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(ErrorKind::ValidationError), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(ErrorKind::InvalidGraph), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(ErrorKind::InvalidState), StatusCode::CONFLICT);
        assert_eq!(status_of(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ErrorKind::ResourceExhausted), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_of(ErrorKind::ProcessFault), StatusCode::BAD_GATEWAY);
        assert_eq!(status_of(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_batch_status() {
        let mut report: BatchReport<u8> = BatchReport::new();
        assert_eq!(batch_response(report.clone()).status(), StatusCode::OK);
        report.record("a", Ok(1));
        report.record("b", Err(Error::not_found("task", "b")));
        assert_eq!(batch_response(report).status(), StatusCode::MULTI_STATUS);

        let failed: BatchReport<u8> = vec![("c".to_string(), Err(Error::not_found("task", "c")))]
            .into_iter()
            .collect();
        assert_eq!(batch_response(failed).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_query() {
        let status: Option<TaskStatus> = parse_query("status", Some("running")).unwrap();
        assert_eq!(status, Some(TaskStatus::Running));
        assert_eq!(parse_query::<TaskStatus>("status", Some("")).unwrap(), None);
        assert!(parse_query::<TaskStatus>("status", Some("sleeping")).is_err());
    }

    #[test]
    fn test_optional_body() {
        let empty: serde_json::Map<String, Value> = optional_body(b"  ").unwrap();
        assert!(empty.is_empty());
        let params: serde_json::Map<String, Value> = optional_body(br#"{"a": 1}"#).unwrap();
        assert_eq!(params["a"], 1);
        assert!(optional_body::<serde_json::Map<String, Value>>(b"[1").is_err());
    }
}
