//! Error Taxonomy
//!
//! Every orchestration call reports failures through [`Error`]. The first
//! six variants are the caller-facing categories; the remaining ones wrap
//! infrastructure faults from the storage layers.

use thiserror::Error;
use uuid::Uuid;

use crate::artifact::ArtifactError;
use crate::store::StoreError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the Task Manager, Workflow Engine and Catalog.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed config, unknown keys or bad input files.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A workflow graph that is cyclic or references unknown node types.
    #[error("invalid workflow graph: {0}")]
    InvalidGraph(String),

    /// The operation is not legal in the entity's current status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// The concurrency cap is reached and queueing is disabled.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The external tool could not be started or supervised.
    #[error("process fault: {0}")]
    ProcessFault(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable machine-readable error codes, used by batch reports and the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    InvalidGraph,
    InvalidState,
    NotFound,
    ResourceExhausted,
    ProcessFault,
    Internal,
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Parses a record id; a malformed id cannot name an existing record.
    pub fn parse_id(kind: &'static str, raw: &str) -> Result<Uuid> {
        Uuid::parse_str(raw.trim()).map_err(|_| Self::not_found(kind, raw))
    }

    /// Returns the caller-facing category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::InvalidGraph(_) => ErrorKind::InvalidGraph,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::ProcessFault(_) => ErrorKind::ProcessFault,
            Self::Artifact(ArtifactError::NotFound(_)) => ErrorKind::NotFound,
            Self::Artifact(ArtifactError::InvalidRef(_)) => ErrorKind::ValidationError,
            Self::Artifact(_) | Self::Storage(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::Validation("bad".into()).kind(),
            ErrorKind::ValidationError
        );
        assert_eq!(Error::not_found("task", "x").kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::Artifact(ArtifactError::NotFound("f".into())).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::Io(std::io::Error::other("disk")).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_parse_id() {
        let id = Uuid::new_v4();
        assert_eq!(Error::parse_id("task", &id.to_string()).unwrap(), id);
        assert!(matches!(
            Error::parse_id("task", "nope"),
            Err(Error::NotFound { kind: "task", .. })
        ));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::not_found("task", "abc").to_string(),
            "task 'abc' not found"
        );
        assert_eq!(
            Error::InvalidState("task is running".into()).to_string(),
            "invalid state: task is running"
        );
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ResourceExhausted).unwrap();
        assert_eq!(json, "\"resource_exhausted\"");
    }
}
