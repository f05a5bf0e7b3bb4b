//! Artifact Storage
//!
//! Artifacts are the files a scan consumes or produces: target lists,
//! result files and process logs. They are stored outside the Task and
//! Execution records and referenced by an opaque [`FileRef`].
//!
//! # Components
//!
//! - [`ArtifactStore`]: the pluggable storage backend
//! - [`FsArtifactStore`]: a directory-backed implementation
//! - [`ArtifactPins`]: references held by live Tasks and Executions
//! - [`ArtifactOwners`]: uploaders and the records that own each file

mod fs;
mod owners;
mod pins;

pub use fs::FsArtifactStore;
pub use owners::{ArtifactOwners, Upload};
pub use pins::ArtifactPins;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by artifact storage backends.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact reference: {0}")]
    InvalidRef(String),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque handle to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileRef(String);

impl FileRef {
    /// Wraps a raw reference, rejecting anything that could escape the store.
    pub fn parse(raw: &str) -> Result<Self, ArtifactError> {
        let valid = !raw.is_empty()
            && raw.len() <= 255
            && !raw.starts_with('.')
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(ArtifactError::InvalidRef(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FileRef {
    type Error = ArtifactError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<FileRef> for String {
    fn from(file: FileRef) -> Self {
        file.0
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage backend for artifacts.
///
/// External scan tools read and write plain files, so every backend must be
/// able to stage an artifact at a local path.
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` under a fresh reference derived from `name`.
    fn put(&self, name: &str, bytes: &[u8]) -> Result<FileRef, ArtifactError>;

    /// Allocates an empty artifact that an external process will write into.
    fn reserve(&self, name: &str) -> Result<(FileRef, PathBuf), ArtifactError>;

    /// Returns the local path of a stored artifact.
    fn path(&self, file: &FileRef) -> Result<PathBuf, ArtifactError>;

    /// Opens a stored artifact for reading.
    fn open(&self, file: &FileRef) -> Result<std::fs::File, ArtifactError>;

    /// Removes an artifact. Removing a missing artifact is not an error.
    fn delete(&self, file: &FileRef) -> Result<(), ArtifactError>;

    fn exists(&self, file: &FileRef) -> bool;
}

/// Reduces a user supplied file name to the characters allowed in a [`FileRef`].
pub(crate) fn sanitize_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(120)
        .collect();

    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}
