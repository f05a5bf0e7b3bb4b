//! Record Persistence
//!
//! Tasks, uploads, Workflows and Executions are saved as one pretty-printed JSON
//! file per record under `<data_dir>/records/<collection>/<id>.json`, so
//! that state survives an orchestrator restart.
//!
//! Writes go to a temporary file first and are renamed into place, which
//! keeps a crash from leaving a half-written record behind.

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("record {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A typed collection of JSON records.
///
/// A store without a directory keeps nothing on disk; this is what tests
/// and ephemeral deployments use.
#[derive(Debug)]
pub struct RecordStore<T> {
    dir: Option<PathBuf>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for RecordStore<T> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> RecordStore<T> {
    /// Opens the collection `name` under `data_dir/records`.
    pub fn open(data_dir: &Path, name: &str) -> Result<Self, StoreError> {
        let dir = data_dir.join("records").join(name);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        Ok(Self {
            dir: Some(dir),
            _marker: PhantomData,
        })
    }

    /// A store that persists nothing.
    pub fn ephemeral() -> Self {
        Self {
            dir: None,
            _marker: PhantomData,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    /// Writes a record, replacing any previous version.
    pub fn save(&self, id: &str, record: &T) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let path = dir.join(format!("{}.json", id));
        let tmp = dir.join(format!(".{}.json.tmp", id));

        let json = serde_json::to_string_pretty(record).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;

        fs::write(&tmp, json).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;

        debug!("Saved record {}", path.display());
        Ok(())
    }

    /// Deletes a record. Deleting a missing record is not an error.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let path = dir.join(format!("{}.json", id));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Loads every record in the collection.
    ///
    /// Unreadable records are skipped with a warning rather than failing
    /// startup.
    pub fn load_all(&self) -> Result<Vec<T>, StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };

        let entries = fs::read_dir(dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_record = path.extension().map(|e| e == "json").unwrap_or(false)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }

            match Self::load_file(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable record: {}", e),
            }
        }

        info!("Loaded {} records from {}", records.len(), dir.display());
        Ok(records)
    }

    fn load_file(path: &Path) -> Result<T, StoreError> {
        let content = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}
