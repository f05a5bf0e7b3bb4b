use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::FileRef;

/// A file stored through the upload endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub file_ref: FileRef,
    pub owner: String,
    pub size: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct OwnerTable {
    uploads: HashMap<FileRef, Upload>,
    claims: HashMap<FileRef, usize>,
}

/// Who may remove an artifact directly.
///
/// Uploads belong to the caller that stored them. Results, logs, owned
/// inputs and node outputs are claimed by their Task or Execution record
/// and only go away with it.
#[derive(Debug, Default)]
pub struct ArtifactOwners {
    table: Mutex<OwnerTable>,
}

impl ArtifactOwners {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, OwnerTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_upload(&self, upload: Upload) {
        self.table().uploads.insert(upload.file_ref.clone(), upload);
    }

    pub fn upload(&self, file: &FileRef) -> Option<Upload> {
        self.table().uploads.get(file).cloned()
    }

    pub fn forget_upload(&self, file: &FileRef) {
        self.table().uploads.remove(file);
    }

    pub fn claim<'a>(&self, files: impl IntoIterator<Item = &'a FileRef>) {
        let mut table = self.table();
        for file in files {
            *table.claims.entry(file.clone()).or_insert(0) += 1;
        }
    }

    pub fn release<'a>(&self, files: impl IntoIterator<Item = &'a FileRef>) {
        let mut table = self.table();
        for file in files {
            if let Some(count) = table.claims.get_mut(file) {
                *count -= 1;
                if *count == 0 {
                    table.claims.remove(file);
                }
            }
        }
    }

    pub fn is_claimed(&self, file: &FileRef) -> bool {
        self.table().claims.contains_key(file)
    }
}
