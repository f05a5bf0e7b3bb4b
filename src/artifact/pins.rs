use std::collections::HashMap;
use std::sync::Mutex;

use super::FileRef;

/// Reference counts of artifacts held by non-terminal Tasks and Executions.
///
/// An artifact with a nonzero count must not be deleted.
#[derive(Debug, Default)]
pub struct ArtifactPins {
    counts: Mutex<HashMap<FileRef, usize>>,
}

impl ArtifactPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin<'a>(&self, files: impl IntoIterator<Item = &'a FileRef>) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        for file in files {
            *counts.entry(file.clone()).or_insert(0) += 1;
        }
    }

    pub fn unpin<'a>(&self, files: impl IntoIterator<Item = &'a FileRef>) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        for file in files {
            if let Some(count) = counts.get_mut(file) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(file);
                }
            }
        }
    }

    pub fn is_pinned(&self, file: &FileRef) -> bool {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(file)
    }
}
