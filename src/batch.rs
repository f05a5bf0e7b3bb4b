//! Batch Outcomes
//!
//! Operations that act on several items at once never abort on the first
//! failure. Each item gets its own outcome and the report as a whole is
//! classified as succeeded, partial or failed.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Overall classification of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOutcome {
    /// Every item succeeded (an empty batch counts as succeeded).
    Succeeded,
    /// Some items succeeded and some failed.
    Partial,
    /// Every item failed.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub code: ErrorKind,
    pub message: String,
}

/// The outcome of one item in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem<T> {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

/// Per-item results of a batch operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport<T> {
    pub outcome: BatchOutcome,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<BatchItem<T>>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            outcome: BatchOutcome::Succeeded,
            succeeded: 0,
            failed: 0,
            items: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result for one item and reclassifies the batch.
    pub fn record(&mut self, id: impl Into<String>, result: Result<T, Error>) {
        let item = match result {
            Ok(value) => {
                self.succeeded += 1;
                BatchItem {
                    id: id.into(),
                    ok: true,
                    value: Some(value),
                    error: None,
                }
            }
            Err(e) => {
                self.failed += 1;
                BatchItem {
                    id: id.into(),
                    ok: false,
                    value: None,
                    error: Some(ItemError {
                        code: e.kind(),
                        message: e.to_string(),
                    }),
                }
            }
        };
        self.items.push(item);
        self.outcome = classify(self.succeeded, self.failed);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> FromIterator<(String, Result<T, Error>)> for BatchReport<T> {
    fn from_iter<I: IntoIterator<Item = (String, Result<T, Error>)>>(iter: I) -> Self {
        let mut report = Self::new();
        for (id, result) in iter {
            report.record(id, result);
        }
        report
    }
}

fn classify(succeeded: usize, failed: usize) -> BatchOutcome {
    match (succeeded, failed) {
        (_, 0) => BatchOutcome::Succeeded,
        (0, _) => BatchOutcome::Failed,
        _ => BatchOutcome::Partial,
    }
}
