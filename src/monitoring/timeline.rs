//! Execution Timeline
//!
//! Records when each node of an Execution starts and finishes, and when
//! the Execution itself is paused, resumed or cancelled. The timeline is
//! stored inside the Execution record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Node started executing
    Started,
    /// Node completed successfully
    Completed,
    /// Node failed
    Failed,
    /// Node will not run
    Skipped,
    Paused,
    Resumed,
    Cancelled,
}

impl EventType {
    /// Returns true for events that end a node.
    pub fn ends_node(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    /// Node the event belongs to; `None` for Execution-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub event: EventType,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Ordered list of events of one Execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event for a node.
    pub fn node_event(&mut self, node_id: &str, event: EventType, message: Option<String>) {
        self.events.push(TimelineEvent {
            node_id: Some(node_id.to_string()),
            event,
            at: Utc::now(),
            message,
        });
    }

    /// Records an Execution-level event.
    pub fn execution_event(&mut self, event: EventType) {
        self.events.push(TimelineEvent {
            node_id: None,
            event,
            at: Utc::now(),
            message: None,
        });
    }

    /// Returns all recorded events.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns how long each finished node ran, in milliseconds.
    ///
    /// Nodes that never started (skipped ones) have no duration.
    pub fn durations(&self) -> HashMap<String, i64> {
        let mut starts: HashMap<&str, DateTime<Utc>> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            let Some(node_id) = event.node_id.as_deref() else {
                continue;
            };
            match event.event {
                EventType::Started => {
                    starts.insert(node_id, event.at);
                }
                e if e.ends_node() => {
                    if let Some(start) = starts.get(node_id) {
                        durations.insert(
                            node_id.to_string(),
                            (event.at - *start).num_milliseconds().max(0),
                        );
                    }
                }
                _ => {}
            }
        }

        durations
    }
}
