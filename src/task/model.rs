//! Task Data Model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::artifact::FileRef;

/// The external tool a Task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Bulk network scanner (xmap)
    Scanner,
    /// Application-layer banner grabber (zgrab2)
    Grabber,
}

impl ToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scanner => "scanner",
            Self::Grabber => "grabber",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scanner" | "xmap" => Ok(Self::Scanner),
            "grabber" | "zgrab2" => Ok(Self::Grabber),
            other => Err(format!("unknown tool kind '{}'", other)),
        }
    }
}

/// Lifecycle status of a Task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if `self -> next` is a legal transition.
    ///
    /// Terminal states have no outgoing transitions.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// The workflow node a Task was created for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOrigin {
    pub execution_id: Uuid,
    pub node_id: String,
}

/// One supervised invocation of an external tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub owner: String,
    pub tool_kind: ToolKind,
    pub status: TaskStatus,
    pub description: String,
    /// Validated config with defaults applied.
    pub config: Map<String, Value>,
    /// The argv that is (or was) launched.
    pub command: Vec<String>,
    pub input_file_refs: Vec<FileRef>,
    /// Inputs uploaded with the Task itself; deleted along with it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owned_input_refs: Vec<FileRef>,
    pub result_file_ref: Option<FileRef>,
    pub log_file_ref: Option<FileRef>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<TaskOrigin>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Every artifact this Task references, including a zgrab2 config file.
    pub fn artifacts(&self) -> Vec<FileRef> {
        let mut files: Vec<FileRef> = self
            .input_file_refs
            .iter()
            .chain(self.result_file_ref.iter())
            .chain(self.log_file_ref.iter())
            .cloned()
            .collect();
        if let Some(file) = self
            .config
            .get("configFileRef")
            .and_then(Value::as_str)
            .and_then(|raw| FileRef::parse(raw).ok())
        {
            files.push(file);
        }
        files
    }

    /// Artifacts removed when the Task is deleted.
    pub fn owned_artifacts(&self) -> Vec<FileRef> {
        self.owned_input_refs
            .iter()
            .chain(self.result_file_ref.iter())
            .chain(self.log_file_ref.iter())
            .cloned()
            .collect()
    }
}

/// A file uploaded together with a Task request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineFile {
    pub name: String,
    pub content: String,
}

/// Arguments of `create_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub tool_kind: ToolKind,
    #[serde(default)]
    pub config: Value,
    /// Previously stored artifacts used as inputs.
    #[serde(default)]
    pub input_file_refs: Vec<FileRef>,
    /// Input files stored as part of this request.
    #[serde(default)]
    pub input_files: Vec<InlineFile>,
    #[serde(default)]
    pub description: Option<String>,
    /// Overrides the queue-when-busy setting for this request.
    #[serde(default)]
    pub queue: Option<bool>,
    #[serde(skip)]
    pub origin: Option<TaskOrigin>,
}

impl TaskRequest {
    pub fn new(tool_kind: ToolKind, config: Value) -> Self {
        Self {
            tool_kind,
            config,
            input_file_refs: Vec::new(),
            input_files: Vec::new(),
            description: None,
            queue: None,
            origin: None,
        }
    }

    pub fn with_input(mut self, file: FileRef) -> Self {
        self.input_file_refs.push(file);
        self
    }

    pub fn with_inline_input(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.input_files.push(InlineFile {
            name: name.into(),
            content: content.into(),
        });
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn queue(mut self, queue: bool) -> Self {
        self.queue = Some(queue);
        self
    }
}

/// Filters of `list_tasks`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub tool_kind: Option<ToolKind>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| s == task.status)
            && self.tool_kind.map_or(true, |k| k == task.tool_kind)
    }
}

/// Which artifact of a Task to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskArtifact {
    Result,
    Log,
}
