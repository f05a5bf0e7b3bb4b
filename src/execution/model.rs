//! Execution records: one run of a Workflow and the state of each node.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::artifact::FileRef;
use crate::monitoring::ExecutionTimeline;
use crate::workflow::Workflow;

/// What happens to the rest of an Execution when a node fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Skip every node that has not started yet.
    #[default]
    FailFast,
    /// Skip only the descendants of the failed node.
    Continue,
}

/// Status of an Execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    /// No new nodes start; nodes already running continue.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Status of one node within an Execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Runtime state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub node_id: String,
    pub node_type: String,
    pub status: NodeStatus,
    /// Task backing a scan node.
    pub task_id: Option<Uuid>,
    /// Output passed to downstream nodes; at least `type` and `fileRef`.
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl NodeState {
    fn pending(node_id: &str, node_type: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            status: NodeStatus::Pending,
            task_id: None,
            output: None,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// The artifact named by this node's output, if any.
    pub fn output_file(&self) -> Option<FileRef> {
        self.output
            .as_ref()
            .and_then(|output| output.get("fileRef"))
            .and_then(Value::as_str)
            .and_then(|raw| FileRef::parse(raw).ok())
    }
}

/// Node counts of an Execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub running_nodes: usize,
    pub failed_nodes: usize,
    pub skipped_nodes: usize,
}

impl Progress {
    /// Share of nodes that reached a terminal status, in percent.
    pub fn percent(&self) -> u8 {
        if self.total_nodes == 0 {
            return 100;
        }
        let done = self.completed_nodes + self.failed_nodes + self.skipped_nodes;
        ((done * 100) / self.total_nodes) as u8
    }
}

/// One run of a Workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub owner: String,
    pub status: ExecutionStatus,
    /// Caller parameters; root nodes receive them as input.
    pub params: Map<String, Value>,
    pub failure_policy: FailurePolicy,
    pub max_running_nodes: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub node_states: BTreeMap<String, NodeState>,
    pub progress: Progress,
    pub timeline: ExecutionTimeline,
    pub error: Option<String>,
    /// Files written by in-process nodes; deleted along with the Execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owned_artifacts: Vec<FileRef>,
}

impl Execution {
    /// Creates a running Execution with every node pending.
    pub fn start(
        workflow: &Workflow,
        owner: &str,
        params: Map<String, Value>,
        failure_policy: FailurePolicy,
        max_running_nodes: usize,
    ) -> Self {
        let now = Utc::now();
        let node_states = workflow
            .nodes
            .iter()
            .map(|node| (node.id.clone(), NodeState::pending(&node.id, &node.node_type)))
            .collect();

        let mut execution = Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            owner: owner.to_string(),
            status: ExecutionStatus::Running,
            params,
            failure_policy,
            max_running_nodes,
            created_at: now,
            started_at: Some(now),
            ended_at: None,
            node_states,
            progress: Progress::default(),
            timeline: ExecutionTimeline::new(),
            error: None,
            owned_artifacts: Vec::new(),
        };
        execution.refresh_progress();
        execution
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeState> {
        self.node_states.get(node_id)
    }

    /// Recomputes the node counts from the node states.
    pub fn refresh_progress(&mut self) {
        let mut progress = Progress {
            total_nodes: self.node_states.len(),
            ..Progress::default()
        };
        for state in self.node_states.values() {
            match state.status {
                NodeStatus::Completed => progress.completed_nodes += 1,
                NodeStatus::Running => progress.running_nodes += 1,
                NodeStatus::Failed => progress.failed_nodes += 1,
                NodeStatus::Skipped => progress.skipped_nodes += 1,
                NodeStatus::Pending => {}
            }
        }
        self.progress = progress;
    }

    /// Ids of nodes in the given status, in id order.
    pub fn nodes_in(&self, status: NodeStatus) -> Vec<String> {
        self.node_states
            .values()
            .filter(|state| state.status == status)
            .map(|state| state.node_id.clone())
            .collect()
    }
}

/// Filters of `list_executions`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &Execution) -> bool {
        self.workflow_id.map_or(true, |id| id == execution.workflow_id)
            && self.status.map_or(true, |s| s == execution.status)
    }
}
