//! Execution Planner
//!
//! Decides which nodes of an Execution may start:
//! - dependency tracking in topological order
//! - the per-Execution cap on running nodes
//! - which nodes a failure takes down with it
//!
//! The planner holds only the graph; node statuses live in the Execution
//! and are passed in on every call.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use log::{debug, info};

use super::model::Workflow;
use super::validator::topological_order;
use crate::error::Result;
use crate::execution::{FailurePolicy, NodeState, NodeStatus};

/// Schedules the nodes of one Workflow.
#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    /// Node ids, dependencies first
    order: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    /// Maximum nodes running at once
    max_running: usize,
}

impl ExecutionPlanner {
    /// Creates a planner for a Workflow, allowing at most `max_running`
    /// nodes to run at once.
    pub fn new(workflow: &Workflow, max_running: usize) -> Result<Self> {
        let order = topological_order(&workflow.nodes, &workflow.edges)?;

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for node in &workflow.nodes {
            dependencies.insert(node.id.clone(), workflow.dependencies(&node.id));
        }
        for edge in &workflow.edges {
            let children = dependents.entry(edge.from.clone()).or_default();
            if !children.contains(&edge.to) {
                children.push(edge.to.clone());
            }
        }

        info!(
            "Creating planner: {} nodes, {} running at most",
            order.len(),
            max_running
        );

        Ok(Self {
            order,
            dependencies,
            dependents,
            max_running: max_running.max(1),
        })
    }

    pub fn max_running(&self) -> usize {
        self.max_running
    }

    /// Node ids in dependency order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Returns the pending nodes whose dependencies have all completed,
    /// limited to the free running slots.
    pub fn ready_nodes(&self, states: &BTreeMap<String, NodeState>) -> Vec<String> {
        let running = count(states, NodeStatus::Running);
        let slots = self.max_running.saturating_sub(running);
        if slots == 0 {
            debug!("No free node slots ({} running)", running);
            return Vec::new();
        }

        self.order
            .iter()
            .filter(|id| status(states, id) == Some(NodeStatus::Pending))
            .filter(|id| {
                self.dependencies
                    .get(*id)
                    .map_or(true, |deps| {
                        deps.iter()
                            .all(|dep| status(states, dep) == Some(NodeStatus::Completed))
                    })
            })
            .take(slots)
            .cloned()
            .collect()
    }

    /// Returns every node reachable from `node_id`, excluding itself.
    pub fn descendants(&self, node_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([node_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for child in self.dependents.get(&current).into_iter().flatten() {
                if seen.insert(child.clone()) {
                    queue.push_back(child.clone());
                }
            }
        }
        self.order
            .iter()
            .filter(|id| seen.contains(*id))
            .cloned()
            .collect()
    }

    /// Returns the pending nodes a failure of `node_id` rules out.
    pub fn nodes_to_skip(
        &self,
        node_id: &str,
        policy: FailurePolicy,
        states: &BTreeMap<String, NodeState>,
    ) -> Vec<String> {
        let candidates = match policy {
            FailurePolicy::FailFast => self.order.clone(),
            FailurePolicy::Continue => self.descendants(node_id),
        };
        candidates
            .into_iter()
            .filter(|id| status(states, id) == Some(NodeStatus::Pending))
            .collect()
    }

    /// Returns true while some node is running or could still start.
    pub fn has_work_remaining(&self, states: &BTreeMap<String, NodeState>) -> bool {
        count(states, NodeStatus::Running) > 0 || count(states, NodeStatus::Pending) > 0
    }
}

fn status(states: &BTreeMap<String, NodeState>, id: &str) -> Option<NodeStatus> {
    states.get(id).map(|state| state.status)
}

fn count(states: &BTreeMap<String, NodeState>, wanted: NodeStatus) -> usize {
    states.values().filter(|state| state.status == wanted).count()
}
