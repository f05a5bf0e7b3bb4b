//! Workflow Data Model
//!
//! A Workflow is a directed acyclic graph of typed nodes. Each node names a
//! node type from the catalog and carries that type's config; edges pass
//! the output of one node to the input port of another.
//!
//! # Example Definition (YAML or JSON)
//!
//! ```yaml
//! name: ipv6 discovery
//! nodes:
//!   - id: input_1
//!     type: file_input
//!     config:
//!       fileType: txt
//!   - id: xmap_1
//!     type: xmap_scan
//!     config:
//!       probeModule: icmp_echo
//!       rate: 1000
//! edges:
//!   - from: input_1
//!     to: xmap_1
//!     fromPort: file
//!     toPort: file
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle status of a Workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Editable, cannot be executed.
    #[default]
    Draft,
    /// Frozen, can be executed.
    Active,
    /// Retired; kept for its execution history.
    Archived,
}

impl WorkflowStatus {
    /// Returns true if a definition may move from `self` to `next`.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Draft, Active) | (Active, Draft) | (Draft, Archived) | (Active, Archived)
        )
    }
}

/// One node of a workflow graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeDefinition {
    /// Unique identifier within the workflow
    pub id: String,

    /// Catalog node type, e.g. `xmap_scan`
    #[serde(rename = "type")]
    pub node_type: String,

    /// Node type specific configuration
    #[serde(default)]
    pub config: Map<String, Value>,

    /// Optional display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl NodeDefinition {
    /// Creates a node with an empty config.
    ///
    /// # Example
    ///
    /// ```
    /// use scanrunner::workflow::NodeDefinition;
    /// use serde_json::json;
    ///
    /// let node = NodeDefinition::new("xmap_1", "xmap_scan")
    ///     .with_config(json!({"probeModule": "icmp_echo", "rate": 500}));
    /// assert_eq!(node.config["rate"], 500);
    /// ```
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            node_type: node_type.into().trim().to_string(),
            config: Map::new(),
            label: None,
        }
    }

    /// Replaces the config with the fields of a JSON object.
    ///
    /// Non-object values leave the config empty.
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A directed edge carrying one node's output into another node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from: String,
    pub to: String,

    /// Output port on `from`; any compatible port if absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_port: Option<String>,

    /// Input port on `to`; any compatible port if absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_port: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            from_port: None,
            to_port: None,
        }
    }

    /// Sets both ports of the edge.
    pub fn ports(mut self, from_port: impl Into<String>, to_port: impl Into<String>) -> Self {
        self.from_port = Some(from_port.into());
        self.to_port = Some(to_port.into());
        self
    }
}

/// The caller-supplied part of a Workflow: what gets validated on save.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,

    #[serde(default, alias = "connections")]
    pub edges: Vec<Edge>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Appends a node.
    pub fn node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    /// Appends an edge.
    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Connects nodes in a chain: `ids[0] -> ids[1] -> ...`
    pub fn chain(mut self, ids: &[&str]) -> Self {
        for pair in ids.windows(2) {
            self.edges.push(Edge::new(pair[0], pair[1]));
        }
        self
    }

    /// Parses a definition from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}

/// A saved Workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub description: String,
    pub status: WorkflowStatus,
    pub nodes: Vec<NodeDefinition>,
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Builds a new draft Workflow from a validated definition.
    pub fn from_definition(owner: &str, definition: WorkflowDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            name: definition.name,
            description: definition.description,
            status: WorkflowStatus::Draft,
            nodes: definition.nodes,
            edges: definition.edges,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the node with the given id.
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Returns the edges that lead into `node_id`.
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to == node_id)
    }

    /// Returns the IDs of nodes `node_id` depends on.
    pub fn dependencies(&self, node_id: &str) -> Vec<String> {
        let mut deps: Vec<String> = self.incoming(node_id).map(|e| e.from.clone()).collect();
        deps.sort();
        deps.dedup();
        deps
    }

    /// Returns the IDs of nodes with no incoming edges.
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| !self.edges.iter().any(|e| e.to == n.id))
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Returns the definition part of this Workflow.
    pub fn definition(&self) -> WorkflowDefinition {
        WorkflowDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> WorkflowDefinition {
        WorkflowDefinition::new("discovery")
            .node(NodeDefinition::new("input_1", "file_input"))
            .node(NodeDefinition::new("xmap_1", "xmap_scan"))
            .node(NodeDefinition::new("extract_1", "xmap_json_extract"))
            .chain(&["input_1", "xmap_1", "extract_1"])
    }

    #[test]
    fn test_node_builder() {
        let node = NodeDefinition::new("  xmap_1 ", "xmap_scan")
            .with_config(json!({"rate": 10}))
            .with_label("Discovery");
        assert_eq!(node.id, "xmap_1");
        assert_eq!(node.config["rate"], 10);
        assert_eq!(node.label.as_deref(), Some("Discovery"));
    }

    #[test]
    fn test_with_config_ignores_non_objects() {
        let node = NodeDefinition::new("a", "file_input").with_config(json!("oops"));
        assert!(node.config.is_empty());
    }

    #[test]
    fn test_chain_edges() {
        let def = sample();
        assert_eq!(def.edges.len(), 2);
        assert_eq!(def.edges[1], Edge::new("xmap_1", "extract_1"));
    }

    #[test]
    fn test_workflow_queries() {
        let workflow = Workflow::from_definition("alice", sample());
        assert_eq!(workflow.status, WorkflowStatus::Draft);
        assert_eq!(workflow.roots(), vec!["input_1"]);
        assert_eq!(workflow.dependencies("extract_1"), vec!["xmap_1"]);
        assert!(workflow.dependencies("input_1").is_empty());
        assert!(workflow.node("xmap_1").is_some());
        assert!(workflow.node("missing").is_none());
    }

    #[test]
    fn test_connections_alias() {
        let json = r#"{
            "name": "legacy",
            "nodes": [{"id": "a", "type": "file_input"}, {"id": "b", "type": "xmap_scan"}],
            "connections": [{"from": "a", "to": "b", "fromPort": "file", "toPort": "file"}]
        }"#;
        let def: WorkflowDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.edges.len(), 1);
        assert_eq!(def.edges[0].to_port.as_deref(), Some("file"));
    }

    #[test]
    fn test_yaml_definition() {
        let yaml = r#"
name: yaml flow
nodes:
  - id: input_1
    type: file_input
  - id: xmap_1
    type: xmap_scan
    config:
      rate: 500
edges:
  - from: input_1
    to: xmap_1
"#;
        let def = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.nodes[1].config["rate"], 500);
    }

    #[test]
    fn test_status_transitions() {
        use WorkflowStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(Draft));
        assert!(Active.can_transition_to(Archived));
        assert!(!Archived.can_transition_to(Active));
        assert!(!Archived.can_transition_to(Draft));
        assert!(!Draft.can_transition_to(Draft));
    }

    #[test]
    fn test_workflow_serializes_camel_case() {
        let workflow = Workflow::from_definition("alice", sample());
        let json = serde_json::to_value(&workflow).unwrap();
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["status"], "draft");
        assert_eq!(json["nodes"][1]["type"], "xmap_scan");
    }
}
