//! Workflow Validation
//!
//! Checks a definition before it is saved:
//! - node ids are unique and every node type exists in the catalog
//! - edges reference existing nodes over compatible ports
//! - the graph has no cycles (Kahn's algorithm)
//! - each node config matches its node type schema
//!
//! Graph problems are reported as [`Error::InvalidGraph`], config problems
//! as [`Error::Validation`]; both list every problem found.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use log::{debug, info};
use serde_json::Value;

use super::model::{Edge, NodeDefinition, WorkflowDefinition};
use crate::catalog::{validate_config, Catalog, NodeType};
use crate::error::{Error, Result};

/// Structural problems of a workflow graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    EmptyWorkflow,
    EmptyNodeId,
    DuplicateNodeId(String),
    UnknownNodeType { node: String, node_type: String },
    UnknownNode { edge: String, node: String },
    SelfLoop(String),
    IncompatiblePorts { edge: String, detail: String },
    CyclicDependency,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "workflow has no nodes"),
            Self::EmptyNodeId => write!(f, "a node has an empty id"),
            Self::DuplicateNodeId(id) => write!(f, "duplicate node id '{}'", id),
            Self::UnknownNodeType { node, node_type } => {
                write!(f, "node '{}' has unknown type '{}'", node, node_type)
            }
            Self::UnknownNode { edge, node } => {
                write!(f, "edge {} references unknown node '{}'", edge, node)
            }
            Self::SelfLoop(node) => write!(f, "node '{}' is connected to itself", node),
            Self::IncompatiblePorts { edge, detail } => write!(f, "edge {}: {}", edge, detail),
            Self::CyclicDependency => write!(f, "workflow contains a cycle"),
        }
    }
}

fn edge_label(edge: &Edge) -> String {
    format!("{} -> {}", edge.from, edge.to)
}

/// Validates a definition and returns it normalized: names trimmed, node
/// configs with defaults applied and every edge port resolved.
pub fn validate_definition(catalog: &Catalog, definition: &WorkflowDefinition) -> Result<WorkflowDefinition> {
    info!(
        "Validating workflow '{}' with {} nodes",
        definition.name,
        definition.nodes.len()
    );

    let name = definition.name.trim();
    if name.is_empty() {
        return Err(Error::Validation("workflow name must not be empty".to_string()));
    }
    if definition.nodes.is_empty() {
        return Err(Error::InvalidGraph(GraphError::EmptyWorkflow.to_string()));
    }

    let mut errors = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut types: HashMap<&str, &NodeType> = HashMap::new();

    for node in &definition.nodes {
        if node.id.trim().is_empty() {
            errors.push(GraphError::EmptyNodeId);
            continue;
        }
        if !seen.insert(node.id.as_str()) {
            errors.push(GraphError::DuplicateNodeId(node.id.clone()));
            continue;
        }
        match catalog.node_type(&node.node_type) {
            Some(node_type) => {
                types.insert(node.id.as_str(), node_type);
            }
            None => errors.push(GraphError::UnknownNodeType {
                node: node.id.clone(),
                node_type: node.node_type.clone(),
            }),
        }
    }

    let mut edges = Vec::with_capacity(definition.edges.len());
    for edge in &definition.edges {
        if edge.from == edge.to {
            errors.push(GraphError::SelfLoop(edge.from.clone()));
            continue;
        }
        let mut known = true;
        for end in [&edge.from, &edge.to] {
            if !seen.contains(end.as_str()) {
                errors.push(GraphError::UnknownNode {
                    edge: edge_label(edge),
                    node: end.clone(),
                });
                known = false;
            }
        }
        if !known {
            continue;
        }
        // Port checks need both node types
        let (Some(from), Some(to)) = (types.get(edge.from.as_str()), types.get(edge.to.as_str())) else {
            continue;
        };
        match resolve_ports(edge, from, to) {
            Ok(resolved) => edges.push(resolved),
            Err(detail) => errors.push(GraphError::IncompatiblePorts {
                edge: edge_label(edge),
                detail,
            }),
        }
    }

    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(Error::InvalidGraph(messages.join("; ")));
    }

    let order = topological_order(&definition.nodes, &edges)?;
    debug!("Topological order: {:?}", order);

    let mut nodes = Vec::with_capacity(definition.nodes.len());
    let mut config_errors = Vec::new();
    for node in &definition.nodes {
        let Some(node_type) = types.get(node.id.as_str()) else {
            continue;
        };
        match validate_config(&node_type.fields, &Value::Object(node.config.clone())) {
            Ok(config) => nodes.push(NodeDefinition {
                config,
                ..node.clone()
            }),
            Err(Error::Validation(message)) => {
                config_errors.push(format!("node '{}': {}", node.id, message))
            }
            Err(e) => return Err(e),
        }
    }
    if !config_errors.is_empty() {
        return Err(Error::Validation(config_errors.join("; ")));
    }

    info!("Workflow '{}' validated: {} nodes, {} edges", name, nodes.len(), edges.len());
    Ok(WorkflowDefinition {
        name: name.to_string(),
        description: definition.description.trim().to_string(),
        nodes,
        edges,
    })
}

/// Fills in missing edge ports and checks them against the node types.
///
/// An unspecified port takes the same type as the other end when that
/// type is available, otherwise the first type both nodes share.
fn resolve_ports(edge: &Edge, from: &NodeType, to: &NodeType) -> std::result::Result<Edge, String> {
    if from.outputs.is_empty() {
        return Err(format!("'{}' ({}) produces no output", edge.from, from.id));
    }
    if to.inputs.is_empty() {
        return Err(format!("'{}' ({}) takes no input", edge.to, to.id));
    }

    let from_port = match &edge.from_port {
        Some(port) if from.outputs.contains(port) => port.clone(),
        Some(port) => return Err(format!("'{}' has no output port '{}'", edge.from, port)),
        None => edge
            .to_port
            .clone()
            .filter(|port| from.outputs.contains(port))
            .or_else(|| from.outputs.iter().find(|port| to.inputs.contains(port)).cloned())
            .ok_or_else(|| format!("'{}' and '{}' share no port type", edge.from, edge.to))?,
    };

    let to_port = match &edge.to_port {
        Some(port) if to.inputs.contains(port) => port.clone(),
        Some(port) => return Err(format!("'{}' has no input port '{}'", edge.to, port)),
        None if to.inputs.contains(&from_port) => from_port.clone(),
        None => {
            return Err(format!(
                "'{}' cannot accept the '{}' output of '{}'",
                edge.to, from_port, edge.from
            ))
        }
    };

    Ok(Edge {
        from: edge.from.clone(),
        to: edge.to.clone(),
        from_port: Some(from_port),
        to_port: Some(to_port),
    })
}

/// Orders node ids so that every node comes after its dependencies.
///
/// Uses Kahn's algorithm; nodes that become ready together keep their
/// definition order. Fails with [`Error::InvalidGraph`] on a cycle.
pub fn topological_order(nodes: &[NodeDefinition], edges: &[Edge]) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for edge in edges {
        if let Some(degree) = in_degree.get_mut(edge.to.as_str()) {
            *degree += 1;
        }
    }

    let mut queue: VecDeque<&str> = nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let mut ready = Vec::new();
        for edge in edges.iter().filter(|e| e.from == current) {
            if let Some(degree) = in_degree.get_mut(edge.to.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(edge.to.as_str());
                }
            }
        }
        // Definition order among siblings
        ready.sort_by_key(|id| nodes.iter().position(|n| n.id == *id));
        queue.extend(ready);
    }

    if order.len() != nodes.len() {
        return Err(Error::InvalidGraph(GraphError::CyclicDependency.to_string()));
    }
    Ok(order)
}
