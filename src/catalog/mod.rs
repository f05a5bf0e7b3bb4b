//! Tool and Node Catalog
//!
//! Static metadata the rest of the system validates against:
//!
//! - [`ToolSchema`]: the config accepted by each external tool
//! - [`NodeType`]: the node types a workflow may use, with their ports
//! - [`WorkflowTemplate`]: ready-made workflow definitions
//!
//! The catalog is built once at startup and is read-only afterwards.

mod builtin;
pub mod schema;

pub use builtin::{XMAP_PROBE_MODULES, ZGRAB2_MODULES};
pub use schema::{validate_config, FieldKind, FieldSpec};

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::task::ToolKind;
use crate::workflow::validator::validate_definition;
use crate::workflow::WorkflowDefinition;

/// Config schema of one external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub kind: ToolKind,
    pub name: String,
    pub description: String,
    pub fields: Vec<FieldSpec>,
}

/// Grouping used by editors when listing node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeCategory {
    Input,
    Scan,
    Process,
    Output,
}

/// A node type that workflows may instantiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeType {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: NodeCategory,
    /// Port types this node accepts.
    pub inputs: Vec<String>,
    /// Port types this node produces.
    pub outputs: Vec<String>,
    pub fields: Vec<FieldSpec>,
    /// The tool a backing Task runs; `None` for nodes evaluated in-process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolKind>,
}

/// A reusable workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub definition: WorkflowDefinition,
}

fn default_category() -> String {
    "scan".to_string()
}

/// Registry of tool schemas, node types and workflow templates.
#[derive(Debug, Clone)]
pub struct Catalog {
    scanner: ToolSchema,
    grabber: ToolSchema,
    node_types: Vec<NodeType>,
    templates: Vec<WorkflowTemplate>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalog {
    /// The built-in catalog: xmap, zgrab2, their node types and templates.
    pub fn builtin() -> Self {
        Self {
            scanner: builtin::SCANNER_SCHEMA.clone(),
            grabber: builtin::GRABBER_SCHEMA.clone(),
            node_types: builtin::NODE_TYPES.clone(),
            templates: builtin::TEMPLATES.clone(),
        }
    }

    /// Adds the templates listed in a YAML file.
    ///
    /// Every template is validated against the node types; a template id
    /// that already exists replaces the earlier one.
    pub fn load_templates(&mut self, path: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let templates: Vec<WorkflowTemplate> =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let count = templates.len();
        for template in templates {
            validate_definition(self, &template.definition).map_err(|e| {
                ConfigError::Invalid(format!("template '{}': {}", template.id, e))
            })?;
            self.templates.retain(|t| t.id != template.id);
            self.templates.push(template);
        }

        info!("Loaded {} workflow templates from {}", count, path.display());
        Ok(count)
    }

    pub fn tool(&self, kind: ToolKind) -> &ToolSchema {
        match kind {
            ToolKind::Scanner => &self.scanner,
            ToolKind::Grabber => &self.grabber,
        }
    }

    pub fn tools(&self) -> Vec<&ToolSchema> {
        vec![&self.scanner, &self.grabber]
    }

    pub fn node_type(&self, id: &str) -> Option<&NodeType> {
        self.node_types.iter().find(|n| n.id == id)
    }

    pub fn node_types(&self) -> &[NodeType] {
        &self.node_types
    }

    pub fn template(&self, id: &str) -> Option<&WorkflowTemplate> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn templates(&self) -> &[WorkflowTemplate] {
        &self.templates
    }

    /// Default port of a zgrab2 module.
    pub fn grabber_default_port(module: &str) -> Option<u16> {
        ZGRAB2_MODULES
            .iter()
            .find(|(name, _)| *name == module)
            .map(|(_, port)| *port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_builtin_node_types() {
        let catalog = Catalog::builtin();
        for id in [
            "file_input",
            "xmap_scan",
            "zgrab2_scan",
            "xmap_json_extract",
            "zgrab2_json_extract",
            "json_custom_extract",
            "file_output",
        ] {
            assert!(catalog.node_type(id).is_some(), "missing node type {}", id);
        }
        assert_eq!(
            catalog.node_type("xmap_scan").unwrap().tool,
            Some(ToolKind::Scanner)
        );
        assert!(catalog.node_type("file_output").unwrap().tool.is_none());
    }

    #[test]
    fn test_tool_lookup() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.tool(ToolKind::Scanner).name, "xmap");
        assert_eq!(catalog.tool(ToolKind::Grabber).name, "zgrab2");
    }

    #[test]
    fn test_grabber_default_ports() {
        assert_eq!(Catalog::grabber_default_port("http"), Some(80));
        assert_eq!(Catalog::grabber_default_port("ssh"), Some(22));
        assert_eq!(Catalog::grabber_default_port("bacnet"), Some(47808));
        assert_eq!(Catalog::grabber_default_port("gopher"), None);
    }

    #[test]
    fn test_builtin_templates_are_valid() {
        let catalog = Catalog::builtin();
        assert!(catalog.template("xmap_zgrab2_basic").is_some());
        assert!(catalog.template("xmap_only_scan").is_some());
        for template in catalog.templates() {
            validate_definition(&catalog, &template.definition)
                .unwrap_or_else(|e| panic!("template {} invalid: {}", template.id, e));
        }
    }

    #[test]
    fn test_load_templates_from_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
- id: quick_ping
  name: Quick ping sweep
  tags: [xmap]
  definition:
    name: quick ping
    nodes:
      - id: xmap_1
        type: xmap_scan
        config:
          targetaddress: "2001:db8::/120"
"#
        )
        .unwrap();

        let mut catalog = Catalog::builtin();
        let before = catalog.templates().len();
        assert_eq!(catalog.load_templates(file.path()).unwrap(), 1);
        assert_eq!(catalog.templates().len(), before + 1);
        assert_eq!(catalog.template("quick_ping").unwrap().category, "scan");
    }

    #[test]
    fn test_load_invalid_template_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
- id: broken
  name: Broken
  definition:
    name: broken
    nodes:
      - id: a
        type: teleport
"#
        )
        .unwrap();

        let mut catalog = Catalog::builtin();
        let result = catalog.load_templates(file.path());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
