//! Orchestrator Settings
//!
//! Settings are read from a YAML file; every field has a default so an
//! empty file (or no file at all) yields a working local setup.
//!
//! ```yaml
//! bind: 0.0.0.0:8080
//! data_dir: /var/lib/scanrunner
//! max_running_tasks: 4
//! queue_when_busy: true
//! tools:
//!   scanner:
//!     binary: xmap
//!     launcher: [docker, exec, ipv6-xmap]
//!   grabber:
//!     binary: zgrab2
//! ```
//!
//! # Tool Binary Resolution
//!
//! A bare binary name is resolved in the following order:
//! 1. Next to the scanrunner executable
//! 2. System PATH
//! 3. Left as-is (spawning then reports a process fault)

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::FailurePolicy;
use crate::task::ToolKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// How one external tool is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Binary name or path.
    pub binary: String,
    /// Argv prefix placed before the binary, e.g. `[docker, exec, ipv6-xmap]`.
    pub launcher: Vec<String>,
    /// Extra environment variables for the process.
    pub env: BTreeMap<String, String>,
    /// Working directory; defaults to the orchestrator's.
    pub working_dir: Option<PathBuf>,
}

impl ToolSettings {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            launcher: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Returns the program to exec and the arguments that precede the
    /// tool's own arguments.
    pub fn program(&self) -> (String, Vec<String>) {
        match self.launcher.split_first() {
            Some((first, rest)) => {
                let mut prefix = rest.to_vec();
                prefix.push(self.binary.clone());
                (first.clone(), prefix)
            }
            None => (resolve_binary(&self.binary), Vec::new()),
        }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self::new("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsSettings {
    pub scanner: ToolSettings,
    pub grabber: ToolSettings,
}

impl Default for ToolsSettings {
    fn default() -> Self {
        Self {
            scanner: ToolSettings::new("xmap"),
            grabber: ToolSettings::new("zgrab2"),
        }
    }
}

impl ToolsSettings {
    pub fn get(&self, kind: ToolKind) -> &ToolSettings {
        match kind {
            ToolKind::Scanner => &self.scanner,
            ToolKind::Grabber => &self.grabber,
        }
    }
}

/// Top-level orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the HTTP API listens on.
    pub bind: String,
    /// Root for persisted records and artifacts. `None` keeps everything in
    /// memory apart from artifacts, which go to a temporary directory.
    pub data_dir: Option<PathBuf>,
    /// Global cap on concurrently running Tasks.
    pub max_running_tasks: usize,
    /// Queue Tasks over the cap instead of rejecting them.
    pub queue_when_busy: bool,
    /// Default per-Execution cap on running Nodes.
    pub max_running_nodes: usize,
    /// Default failure policy for new Executions.
    pub failure_policy: FailurePolicy,
    /// Seconds between SIGTERM and SIGKILL when cancelling a process.
    pub kill_grace_secs: u64,
    /// Wall-clock budget after which the watchdog cancels a running Task.
    pub task_timeout_secs: Option<u64>,
    /// Extra workflow templates loaded at startup.
    pub templates_file: Option<PathBuf>,
    pub tools: ToolsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            data_dir: None,
            max_running_tasks: num_cpus::get().max(1),
            queue_when_busy: true,
            max_running_nodes: 4,
            failure_policy: FailurePolicy::FailFast,
            kill_grace_secs: 5,
            task_timeout_secs: None,
            templates_file: None,
            tools: ToolsSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading settings: {}", path.display());

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let settings = Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;

        Ok(settings)
    }

    /// Parses settings from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes as null
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let settings: Settings =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_running_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_running_tasks must be at least 1".to_string(),
            ));
        }
        if self.max_running_nodes == 0 {
            return Err(ConfigError::Invalid(
                "max_running_nodes must be at least 1".to_string(),
            ));
        }
        for (name, tool) in [("scanner", &self.tools.scanner), ("grabber", &self.tools.grabber)] {
            if tool.binary.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "tools.{}.binary must not be empty",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

/// Resolves a bare binary name to a full path where possible.
fn resolve_binary(binary: &str) -> String {
    let path = Path::new(binary);
    if path.components().count() > 1 || path.is_absolute() {
        return binary.to_string();
    }

    // Bundled next to our own executable
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let bundled = exe_dir.join(binary);
        if bundled.is_file() {
            debug!("Using bundled {}: {}", binary, bundled.display());
            return bundled.to_string_lossy().into_owned();
        }
    }

    // System PATH
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(binary);
            if candidate.is_file() {
                debug!("Using system {}: {}", binary, candidate.display());
                return candidate.to_string_lossy().into_owned();
            }
        }
    }

    binary.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.max_running_tasks >= 1);
        assert!(settings.queue_when_busy);
        assert_eq!(settings.max_running_nodes, 4);
        assert_eq!(settings.tools.scanner.binary, "xmap");
        assert_eq!(settings.tools.grabber.binary, "zgrab2");
    }

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let settings = Settings::from_yaml("").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
bind: 0.0.0.0:9000
max_running_tasks: 2
failure_policy: continue
tools:
  scanner:
    binary: /opt/xmap/bin/xmap
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.bind, "0.0.0.0:9000");
        assert_eq!(settings.max_running_tasks, 2);
        assert_eq!(settings.failure_policy, FailurePolicy::Continue);
        assert_eq!(settings.tools.scanner.binary, "/opt/xmap/bin/xmap");
        assert_eq!(settings.tools.grabber.binary, "zgrab2");
    }

    #[test]
    fn test_zero_cap_rejected() {
        let result = Settings::from_yaml("max_running_tasks: 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_yaml_rejected() {
        let result = Settings::from_yaml("max_running_tasks: [oops");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_launcher_program() {
        let tool = ToolSettings {
            launcher: vec!["docker".into(), "exec".into(), "ipv6-xmap".into()],
            ..ToolSettings::new("xmap")
        };
        let (program, prefix) = tool.program();
        assert_eq!(program, "docker");
        assert_eq!(prefix, vec!["exec", "ipv6-xmap", "xmap"]);
    }

    #[test]
    fn test_absolute_binary_is_kept() {
        let tool = ToolSettings::new("/usr/local/bin/zgrab2");
        let (program, prefix) = tool.program();
        assert_eq!(program, "/usr/local/bin/zgrab2");
        assert!(prefix.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Settings::load("/nonexistent/scanrunner.yaml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
