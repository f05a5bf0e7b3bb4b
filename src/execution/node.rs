//! Node Evaluation
//!
//! Turns a ready node into work:
//!
//! - `file_input` resolves its file and completes at once
//! - `xmap_scan` / `zgrab2_scan` become a Task request
//! - the extract nodes and `file_output` run in-process on a blocking
//!   thread and write a new artifact
//!
//! Every node output is a JSON object with at least `type` and `fileRef`.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use log::{debug, warn};
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::artifact::{ArtifactStore, FileRef};
use crate::error::{Error, Result};
use crate::task::{Task, TaskRequest, ToolKind};
use crate::workflow::{NodeDefinition, Workflow};

use super::model::Execution;

/// The behaviours a node type maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    FileInput,
    Scan(ToolKind),
    XmapExtract,
    ZgrabExtract,
    CustomExtract,
    FileOutput,
}

impl NodeKind {
    pub fn of(node_type: &str) -> Option<Self> {
        match node_type {
            "file_input" => Some(Self::FileInput),
            "xmap_scan" => Some(Self::Scan(ToolKind::Scanner)),
            "zgrab2_scan" => Some(Self::Scan(ToolKind::Grabber)),
            "xmap_json_extract" => Some(Self::XmapExtract),
            "zgrab2_json_extract" => Some(Self::ZgrabExtract),
            "json_custom_extract" => Some(Self::CustomExtract),
            "file_output" => Some(Self::FileOutput),
            _ => None,
        }
    }
}

/// Inputs of a node: upstream outputs keyed by target port (`default`
/// when the edge names none), or the Execution params for a root node.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct NodeInputs(Map<String, Value>);

impl NodeInputs {
    pub fn gather(workflow: &Workflow, execution: &Execution, node_id: &str) -> Self {
        let mut inputs = Map::new();
        let mut has_edges = false;
        for edge in workflow.incoming(node_id) {
            has_edges = true;
            let output = execution
                .node(&edge.from)
                .and_then(|state| state.output.clone());
            if let Some(output) = output {
                let port = edge.to_port.clone().unwrap_or_else(|| "default".to_string());
                inputs.insert(port, output);
            }
        }
        if !has_edges {
            inputs = execution.params.clone();
        }
        Self(inputs)
    }

    /// The first input file found on `default`, then on `ports` in order.
    /// A root node may also name the file directly as `fileRef`.
    pub fn file(&self, ports: &[&str]) -> Result<Option<FileRef>> {
        let candidates = std::iter::once("default")
            .chain(ports.iter().copied())
            .filter_map(|port| self.0.get(port))
            .filter_map(|value| value.get("fileRef"))
            .chain(self.0.get("fileRef"));

        for raw in candidates {
            if let Some(raw) = raw.as_str() {
                return Ok(Some(FileRef::parse(raw)?));
            }
        }
        Ok(None)
    }
}

/// What the engine has to do to run a node.
pub(crate) enum NodeAction {
    /// The node completed immediately with this output.
    Complete(Value),
    /// Create a Task for the node.
    RunTask(TaskRequest),
    /// Run an in-process transform on a blocking thread.
    RunInline(InlineJob),
}

/// Decides how to run a node. Errors here fail the node.
pub(crate) fn prepare(
    node: &NodeDefinition,
    inputs: &NodeInputs,
    params: &Map<String, Value>,
    artifacts: &Arc<dyn ArtifactStore>,
) -> Result<NodeAction> {
    let kind = NodeKind::of(&node.node_type).ok_or_else(|| {
        Error::Validation(format!("node type '{}' cannot be executed", node.node_type))
    })?;

    match kind {
        NodeKind::FileInput => {
            let raw = text(&node.config, "fileRef")
                .or_else(|| params.get("fileRef").and_then(Value::as_str))
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "node '{}' needs a fileRef in its config or the execution params",
                        node.id
                    ))
                })?;
            let file = FileRef::parse(raw)?;
            if !artifacts.exists(&file) {
                return Err(Error::Validation(format!("input file '{}' does not exist", file)));
            }
            Ok(NodeAction::Complete(json!({
                "type": "file",
                "fileRef": file,
                "fileType": text(&node.config, "fileType").unwrap_or("txt"),
            })))
        }
        NodeKind::Scan(tool) => {
            let mut config = node.config.clone();
            let description = config
                .remove("description")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{} node {}", node.node_type, node.id));

            let mut request = TaskRequest::new(tool, Value::Object(config))
                .with_description(description)
                .queue(true);
            if let Some(file) = inputs.file(&["file"])? {
                request = request.with_input(file);
            }
            Ok(NodeAction::RunTask(request))
        }
        _ => {
            let input = inputs.file(&["result_file", "file"])?.ok_or_else(|| {
                Error::Validation(format!("node '{}' has no input file", node.id))
            })?;
            Ok(NodeAction::RunInline(InlineJob {
                kind,
                node_id: node.id.clone(),
                config: node.config.clone(),
                input,
                artifacts: Arc::clone(artifacts),
            }))
        }
    }
}

/// Output of a scan node whose Task completed.
pub(crate) fn task_output(task: &Task) -> Value {
    json!({
        "type": "result_file",
        "taskId": task.id,
        "fileRef": task.result_file_ref,
        "toolKind": task.tool_kind,
    })
}

/// Stored files named in the node configs or the Execution params, under
/// `fileRef`, `*FileRef` or `*FileRefs` keys at any depth.
pub(crate) fn referenced_files(workflow: &Workflow, params: &Map<String, Value>) -> Vec<FileRef> {
    let mut files = BTreeSet::new();
    for node in &workflow.nodes {
        collect_refs(&node.config, &mut files);
    }
    collect_refs(params, &mut files);
    files.into_iter().collect()
}

fn collect_refs(map: &Map<String, Value>, files: &mut BTreeSet<FileRef>) {
    for (key, value) in map {
        let names_ref = key == "fileRef" || key.ends_with("FileRef") || key.ends_with("FileRefs");
        match value {
            Value::String(raw) if names_ref => files.extend(FileRef::parse(raw).ok()),
            Value::Array(items) if names_ref => files.extend(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|raw| FileRef::parse(raw).ok()),
            ),
            Value::Object(inner) => collect_refs(inner, files),
            _ => {}
        }
    }
}

fn text<'a>(config: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn flag(config: &Map<String, Value>, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// An in-process transform of one input artifact into a new one.
pub(crate) struct InlineJob {
    kind: NodeKind,
    node_id: String,
    config: Map<String, Value>,
    input: FileRef,
    artifacts: Arc<dyn ArtifactStore>,
}

impl InlineJob {
    /// Runs the transform. Blocks on file I/O.
    pub fn run(self) -> Result<Value> {
        debug!("Node {} reading {}", self.node_id, self.input);
        match self.kind {
            NodeKind::FileOutput => self.publish(),
            _ => {
                let records = read_records(&self.artifacts, &self.input)?;
                let format = text(&self.config, "outputFormat").unwrap_or("txt").to_string();
                let (count, body) = match self.kind {
                    NodeKind::XmapExtract => xmap_extract(&self.config, &records, &format),
                    NodeKind::ZgrabExtract => zgrab_extract(&self.config, &records, &format),
                    _ => custom_extract(&self.config, &records, &format)?,
                };
                let base = text(&self.config, "fileName").unwrap_or(self.node_id.as_str());
                let file = self
                    .artifacts
                    .put(&format!("{}.{}", base, format), body.as_bytes())?;
                Ok(json!({
                    "type": "file",
                    "fileRef": file,
                    "fileType": format,
                    "count": count,
                }))
            }
        }
    }

    /// Copies the input under the configured file name.
    fn publish(self) -> Result<Value> {
        let file_name = text(&self.config, "fileName")
            .unwrap_or(self.node_id.as_str())
            .to_string();
        let extension = match text(&self.config, "fileType") {
            Some("auto") | None => self
                .input
                .as_str()
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_string()),
            Some(ext) => Some(ext.to_string()),
        };
        let name = match &extension {
            Some(ext) if !file_name.ends_with(&format!(".{}", ext)) => {
                format!("{}.{}", file_name, ext)
            }
            _ => file_name.clone(),
        };

        let source = self.artifacts.path(&self.input)?;
        let (file, target) = self.artifacts.reserve(&name)?;
        if let Err(e) = fs::copy(&source, &target) {
            let _ = self.artifacts.delete(&file);
            return Err(e.into());
        }

        let mut output = json!({
            "type": "output",
            "fileRef": file,
            "fileName": name,
        });
        if let Some(description) = text(&self.config, "description") {
            output["description"] = json!(description);
        }
        Ok(output)
    }
}

/// Reads JSON records from an artifact: either one JSON array or one
/// object per line. Lines that are not JSON are skipped.
fn read_records(artifacts: &Arc<dyn ArtifactStore>, file: &FileRef) -> Result<Vec<Value>> {
    let handle = artifacts.open(file)?;
    let mut reader = BufReader::new(handle);

    let mut first = String::new();
    while first.trim().is_empty() {
        if reader.read_line(&mut first)? == 0 {
            return Ok(Vec::new());
        }
    }

    if first.trim_start().starts_with('[') {
        let mut rest = String::new();
        std::io::Read::read_to_string(&mut reader, &mut rest)?;
        let all: Value = serde_json::from_str(&(first + &rest))
            .map_err(|e| Error::Validation(format!("'{}' is not valid JSON: {}", file, e)))?;
        return Ok(match all {
            Value::Array(items) => items,
            other => vec![other],
        });
    }

    let mut records = Vec::new();
    let mut skipped = 0;
    for line in std::iter::once(Ok(first)).chain(reader.lines()) {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("Skipped {} malformed lines in {}", skipped, file);
    }
    Ok(records)
}

/// Keeps the first occurrence of every value.
fn dedup(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|v| !v.is_empty() && seen.insert(v.clone()))
        .collect()
}

fn render_lines(lines: &[String], format: &str) -> String {
    if format == "txt" {
        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        body
    } else {
        pretty(&json!(lines))
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn field<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str).map(str::trim)
}

fn xmap_success(record: &Value) -> bool {
    match record.get("success") {
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s == "1",
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

fn addresses_of(record: &Value) -> Vec<String> {
    ["outersaddr", "saddr"]
        .into_iter()
        .filter_map(|key| field(record, key).map(str::to_string))
        .collect()
}

/// Responding addresses from xmap JSON results.
fn xmap_extract(config: &Map<String, Value>, records: &[Value], format: &str) -> (usize, String) {
    let success_only = flag(config, "successOnly", true);
    let kept = records
        .iter()
        .filter(|record| !success_only || xmap_success(record));

    let addresses = match text(config, "extractType").unwrap_or("outersaddr") {
        "all_addresses" => dedup(records.iter().flat_map(addresses_of)),
        "successful_addresses" => dedup(kept.flat_map(addresses_of)),
        _ => dedup(kept.filter_map(|record| field(record, "outersaddr").map(str::to_string))),
    };

    (addresses.len(), render_lines(&addresses, format))
}

/// Modules of a zgrab2 record and the status each reported.
fn zgrab_modules(record: &Value) -> Vec<(String, String)> {
    record
        .get("data")
        .and_then(Value::as_object)
        .map(|data| {
            data.iter()
                .map(|(module, result)| {
                    let status = result
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    (module.clone(), status.to_string())
                })
                .collect()
        })
        .unwrap_or_default()
}

fn zgrab_success(record: &Value) -> bool {
    zgrab_modules(record)
        .iter()
        .any(|(_, status)| status == "success")
}

/// Hosts and services from zgrab2 JSON results.
fn zgrab_extract(config: &Map<String, Value>, records: &[Value], format: &str) -> (usize, String) {
    let success_only = flag(config, "successOnly", true);
    let include_metadata = flag(config, "includeMetadata", false);

    let hosts: Vec<(&str, &Value)> = records
        .iter()
        .filter_map(|record| field(record, "ip").map(|ip| (ip, record)))
        .collect();

    let mut lines = Vec::new();
    let mut data = Vec::new();
    match text(config, "extractType").unwrap_or("successful_ips") {
        "service_info" => {
            for (ip, record) in &hosts {
                for (module, status) in zgrab_modules(record) {
                    if success_only && status != "success" {
                        continue;
                    }
                    lines.push(format!("{}\t{}\t{}", ip, module, status));
                    data.push(json!({"ip": ip, "module": module, "status": status}));
                }
            }
        }
        "full_results" => {
            for (_, record) in &hosts {
                if !success_only || zgrab_success(record) {
                    lines.push(record.to_string());
                    data.push((*record).clone());
                }
            }
        }
        _ => {
            let ips = dedup(
                hosts
                    .iter()
                    .filter(|(_, record)| !success_only || zgrab_success(record))
                    .map(|(ip, _)| ip.to_string()),
            );
            data = ips.iter().map(|ip| json!(ip)).collect();
            lines = ips;
        }
    }

    let count = data.len();
    if format == "txt" {
        return (count, render_lines(&lines, "txt"));
    }
    let body = if include_metadata {
        let succeeded = hosts.iter().filter(|(_, record)| zgrab_success(record)).count();
        pretty(&json!({
            "summary": {
                "total": records.len(),
                "successful": succeeded,
                "failed": hosts.len() - succeeded,
            },
            "results": data,
        }))
    } else {
        pretty(&Value::Array(data))
    };
    (count, body)
}

/// Looks up a dotted path; numeric segments index into arrays.
fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

enum Criterion {
    Equals(String),
    Matches(Regex),
}

/// Selected fields of the records matching every filter entry.
fn custom_extract(config: &Map<String, Value>, records: &[Value], format: &str) -> Result<(usize, String)> {
    let paths: Vec<String> = config
        .get("fieldPaths")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let use_regex = flag(config, "useRegex", false);

    let mut criteria = Vec::new();
    if let Some(filter) = config.get("filterCriteria").and_then(Value::as_object) {
        for (path, expected) in filter {
            let expected = plain(expected);
            let criterion = if use_regex {
                Regex::new(&expected).map(Criterion::Matches).map_err(|e| {
                    Error::Validation(format!("filter for '{}' is not a valid regex: {}", path, e))
                })?
            } else {
                Criterion::Equals(expected)
            };
            criteria.push((path.clone(), criterion));
        }
    }

    let matching: Vec<&Value> = records
        .iter()
        .filter(|record| {
            criteria.iter().all(|(path, criterion)| {
                let Some(actual) = lookup(record, path).map(plain) else {
                    return false;
                };
                match criterion {
                    Criterion::Equals(expected) => actual == *expected,
                    Criterion::Matches(regex) => regex.is_match(&actual),
                }
            })
        })
        .collect();

    let rows: Vec<Value> = if paths.is_empty() {
        matching.iter().map(|record| (*record).clone()).collect()
    } else {
        matching
            .iter()
            .map(|record| {
                let row: Map<String, Value> = paths
                    .iter()
                    .map(|path| (path.clone(), lookup(record, path).cloned().unwrap_or(Value::Null)))
                    .collect();
                Value::Object(row)
            })
            .collect()
    };

    let count = rows.len();
    let body = match format {
        "csv" => {
            let mut lines = Vec::with_capacity(rows.len() + 1);
            if !paths.is_empty() {
                lines.push(paths.iter().map(|p| csv_cell(p)).collect::<Vec<_>>().join(","));
            }
            for row in &rows {
                let cells: Vec<String> = if paths.is_empty() {
                    vec![csv_cell(&row.to_string())]
                } else {
                    paths.iter().map(|p| csv_cell(&plain(&row[p.as_str()]))).collect()
                };
                lines.push(cells.join(","));
            }
            lines.join("\n") + "\n"
        }
        "txt" => {
            let lines: Vec<String> = rows
                .iter()
                .map(|row| {
                    if paths.is_empty() {
                        row.to_string()
                    } else {
                        paths
                            .iter()
                            .map(|p| plain(&row[p.as_str()]))
                            .collect::<Vec<_>>()
                            .join("\t")
                    }
                })
                .collect();
            render_lines(&lines, "txt")
        }
        _ => pretty(&Value::Array(rows)),
    };

    Ok((count, body))
}
