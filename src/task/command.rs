//! Scan Tool Command Lines
//!
//! Turns a validated tool config into the argv of one xmap or zgrab2 run.
//! Field-level checks (types, ranges, forbidden characters) happen in the
//! catalog schema; this module adds the checks that span several fields or
//! depend on the input files.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::ToolKind;
use crate::artifact::FileRef;
use crate::catalog::Catalog;
use crate::error::{Error, Result};

static PORT_SPEC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(-\d+)?(,\d+(-\d+)?)*$").expect("valid port regex"));

static MAC_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("valid MAC regex")
});

static FLAG_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("valid flag regex"));

/// zgrab2 flags the orchestrator sets itself.
const RESERVED_GRABBER_FLAGS: &[&str] = &[
    "f",
    "o",
    "l",
    "c",
    "input-file",
    "output-file",
    "log-file",
    "config-file",
    "port",
];

/// Files a command line refers to.
#[derive(Debug, Clone)]
pub struct CommandPaths {
    pub inputs: Vec<PathBuf>,
    pub result: PathBuf,
    /// zgrab2 multiple-module INI file.
    pub config_file: Option<PathBuf>,
}

/// Checks the parts of a config that depend on other fields or on the
/// number of input files. Runs before any artifact is allocated.
pub fn check(kind: ToolKind, config: &Map<String, Value>, input_count: usize) -> Result<()> {
    match kind {
        ToolKind::Scanner => check_scanner(config, input_count),
        ToolKind::Grabber => check_grabber(config, input_count),
    }
}

/// Builds the tool arguments (without the program itself).
pub fn build_args(kind: ToolKind, config: &Map<String, Value>, paths: &CommandPaths) -> Result<Vec<String>> {
    check(kind, config, paths.inputs.len())?;
    match kind {
        ToolKind::Scanner => Ok(scanner_args(config, paths)),
        ToolKind::Grabber => grabber_args(config, paths),
    }
}

/// The artifact a grabber config points at, if any.
pub fn config_file_ref(config: &Map<String, Value>) -> Result<Option<FileRef>> {
    match text(config, "configFileRef") {
        Some(raw) => Ok(Some(FileRef::parse(raw)?)),
        None => Ok(None),
    }
}

fn text<'a>(config: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn integer(config: &Map<String, Value>, key: &str) -> Option<i64> {
    config.get(key).and_then(Value::as_i64)
}

fn is_ipv4(config: &Map<String, Value>) -> bool {
    text(config, "protocol") == Some("ipv4")
}

fn check_scanner(config: &Map<String, Value>, input_count: usize) -> Result<()> {
    let mut errors = Vec::new();
    let ipv4 = is_ipv4(config);

    if input_count > 1 {
        errors.push("xmap accepts at most one whitelist file".to_string());
    }
    if input_count == 0 && text(config, "targetaddress").is_none() {
        errors.push("xmap needs a whitelist file or 'targetaddress'".to_string());
    }

    if let Some(target) = text(config, "targetaddress") {
        if let Err(e) = check_target(target, ipv4) {
            errors.push(e);
        }
    }

    if let Some(ports) = text(config, "targetPort") {
        let in_range = ports
            .split([',', '-'])
            .all(|p| p.parse::<u32>().is_ok_and(|n| n <= 65535));
        if !PORT_SPEC.is_match(ports) || !in_range {
            errors.push(format!("'targetPort' is not a valid port list: {}", ports));
        }
    }

    if let Some(mac) = text(config, "gatewayMac") {
        if !MAC_ADDRESS.is_match(mac) {
            errors.push(format!("'gatewayMac' is not a MAC address: {}", mac));
        }
    }

    if let Some(source) = text(config, "sourceIp") {
        match source.parse::<IpAddr>() {
            Ok(addr) if addr.is_ipv4() != ipv4 => {
                errors.push(format!("'sourceIp' {} does not match the protocol", source))
            }
            Ok(_) => {}
            Err(_) => errors.push(format!("'sourceIp' is not an IP address: {}", source)),
        }
    }

    if ipv4 && integer(config, "maxlen").is_some_and(|n| n > 32) {
        errors.push("'maxlen' must be at most 32 for IPv4".to_string());
    }

    finish(errors)
}

/// Accepts an address or a prefix of the scanned protocol.
fn check_target(target: &str, ipv4: bool) -> std::result::Result<(), String> {
    let (address, prefix) = match target.split_once('/') {
        Some((address, prefix)) => (address, Some(prefix)),
        None => (target, None),
    };
    let addr: IpAddr = address
        .parse()
        .map_err(|_| format!("'targetaddress' is not an address or prefix: {}", target))?;
    if addr.is_ipv4() != ipv4 {
        return Err(format!("'targetaddress' {} does not match the protocol", target));
    }
    if let Some(prefix) = prefix {
        let max = if ipv4 { 32 } else { 128 };
        if !prefix.parse::<u32>().is_ok_and(|p| p <= max) {
            return Err(format!("'targetaddress' has an invalid prefix length: {}", target));
        }
    }
    Ok(())
}

fn check_grabber(config: &Map<String, Value>, input_count: usize) -> Result<()> {
    let mut errors = Vec::new();

    if input_count != 1 {
        errors.push(format!(
            "zgrab2 needs exactly one input file, got {}",
            input_count
        ));
    }

    if text(config, "scanMode") == Some("multiple") {
        if text(config, "configFileRef").is_none() {
            errors.push("multiple-module scans need 'configFileRef'".to_string());
        }
    } else if let Err(e) = additional_flags(config) {
        errors.push(e);
    }

    finish(errors)
}

fn finish(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errors.join("; ")))
    }
}

/// Formats the bandwidth in Mbps, without a fraction when it is whole.
fn bandwidth(rate: f64) -> String {
    if rate.fract() == 0.0 {
        format!("{}M", rate as i64)
    } else {
        format!("{}M", rate)
    }
}

fn scanner_args(config: &Map<String, Value>, paths: &CommandPaths) -> Vec<String> {
    let mut args = Vec::new();
    args.push(if is_ipv4(config) { "-4" } else { "-6" }.to_string());

    if let Some(maxlen) = integer(config, "maxlen") {
        args.extend(["-x".to_string(), maxlen.to_string()]);
    }
    if let Some(rate) = config.get("rate").and_then(Value::as_f64) {
        args.extend(["-B".to_string(), bandwidth(rate)]);
    }
    if let Some(ports) = text(config, "targetPort") {
        args.extend(["-p".to_string(), ports.to_string()]);
    }
    if let Some(module) = text(config, "probeModule") {
        args.extend(["-M".to_string(), module.to_string()]);
    }
    if let Some(max) = integer(config, "maxResults").filter(|n| *n > 0) {
        args.extend(["-N".to_string(), max.to_string()]);
    }
    if let Some(interface) = text(config, "interface") {
        args.extend(["-i".to_string(), interface.to_string()]);
    }
    if let Some(source) = text(config, "sourceIp") {
        args.extend(["-S".to_string(), source.to_string()]);
    }
    if let Some(mac) = text(config, "gatewayMac") {
        args.extend(["-G".to_string(), mac.to_string()]);
    }
    if let Some(whitelist) = paths.inputs.first() {
        args.extend(["-w".to_string(), path_arg(whitelist)]);
    }
    args.extend([
        "-o".to_string(),
        path_arg(&paths.result),
        "-O".to_string(),
        "json".to_string(),
    ]);
    if let Some(target) = text(config, "targetaddress") {
        args.push(target.to_string());
    }
    args
}

fn grabber_args(config: &Map<String, Value>, paths: &CommandPaths) -> Result<Vec<String>> {
    let input = paths
        .inputs
        .first()
        .ok_or_else(|| Error::Validation("zgrab2 needs an input file".to_string()))?;
    let mut args = Vec::new();

    if text(config, "scanMode") == Some("multiple") {
        let ini = paths.config_file.as_ref().ok_or_else(|| {
            Error::Validation("multiple-module scans need 'configFileRef'".to_string())
        })?;
        args.extend(["multiple".to_string(), "-c".to_string(), path_arg(ini)]);
        args.extend(["-f".to_string(), path_arg(input)]);
        args.extend(["-o".to_string(), path_arg(&paths.result)]);
        args.extend(global_flags(config));
        return Ok(args);
    }

    let module = text(config, "module").unwrap_or("http");
    let port = integer(config, "port")
        .or_else(|| Catalog::grabber_default_port(module).map(i64::from))
        .unwrap_or(80);

    args.extend([
        module.to_string(),
        "--port".to_string(),
        port.to_string(),
        "-f".to_string(),
        path_arg(input),
        "-o".to_string(),
        path_arg(&paths.result),
    ]);
    if let Some(timeout) = integer(config, "timeout") {
        args.push(format!("--timeout={}s", timeout));
    }
    args.extend(global_flags(config));
    args.extend(additional_flags(config).map_err(Error::Validation)?);
    Ok(args)
}

fn global_flags(config: &Map<String, Value>) -> Vec<String> {
    [
        ("senders", "senders"),
        ("connectionsPerHost", "connections-per-host"),
        ("readLimitPerHost", "read-limit-per-host"),
    ]
    .into_iter()
    .filter_map(|(key, flag)| integer(config, key).map(|n| format!("--{}={}", flag, n)))
    .collect()
}

/// Parses `additionalParams`: one `key=value` (or bare `key`) per line.
fn additional_flags(config: &Map<String, Value>) -> std::result::Result<Vec<String>, String> {
    let Some(raw) = text(config, "additionalParams") else {
        return Ok(Vec::new());
    };

    let mut flags = Vec::new();
    for line in raw.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim().trim_start_matches("--"), Some(value.trim())),
            None => (line.trim_start_matches("--"), None),
        };
        if !FLAG_NAME.is_match(key) {
            return Err(format!("invalid zgrab2 parameter name '{}'", key));
        }
        if RESERVED_GRABBER_FLAGS.contains(&key) {
            return Err(format!("zgrab2 parameter '{}' is set by the orchestrator", key));
        }
        flags.push(match value {
            Some(value) if !value.is_empty() => format!("--{}={}", key, value),
            _ => format!("--{}", key),
        });
    }
    Ok(flags)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
