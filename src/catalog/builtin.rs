//! Built-in catalog tables.

use once_cell::sync::Lazy;
use serde_json::json;

use super::schema::{FieldKind, FieldSpec};
use super::{NodeCategory, NodeType, ToolSchema, WorkflowTemplate};
use crate::task::ToolKind;
use crate::workflow::{Edge, NodeDefinition, WorkflowDefinition};

/// zgrab2 scan modules and their default ports.
pub static ZGRAB2_MODULES: &[(&str, u16)] = &[
    ("amqp091", 5672),
    ("bacnet", 47808),
    ("banner", 80),
    ("dnp3", 20000),
    ("fox", 1911),
    ("ftp", 21),
    ("http", 80),
    ("imap", 143),
    ("ipp", 631),
    ("jarm", 443),
    ("modbus", 502),
    ("mongodb", 27017),
    ("mqtt", 1883),
    ("mssql", 1433),
    ("mysql", 3306),
    ("ntp", 123),
    ("oracle", 1521),
    ("pop3", 110),
    ("postgres", 5432),
    ("pptp", 1723),
    ("redis", 6379),
    ("siemens", 102),
    ("smb", 445),
    ("smtp", 25),
    ("socks5", 1080),
    ("ssh", 22),
    ("telnet", 23),
    ("tls", 443),
];

/// xmap probe modules.
pub static XMAP_PROBE_MODULES: &[&str] = &[
    "udp",
    "dnsx",
    "dnsa",
    "dnsae",
    "dnsan",
    "dnsane",
    "dnsane16",
    "dnsai",
    "dnsaie",
    "dnsap",
    "dnsape",
    "dnsaf",
    "dnsafe",
    "tcp_syn",
    "icmp_echo",
    "icmp_echo_gw",
    "icmp_echo_tmxd",
];

fn select(options: &[&str]) -> FieldKind {
    FieldKind::Select {
        options: options.iter().map(|o| o.to_string()).collect(),
    }
}

fn int_range(min: i64, max: Option<i64>) -> FieldKind {
    FieldKind::Integer {
        min: Some(min),
        max,
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub static SCANNER_SCHEMA: Lazy<ToolSchema> = Lazy::new(|| ToolSchema {
    kind: ToolKind::Scanner,
    name: "xmap".to_string(),
    description: "High-speed IPv6/IPv4 network scanner".to_string(),
    fields: vec![
        FieldSpec::new("protocol", "Protocol", select(&["ipv6", "ipv4"]))
            .with_default("ipv6")
            .describe("Scan IPv6 or IPv4 (one per scan)"),
        FieldSpec::new("targetaddress", "Target address", FieldKind::String)
            .describe("Address or prefix to scan, e.g. 2001:db8::/32"),
        FieldSpec::new("targetPort", "Target port", FieldKind::String)
            .with_default("80")
            .describe("Single port, list or range: 80,443,100-200"),
        FieldSpec::new(
            "rate",
            "Bandwidth (Mbps)",
            FieldKind::Number {
                min: Some(0.1),
                max: None,
            },
        )
        .with_default(1000),
        FieldSpec::new("maxResults", "Max results", int_range(0, None))
            .with_default(10000)
            .describe("Stop after this many results; 0 means unlimited"),
        FieldSpec::new("maxlen", "Max prefix length", int_range(1, Some(128))),
        FieldSpec::new("probeModule", "Probe module", select(XMAP_PROBE_MODULES))
            .with_default("icmp_echo"),
        FieldSpec::new("sourceIp", "Source address", FieldKind::String),
        FieldSpec::new("gatewayMac", "Gateway MAC", FieldKind::String),
        FieldSpec::new("interface", "Interface", FieldKind::String),
    ],
});

pub static GRABBER_SCHEMA: Lazy<ToolSchema> = Lazy::new(|| {
    let modules: Vec<&str> = ZGRAB2_MODULES.iter().map(|(name, _)| *name).collect();
    ToolSchema {
        kind: ToolKind::Grabber,
        name: "zgrab2".to_string(),
        description: "Application-layer banner grabber and fingerprinter".to_string(),
        fields: vec![
            FieldSpec::new("scanMode", "Scan mode", select(&["single", "multiple"]))
                .with_default("single"),
            FieldSpec::new("module", "Module", select(&modules)).with_default("http"),
            FieldSpec::new("port", "Port", int_range(1, Some(65535)))
                .describe("Leave empty for the module default"),
            FieldSpec::new("configFileRef", "Config file", FieldKind::File)
                .describe("INI file for multiple-module scans"),
            FieldSpec::new("timeout", "Timeout (s)", int_range(1, Some(300))).with_default(10),
            FieldSpec::new("senders", "Senders", int_range(1, Some(10000))).with_default(1000),
            FieldSpec::new("connectionsPerHost", "Connections per host", int_range(1, Some(10)))
                .with_default(1),
            FieldSpec::new("readLimitPerHost", "Read limit (KB)", int_range(1, Some(1024)))
                .with_default(96),
            FieldSpec::new("additionalParams", "Additional parameters", FieldKind::Text)
                .describe("One key=value per line"),
        ],
    }
});

fn with_description(mut fields: Vec<FieldSpec>, default: &str) -> Vec<FieldSpec> {
    fields.push(FieldSpec::new("description", "Description", FieldKind::String).with_default(default));
    fields
}

fn output_format(options: &[&str], default: &str) -> FieldSpec {
    FieldSpec::new("outputFormat", "Output format", select(options)).with_default(default)
}

fn file_name(default: &str) -> FieldSpec {
    FieldSpec::new("fileName", "File name", FieldKind::String).with_default(default)
}

pub static NODE_TYPES: Lazy<Vec<NodeType>> = Lazy::new(|| {
    vec![
        NodeType {
            id: "file_input".to_string(),
            name: "File input".to_string(),
            description: "Uses a stored file as the workflow's starting point".to_string(),
            category: NodeCategory::Input,
            inputs: Vec::new(),
            outputs: strings(&["file"]),
            fields: vec![
                FieldSpec::new("fileType", "File type", select(&["txt", "json", "jsonl"]))
                    .with_default("txt"),
                FieldSpec::new("fileRef", "File", FieldKind::File)
                    .describe("Falls back to the execution's fileRef parameter"),
            ],
            tool: None,
        },
        NodeType {
            id: "xmap_scan".to_string(),
            name: "XMap scan".to_string(),
            description: "IPv6 or IPv4 network scan; the input file is used as whitelist"
                .to_string(),
            category: NodeCategory::Scan,
            inputs: strings(&["file"]),
            outputs: strings(&["result_file"]),
            fields: with_description(SCANNER_SCHEMA.fields.clone(), "XMap scan"),
            tool: Some(ToolKind::Scanner),
        },
        NodeType {
            id: "zgrab2_scan".to_string(),
            name: "ZGrab2 scan".to_string(),
            description: "Application-layer scan of the addresses in the input file".to_string(),
            category: NodeCategory::Scan,
            inputs: strings(&["file"]),
            outputs: strings(&["result_file"]),
            fields: with_description(GRABBER_SCHEMA.fields.clone(), "ZGrab2 scan"),
            tool: Some(ToolKind::Grabber),
        },
        NodeType {
            id: "xmap_json_extract".to_string(),
            name: "XMap result extraction".to_string(),
            description: "Extracts responding addresses from XMap JSON results".to_string(),
            category: NodeCategory::Process,
            inputs: strings(&["result_file"]),
            outputs: strings(&["file"]),
            fields: vec![
                FieldSpec::new(
                    "extractType",
                    "Extract",
                    select(&["outersaddr", "successful_addresses", "all_addresses"]),
                )
                .with_default("outersaddr"),
                FieldSpec::new("successOnly", "Successful only", FieldKind::Boolean)
                    .with_default(true),
                output_format(&["txt", "json"], "txt"),
                file_name("xmap_extracted_addresses"),
            ],
            tool: None,
        },
        NodeType {
            id: "zgrab2_json_extract".to_string(),
            name: "ZGrab2 result extraction".to_string(),
            description: "Extracts responding hosts and services from ZGrab2 results"
                .to_string(),
            category: NodeCategory::Process,
            inputs: strings(&["result_file"]),
            outputs: strings(&["file"]),
            fields: vec![
                FieldSpec::new(
                    "extractType",
                    "Extract",
                    select(&["successful_ips", "service_info", "full_results"]),
                )
                .with_default("successful_ips"),
                FieldSpec::new("successOnly", "Successful only", FieldKind::Boolean)
                    .with_default(true),
                FieldSpec::new("includeMetadata", "Include metadata", FieldKind::Boolean)
                    .with_default(false),
                output_format(&["txt", "json"], "txt"),
                file_name("zgrab2_extracted_results"),
            ],
            tool: None,
        },
        NodeType {
            id: "json_custom_extract".to_string(),
            name: "Custom JSON extraction".to_string(),
            description: "Extracts fields from JSON records using path rules".to_string(),
            category: NodeCategory::Process,
            inputs: strings(&["result_file", "file"]),
            outputs: strings(&["file"]),
            fields: vec![
                FieldSpec::new("fieldPaths", "Field paths", FieldKind::Array)
                    .with_default(json!([]))
                    .describe("Dotted paths such as data.http.status"),
                FieldSpec::new("filterCriteria", "Filter", FieldKind::Object)
                    .with_default(json!({}))
                    .describe("Path to expected value; every entry must match"),
                FieldSpec::new("useRegex", "Regex filter", FieldKind::Boolean).with_default(false),
                output_format(&["json", "txt", "csv"], "json"),
                file_name("custom_extracted_data"),
            ],
            tool: None,
        },
        NodeType {
            id: "file_output".to_string(),
            name: "File output".to_string(),
            description: "Publishes the upstream file as a named result".to_string(),
            category: NodeCategory::Output,
            inputs: strings(&["file", "result_file"]),
            outputs: Vec::new(),
            fields: vec![
                FieldSpec::new("fileName", "File name", FieldKind::String).required(),
                FieldSpec::new("description", "Description", FieldKind::String),
                FieldSpec::new("fileType", "File type", select(&["auto", "txt", "json", "csv"]))
                    .with_default("auto"),
            ],
            tool: None,
        },
    ]
});

pub static TEMPLATES: Lazy<Vec<WorkflowTemplate>> = Lazy::new(|| {
    vec![
        WorkflowTemplate {
            id: "xmap_zgrab2_basic".to_string(),
            name: "XMap + ZGrab2 basic scan".to_string(),
            description: "Discovers live IPv6 hosts with XMap, then grabs HTTP banners".to_string(),
            category: "scan".to_string(),
            tags: strings(&["xmap", "zgrab2", "ipv6", "http"]),
            definition: WorkflowDefinition::new("XMap + ZGrab2 basic scan")
                .node(
                    NodeDefinition::new("input_1", "file_input")
                        .with_config(json!({"fileType": "txt"}))
                        .with_label("IPv6 address list"),
                )
                .node(NodeDefinition::new("xmap_1", "xmap_scan").with_config(json!({
                    "protocol": "ipv6",
                    "probeModule": "icmp_echo",
                    "rate": 1000,
                    "maxResults": 10000,
                    "description": "IPv6 liveness probe"
                })))
                .node(
                    NodeDefinition::new("extract_1", "xmap_json_extract").with_config(json!({
                        "extractType": "successful_addresses",
                        "successOnly": true,
                        "outputFormat": "txt",
                        "fileName": "active_ipv6_addresses"
                    })),
                )
                .node(NodeDefinition::new("zgrab2_1", "zgrab2_scan").with_config(json!({
                    "module": "http",
                    "port": 80,
                    "timeout": 10,
                    "description": "HTTP service scan"
                })))
                .node(
                    NodeDefinition::new("extract_2", "zgrab2_json_extract").with_config(json!({
                        "extractType": "successful_ips",
                        "successOnly": true,
                        "includeMetadata": true,
                        "outputFormat": "json",
                        "fileName": "http_services"
                    })),
                )
                .node(NodeDefinition::new("output_1", "file_output").with_config(json!({
                    "fileName": "final_scan_results",
                    "description": "XMap + ZGrab2 results",
                    "fileType": "json"
                })))
                .edge(Edge::new("input_1", "xmap_1").ports("file", "file"))
                .edge(Edge::new("xmap_1", "extract_1").ports("result_file", "result_file"))
                .edge(Edge::new("extract_1", "zgrab2_1").ports("file", "file"))
                .edge(Edge::new("zgrab2_1", "extract_2").ports("result_file", "result_file"))
                .edge(Edge::new("extract_2", "output_1").ports("file", "file")),
        },
        WorkflowTemplate {
            id: "xmap_only_scan".to_string(),
            name: "XMap IPv6 discovery".to_string(),
            description: "Large-scale IPv6 host discovery with XMap alone".to_string(),
            category: "scan".to_string(),
            tags: strings(&["xmap", "ipv6", "icmp"]),
            definition: WorkflowDefinition::new("XMap IPv6 discovery")
                .node(
                    NodeDefinition::new("input_1", "file_input")
                        .with_config(json!({"fileType": "txt"}))
                        .with_label("IPv6 prefix list"),
                )
                .node(NodeDefinition::new("xmap_1", "xmap_scan").with_config(json!({
                    "protocol": "ipv6",
                    "probeModule": "icmp_echo",
                    "rate": 2000,
                    "maxResults": 50000,
                    "description": "IPv6 discovery"
                })))
                .node(
                    NodeDefinition::new("extract_1", "xmap_json_extract").with_config(json!({
                        "extractType": "successful_addresses",
                        "successOnly": true,
                        "outputFormat": "txt",
                        "fileName": "discovered_ipv6_hosts"
                    })),
                )
                .node(NodeDefinition::new("output_1", "file_output").with_config(json!({
                    "fileName": "xmap_discovery_results",
                    "description": "Discovered IPv6 hosts",
                    "fileType": "txt"
                })))
                .edge(Edge::new("input_1", "xmap_1").ports("file", "file"))
                .edge(Edge::new("xmap_1", "extract_1").ports("result_file", "result_file"))
                .edge(Edge::new("extract_1", "output_1").ports("file", "file")),
        },
        WorkflowTemplate {
            id: "zgrab2_multi_protocol".to_string(),
            name: "ZGrab2 multi-protocol scan".to_string(),
            description: "Scans known hosts for HTTP, TLS and SSH in parallel".to_string(),
            category: "scan".to_string(),
            tags: strings(&["zgrab2", "http", "tls", "ssh"]),
            definition: {
                let mut definition = WorkflowDefinition::new("ZGrab2 multi-protocol scan").node(
                    NodeDefinition::new("input_1", "file_input")
                        .with_config(json!({"fileType": "txt"}))
                        .with_label("Host list"),
                );
                for module in ["http", "tls", "ssh"] {
                    let scan_id = format!("{}_1", module);
                    let output_id = format!("{}_output", module);
                    definition = definition
                        .node(NodeDefinition::new(&scan_id, "zgrab2_scan").with_config(json!({
                            "module": module,
                            "description": format!("{} scan", module)
                        })))
                        .node(NodeDefinition::new(&output_id, "file_output").with_config(json!({
                            "fileName": format!("{}_results", module),
                            "fileType": "json"
                        })))
                        .edge(Edge::new("input_1", &scan_id).ports("file", "file"))
                        .edge(Edge::new(&scan_id, &output_id).ports("result_file", "result_file"));
                }
                definition
            },
        },
    ]
});
