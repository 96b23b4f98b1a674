//! Runbook TOML parser.
//!
//! The surface format: a required `[runbook]` header, an optional
//! `[variables]` section, an optional `[runbook.plugin_config.<plugin>]`
//! table per plugin, and one table per node keyed by node id. Node tables
//! appear in declaration order, which is semantic (implicit and `"*"`
//! dependencies).

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use toml::Value as Toml;

use crate::error::ParseError;
use crate::model::{
    DependsOn, NodeDescriptor, NodeKind, Runbook, RunbookMeta, VariableSpec,
};

/// Default closing confirmation for Manual nodes.
pub const DEFAULT_PROMPT_AFTER: &str = "Continue with the next step?";

const RUNBOOK_EXTENSION: &str = ".opsbook.toml";

/// Read and parse a runbook file. The file's SHA-256 becomes the runbook
/// digest used for resume consistency checks.
pub fn load(path: &Path) -> Result<Runbook, ParseError> {
    if !path.to_string_lossy().ends_with(RUNBOOK_EXTENSION) {
        return Err(ParseError::BadExtension(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    parse_str(&content)
}

/// Parse runbook TOML from a string.
pub fn parse_str(content: &str) -> Result<Runbook, ParseError> {
    let digest = hex_digest(content.as_bytes());
    let root: Toml = toml::from_str(content)?;
    let Some(table) = root.as_table() else {
        return Err(ParseError::MissingSection("runbook"));
    };

    let mut meta = None;
    let mut variables = BTreeMap::new();
    let mut plugin_config = BTreeMap::new();
    let mut nodes = Vec::new();

    for (key, value) in table {
        match key.as_str() {
            "runbook" => {
                let header = value
                    .as_table()
                    .ok_or(ParseError::MissingSection("runbook"))?;
                meta = Some(parse_meta(header)?);
                plugin_config = parse_plugin_config(header);
            }
            "variables" => {
                if let Some(specs) = value.as_table() {
                    for (name, spec) in specs {
                        variables.insert(name.clone(), parse_variable_spec(spec));
                    }
                }
            }
            node_id => {
                let node_table = value.as_table().ok_or_else(|| ParseError::BadField {
                    node: node_id.to_string(),
                    field: node_id.to_string(),
                    message: "must be a table".to_string(),
                })?;
                nodes.push(parse_node(node_id, node_table)?);
            }
        }
    }

    let meta = meta.ok_or(ParseError::MissingSection("runbook"))?;

    Ok(Runbook {
        meta,
        nodes,
        variables,
        plugin_config,
        digest,
    })
}

// ---------------------------------------------------------------------------
// [runbook] header
// ---------------------------------------------------------------------------

fn parse_meta(header: &toml::map::Map<String, Toml>) -> Result<RunbookMeta, ParseError> {
    let field = |name: &'static str| -> Result<String, ParseError> {
        header
            .get(name)
            .and_then(Toml::as_str)
            .map(str::to_string)
            .ok_or(ParseError::MissingMeta { field: name })
    };

    let created_at = match header.get("created_at") {
        Some(Toml::String(s)) => parse_timestamp(s)?,
        Some(Toml::Datetime(dt)) => parse_timestamp(&dt.to_string())?,
        _ => return Err(ParseError::MissingMeta { field: "created_at" }),
    };

    Ok(RunbookMeta {
        title: field("title")?,
        description: field("description")?,
        version: field("version")?,
        author: field("author")?,
        created_at,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ParseError::BadTimestamp(s.to_string()))
}

fn parse_plugin_config(
    header: &toml::map::Map<String, Toml>,
) -> BTreeMap<String, BTreeMap<String, serde_json::Value>> {
    let mut out = BTreeMap::new();
    if let Some(tables) = header.get("plugin_config").and_then(Toml::as_table) {
        for (plugin, config) in tables {
            out.insert(plugin.clone(), json_map(config));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// [variables.*]
// ---------------------------------------------------------------------------

fn parse_variable_spec(value: &Toml) -> VariableSpec {
    let Some(spec) = value.as_table() else {
        // A bare value is shorthand for a default.
        return VariableSpec {
            default: Some(toml_to_json(value)),
            ..VariableSpec::default()
        };
    };

    VariableSpec {
        default: spec.get("default").map(toml_to_json),
        required: spec
            .get("required")
            .and_then(Toml::as_bool)
            .unwrap_or(false),
        choices: spec
            .get("choices")
            .and_then(Toml::as_array)
            .map(|items| items.iter().map(toml_to_json).collect()),
        var_type: spec
            .get("type")
            .and_then(Toml::as_str)
            .and_then(|s| s.parse().ok()),
        min: spec.get("min").and_then(toml_number),
        max: spec.get("max").and_then(toml_number),
        description: spec
            .get("description")
            .and_then(Toml::as_str)
            .map(str::to_string),
    }
}

fn toml_number(value: &Toml) -> Option<f64> {
    match value {
        Toml::Integer(i) => Some(*i as f64),
        Toml::Float(f) => Some(*f),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Node tables
// ---------------------------------------------------------------------------

fn parse_node(
    id: &str,
    table: &toml::map::Map<String, Toml>,
) -> Result<NodeDescriptor, ParseError> {
    let kind_name = table
        .get("type")
        .and_then(Toml::as_str)
        .ok_or_else(|| ParseError::MissingField {
            node: id.to_string(),
            field: "type",
        })?;

    let string_field = |name: &str| -> Option<String> {
        table.get(name).and_then(Toml::as_str).map(str::to_string)
    };

    let kind = match kind_name {
        "Manual" => NodeKind::Manual,
        "Command" => NodeKind::Command {
            command: string_field("command").ok_or_else(|| ParseError::MissingField {
                node: id.to_string(),
                field: "command",
            })?,
            interactive: table
                .get("interactive")
                .and_then(Toml::as_bool)
                .unwrap_or(false),
        },
        "Function" => NodeKind::Function {
            plugin: string_field("plugin").ok_or_else(|| ParseError::MissingField {
                node: id.to_string(),
                field: "plugin",
            })?,
            function: string_field("function").ok_or_else(|| ParseError::MissingField {
                node: id.to_string(),
                field: "function",
            })?,
            params: table
                .get("params")
                .map(json_map)
                .unwrap_or_default(),
            plugin_config: table
                .get("plugin_config")
                .map(json_map)
                .unwrap_or_default(),
        },
        other => {
            return Err(ParseError::UnknownKind {
                node: id.to_string(),
                kind: other.to_string(),
            })
        }
    };

    let depends_on = match table.get("depends_on") {
        None => DependsOn::Implicit,
        Some(Toml::String(s)) if s == "^" => DependsOn::Previous,
        Some(Toml::String(s)) if s == "*" => DependsOn::AllPrevious,
        Some(Toml::String(s)) => DependsOn::Explicit(vec![s.clone()]),
        Some(Toml::Array(items)) => {
            let mut deps = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => deps.push(s.to_string()),
                    None => {
                        return Err(ParseError::BadField {
                            node: id.to_string(),
                            field: "depends_on".to_string(),
                            message: "entries must be strings".to_string(),
                        })
                    }
                }
            }
            DependsOn::Explicit(deps)
        }
        Some(_) => {
            return Err(ParseError::BadField {
                node: id.to_string(),
                field: "depends_on".to_string(),
                message: "must be a string or an array of strings".to_string(),
            })
        }
    };

    let timeout_secs = match table.get("timeout") {
        None => None,
        Some(Toml::Integer(i)) if *i > 0 => Some(*i as u64),
        Some(_) => {
            return Err(ParseError::BadField {
                node: id.to_string(),
                field: "timeout".to_string(),
                message: "must be a positive integer (seconds)".to_string(),
            })
        }
    };

    let is_manual = matches!(kind, NodeKind::Manual);
    let prompt_before = if is_manual {
        string_field("prompt_before")
    } else {
        None
    };
    let prompt_after = if is_manual {
        Some(string_field("prompt_after").unwrap_or_else(|| DEFAULT_PROMPT_AFTER.to_string()))
    } else {
        None
    };

    Ok(NodeDescriptor {
        id: id.to_string(),
        kind,
        depends_on,
        critical: table
            .get("critical")
            .and_then(Toml::as_bool)
            .unwrap_or(false),
        skip: table.get("skip").and_then(Toml::as_bool).unwrap_or(false),
        timeout_secs,
        when: string_field("when"),
        name: string_field("name"),
        description: string_field("description"),
        prompt_before,
        prompt_after,
    })
}

// ---------------------------------------------------------------------------
// TOML → JSON values
// ---------------------------------------------------------------------------

fn toml_to_json(value: &Toml) -> serde_json::Value {
    match value {
        Toml::String(s) => serde_json::Value::String(s.clone()),
        Toml::Integer(i) => serde_json::Value::from(*i),
        Toml::Float(f) => serde_json::Value::from(*f),
        Toml::Boolean(b) => serde_json::Value::Bool(*b),
        Toml::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        Toml::Array(items) => {
            serde_json::Value::Array(items.iter().map(toml_to_json).collect())
        }
        Toml::Table(table) => serde_json::Value::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

fn json_map(value: &Toml) -> BTreeMap<String, serde_json::Value> {
    value
        .as_table()
        .map(|table| {
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect()
        })
        .unwrap_or_default()
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
