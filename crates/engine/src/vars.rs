//! Variable resolution.
//!
//! Sources merge in strict precedence (highest wins): explicit overrides,
//! then a variables file, then environment variables under a prefix, then
//! interactive prompts for missing required specs, then spec defaults.
//! The result is validated against the declared specs (choices, type
//! coercion, numeric ranges) and frozen before the engine starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::error::VariableError;
use crate::model::{ResolvedVariables, VariableSpec};

/// Default environment prefix scraped for variables.
pub const DEFAULT_ENV_PREFIX: &str = "OPSBOOK_VAR_";

/// The caller-supplied variable layers.
#[derive(Debug, Clone, Default)]
pub struct VariableSources {
    /// `--var KEY=VALUE` overrides: the highest-precedence layer.
    pub overrides: BTreeMap<String, Value>,
    /// Optional variables file (toml / json / yaml / env by extension).
    pub file: Option<PathBuf>,
    /// Environment prefix; `None` disables environment scraping.
    pub env_prefix: Option<String>,
}

/// Port for prompting the operator for missing required variables. Absent
/// in non-interactive mode.
pub trait VarPrompter: Send + Sync {
    /// Ask for a value; `None` means the operator gave up.
    fn prompt(&self, name: &str, spec: &VariableSpec) -> Option<String>;
}

/// Parse a `KEY=VALUE` override. Values that look like JSON arrays or
/// objects are parsed as JSON, everything else stays a string.
pub fn parse_override(raw: &str) -> Result<(String, Value), VariableError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(VariableError::BadOverride(raw.to_string()));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(VariableError::BadOverride(raw.to_string()));
    }
    Ok((key.to_string(), parse_raw(value.trim())))
}

/// Scrape `PREFIX*` environment variables into a layer.
pub fn scrape_env(prefix: &str) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for (key, value) in std::env::vars() {
        if let Some(name) = key.strip_prefix(prefix) {
            if !name.is_empty() {
                out.insert(name.to_string(), parse_raw(&value));
            }
        }
    }
    out
}

/// Load a variables file. Format chosen by extension; unknown extensions
/// fall back to JSON, then YAML.
pub fn load_file(path: &Path) -> Result<BTreeMap<String, Value>, VariableError> {
    let bad = |message: String| VariableError::BadFile {
        path: path.to_path_buf(),
        message,
    };

    let content = std::fs::read_to_string(path).map_err(|e| bad(e.to_string()))?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let value: Value = match extension.as_str() {
        "toml" => {
            let parsed: toml::Value =
                toml::from_str(&content).map_err(|e| bad(e.to_string()))?;
            toml_value_to_json(&parsed)
        }
        "json" => serde_json::from_str(&content).map_err(|e| bad(e.to_string()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&content).map_err(|e| bad(e.to_string()))?
        }
        "env" => {
            let mut map = serde_json::Map::new();
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                    map.insert(key.trim().to_string(), parse_raw(value));
                }
            }
            Value::Object(map)
        }
        _ => serde_json::from_str(&content)
            .or_else(|_| serde_yaml::from_str(&content))
            .map_err(|_: serde_yaml::Error| {
                bad("unknown format; use .toml, .json, .yaml or .env".to_string())
            })?,
    };

    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(bad("file must contain a mapping of variables".to_string())),
    }
}

/// Merge all sources by precedence, prompt for missing required variables
/// when a prompter is available, then validate and coerce against the
/// specs. The returned map is the frozen `ResolvedVariables` snapshot.
pub fn resolve(
    specs: &BTreeMap<String, VariableSpec>,
    sources: &VariableSources,
    prompter: Option<&dyn VarPrompter>,
) -> Result<ResolvedVariables, VariableError> {
    let mut merged: ResolvedVariables = BTreeMap::new();

    // Lowest precedence first; later inserts overwrite.
    for (name, spec) in specs {
        if let Some(default) = &spec.default {
            merged.insert(name.clone(), default.clone());
        }
    }
    if let Some(prefix) = &sources.env_prefix {
        merged.extend(scrape_env(prefix));
    }
    if let Some(path) = &sources.file {
        merged.extend(load_file(path)?);
    }
    merged.extend(sources.overrides.clone());

    // Prompt for whatever required specs are still unfilled.
    for (name, spec) in specs {
        if spec.required && !merged.contains_key(name) {
            let answered = prompter.and_then(|p| p.prompt(name, spec));
            match answered {
                Some(raw) => {
                    merged.insert(name.clone(), parse_raw(&raw));
                }
                None => return Err(VariableError::MissingRequired(name.clone())),
            }
        }
    }

    validate(specs, &mut merged)?;
    debug!(count = merged.len(), "variables resolved");
    Ok(merged)
}

/// Validate (and coerce, in place) a variable map against the specs.
/// Variables without a spec pass through untouched.
pub fn validate(
    specs: &BTreeMap<String, VariableSpec>,
    variables: &mut ResolvedVariables,
) -> Result<(), VariableError> {
    for (name, spec) in specs {
        if spec.required && !variables.contains_key(name) {
            return Err(VariableError::MissingRequired(name.clone()));
        }

        let Some(value) = variables.get(name) else {
            continue;
        };

        let coerced = match spec.var_type {
            Some(ty) => template::coerce(value, ty).map_err(|source| {
                VariableError::CoercionFailed {
                    name: name.clone(),
                    source,
                }
            })?,
            None => value.clone(),
        };

        if let Some(choices) = &spec.choices {
            let matched = choices.iter().any(|choice| match spec.var_type {
                Some(ty) => template::coerce(choice, ty)
                    .map(|c| c == coerced)
                    .unwrap_or(false),
                None => choice == &coerced,
            });
            if !matched {
                return Err(VariableError::BadChoice {
                    name: name.clone(),
                    value: coerced.to_string(),
                });
            }
        }

        if let Some(n) = coerced.as_f64() {
            if spec.min.is_some_and(|min| n < min) || spec.max.is_some_and(|max| n > max) {
                return Err(VariableError::OutOfRange {
                    name: name.clone(),
                    value: n,
                });
            }
        }

        variables.insert(name.clone(), coerced);
    }
    Ok(())
}

/// JSON-looking strings (`[`/`{` prefix) parse as JSON; everything else is
/// kept verbatim.
fn parse_raw(raw: &str) -> Value {
    if raw.starts_with('[') || raw.starts_with('{') {
        if let Ok(value) = serde_json::from_str(raw) {
            return value;
        }
    }
    Value::String(raw.to_string())
}

fn toml_value_to_json(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::from(*i),
        toml::Value::Float(f) => Value::from(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => {
            Value::Array(items.iter().map(toml_value_to_json).collect())
        }
        toml::Value::Table(table) => Value::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_value_to_json(v)))
                .collect(),
        ),
    }
}
