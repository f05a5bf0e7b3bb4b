//! Config Field Schemas
//!
//! Tool configs and node configs are flat JSON objects described by a list
//! of [`FieldSpec`]s. Validation:
//! - rejects keys the schema does not know
//! - checks types, ranges and select options
//! - rejects shell metacharacters in string values
//! - fills in defaults for missing fields

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// Characters never allowed in string parameters.
pub const FORBIDDEN_CHARS: &[char] = &[';', '&', '|', '<', '>', '`', '$'];

/// Type and constraints of one config field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Single-line string.
    String,
    /// Multi-line string (newlines allowed).
    Text,
    Integer {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Number {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Boolean,
    Select {
        options: Vec<String>,
    },
    /// List of strings.
    Array,
    /// Map of string to string.
    Object,
    /// Reference to a stored artifact.
    File,
}

/// Description of one config field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub name: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl FieldSpec {
    pub fn new(name: &str, label: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind,
            required: false,
            default: None,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Checks and normalizes one value against this field.
    fn check(&self, value: &Value) -> std::result::Result<Value, String> {
        match &self.kind {
            FieldKind::String | FieldKind::File => {
                let s = value
                    .as_str()
                    .ok_or_else(|| format!("'{}' must be a string", self.name))?;
                if s.contains('\n') {
                    return Err(format!("'{}' must be a single line", self.name));
                }
                check_chars(&self.name, s)?;
                Ok(Value::String(s.trim().to_string()))
            }
            FieldKind::Text => {
                let s = value
                    .as_str()
                    .ok_or_else(|| format!("'{}' must be a string", self.name))?;
                check_chars(&self.name, s)?;
                Ok(Value::String(s.to_string()))
            }
            FieldKind::Integer { min, max } => {
                let n = as_i64(value)
                    .ok_or_else(|| format!("'{}' must be an integer", self.name))?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(format!(
                        "'{}' must be between {} and {}",
                        self.name,
                        min.map_or("-inf".to_string(), |m| m.to_string()),
                        max.map_or("inf".to_string(), |m| m.to_string())
                    ));
                }
                Ok(Value::from(n))
            }
            FieldKind::Number { min, max } => {
                let n = as_f64(value)
                    .ok_or_else(|| format!("'{}' must be a number", self.name))?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(format!("'{}' is out of range", self.name));
                }
                Number::from_f64(n)
                    .map(Value::Number)
                    .ok_or_else(|| format!("'{}' must be finite", self.name))
            }
            FieldKind::Boolean => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::String(s) if s == "true" || s == "false" => Ok(Value::Bool(s == "true")),
                _ => Err(format!("'{}' must be a boolean", self.name)),
            },
            FieldKind::Select { options } => {
                let s = value
                    .as_str()
                    .ok_or_else(|| format!("'{}' must be a string", self.name))?;
                if options.iter().any(|o| o == s) {
                    Ok(Value::String(s.to_string()))
                } else {
                    Err(format!(
                        "'{}' must be one of: {}",
                        self.name,
                        options.join(", ")
                    ))
                }
            }
            FieldKind::Array => {
                let items = value
                    .as_array()
                    .ok_or_else(|| format!("'{}' must be a list", self.name))?;
                for item in items {
                    let s = item
                        .as_str()
                        .ok_or_else(|| format!("'{}' must contain only strings", self.name))?;
                    check_chars(&self.name, s)?;
                }
                Ok(value.clone())
            }
            FieldKind::Object => {
                let map = value
                    .as_object()
                    .ok_or_else(|| format!("'{}' must be an object", self.name))?;
                for (key, item) in map {
                    let s = item.as_str().ok_or_else(|| {
                        format!("'{}.{}' must be a string", self.name, key)
                    })?;
                    check_chars(&self.name, key)?;
                    check_chars(&self.name, s)?;
                }
                Ok(value.clone())
            }
        }
    }
}

fn check_chars(name: &str, s: &str) -> std::result::Result<(), String> {
    if let Some(c) = s.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(format!("'{}' contains forbidden character '{}'", name, c));
    }
    Ok(())
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Validates `config` against `fields` and returns it with defaults applied.
///
/// `null` values and empty strings count as absent. All problems are
/// reported together.
pub fn validate_config(fields: &[FieldSpec], config: &Value) -> Result<Map<String, Value>> {
    let input = match config {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        _ => return Err(Error::Validation("config must be a JSON object".to_string())),
    };

    let mut errors = Vec::new();

    for key in input.keys() {
        if !fields.iter().any(|f| &f.name == key) {
            errors.push(format!("unknown parameter '{}'", key));
        }
    }

    let mut output = Map::new();
    for field in fields {
        let present = input
            .get(&field.name)
            .filter(|v| !v.is_null() && v.as_str() != Some(""));

        match present {
            Some(value) => match field.check(value) {
                Ok(normalized) => {
                    output.insert(field.name.clone(), normalized);
                }
                Err(e) => errors.push(e),
            },
            None => {
                if let Some(default) = &field.default {
                    output.insert(field.name.clone(), default.clone());
                } else if field.required {
                    errors.push(format!("missing required parameter '{}'", field.name));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(output)
    } else {
        Err(Error::Validation(errors.join("; ")))
    }
}
