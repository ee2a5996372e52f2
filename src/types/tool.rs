//! Tool metadata and parameter schemas.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::discovery::DiscoveryKind;
use crate::{HuginnError, Result};

/// Parameter value type, JSON-schema style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// One parameter of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: String,
    #[serde(default)]
    pub required: bool,
    /// Allowed values, if closed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    /// Substituted when the caller omits the parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn string(description: impl Into<String>) -> Self {
        Self::of(ParamType::String, description)
    }

    pub fn of(kind: ParamType, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            required: false,
            enum_values: Vec::new(),
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, v: Value) -> Self {
        self.default = Some(v);
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = values.iter().map(|v| json!(v)).collect();
        self
    }
}

/// Parameter schema of a tool: a flat property map with required flags,
/// enums, and defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamSchema {
    pub properties: BTreeMap<String, ParamSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.properties.insert(name.into(), spec);
        self
    }

    /// Validate `args` against the schema.
    ///
    /// Returns the arguments with defaults substituted. Errors carry the
    /// field path of the first offending parameter (`arguments.<name>`).
    pub fn validate(&self, args: &Value) -> Result<Map<String, Value>> {
        let mut out = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(HuginnError::invalid_param(
                    "arguments",
                    format!("expected object, got {}", type_name(other)),
                ));
            }
        };

        for (name, spec) in &self.properties {
            let path = format!("arguments.{name}");
            match out.get(name) {
                None | Some(Value::Null) => {
                    if let Some(ref default) = spec.default {
                        out.insert(name.clone(), default.clone());
                    } else if spec.required {
                        return Err(HuginnError::invalid_param(path, "missing required parameter"));
                    }
                }
                Some(value) => {
                    if !spec.kind.accepts(value) {
                        return Err(HuginnError::invalid_param(
                            path,
                            format!("expected {}, got {}", spec.kind.as_str(), type_name(value)),
                        ));
                    }
                    if !spec.enum_values.is_empty() && !spec.enum_values.contains(value) {
                        return Err(HuginnError::invalid_param(
                            path,
                            format!(
                                "must be one of {}",
                                spec.enum_values
                                    .iter()
                                    .map(|v| v.to_string())
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            ),
                        ));
                    }
                }
            }
        }

        // Unknown parameters are rejected so typos surface early.
        for key in out.keys() {
            if !self.properties.contains_key(key) {
                return Err(HuginnError::invalid_param(
                    format!("arguments.{key}"),
                    "unknown parameter",
                ));
            }
        }

        Ok(out)
    }

    /// Render as a JSON Schema document for `tools/list` / `mcp.discover`.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, spec) in &self.properties {
            let mut prop = Map::new();
            prop.insert("type".into(), json!(spec.kind.as_str()));
            prop.insert("description".into(), json!(spec.description));
            if !spec.enum_values.is_empty() {
                prop.insert("enum".into(), Value::Array(spec.enum_values.clone()));
            }
            if let Some(ref default) = spec.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(name.clone(), Value::Object(prop));
            if spec.required {
                required.push(json!(name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A discovery a tool needs before it can run: kind plus a scope template.
///
/// The account is filled in at dispatch time; `event_type` may reference a
/// call argument by `$name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prerequisite {
    pub kind: DiscoveryKind,
    /// Literal event type, or `$param` to take it from the call arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl Prerequisite {
    pub fn of(kind: DiscoveryKind) -> Self {
        Self {
            kind,
            event_type: None,
        }
    }

    pub fn scoped(kind: DiscoveryKind, event_type: impl Into<String>) -> Self {
        Self {
            kind,
            event_type: Some(event_type.into()),
        }
    }

    /// Human-readable description used in `discovery-required` errors.
    pub fn describe(&self) -> String {
        match self.event_type {
            Some(ref et) => format!("{} ({})", self.kind.as_str(), et),
            None => self.kind.as_str().to_string(),
        }
    }
}

/// Static description of a tool: metadata, parameter schema, prerequisites.
/// Registered at startup; immutable thereafter.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Hint to callers that the tool performs no mutation.
    pub read_only: bool,
    /// Whether successful results may be served from the response cache.
    pub cacheable: bool,
    pub params: ParamSchema,
    pub prerequisites: Vec<Prerequisite>,
    /// Example argument objects surfaced by `mcp.discover`.
    pub examples: Vec<Value>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            read_only: true,
            cacheable: false,
            params: ParamSchema::new(),
            prerequisites: Vec::new(),
            examples: Vec::new(),
        }
    }

    pub fn params(mut self, params: ParamSchema) -> Self {
        self.params = params;
        self
    }

    pub fn prerequisite(mut self, p: Prerequisite) -> Self {
        self.prerequisites.push(p);
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn example(mut self, v: Value) -> Self {
        self.examples.push(v);
        self
    }

    /// Tool metadata document for `mcp.discover`.
    pub fn metadata(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "readOnlyHint": self.read_only,
            "inputSchema": self.params.to_json_schema(),
            "examples": self.examples,
            "prerequisites": self.prerequisites.iter().map(|p| json!({
                "kind": p.kind.as_str(),
                "eventType": p.event_type,
            })).collect::<Vec<_>>(),
        })
    }
}
