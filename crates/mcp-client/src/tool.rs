//! Tool model exposed to callers: flattened parameter map plus the
//! structured-or-text result union.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::McpToolDef;

/// A tool as advertised by one server, with its schema flattened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ToolParameter>,
    /// Display only; never used for routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Raw `inputSchema`, kept for callers that want the full JSON Schema.
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameter {
    #[serde(rename = "type", default = "d_param_type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn d_param_type() -> String {
    "string".into()
}

impl ToolDefinition {
    pub fn required_parameters(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .filter(|(_, p)| p.required)
            .map(|(name, _)| name.as_str())
    }
}

impl From<McpToolDef> for ToolDefinition {
    fn from(def: McpToolDef) -> Self {
        let required: Vec<&str> = def
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut parameters = BTreeMap::new();
        if let Some(props) = def.input_schema.get("properties").and_then(Value::as_object) {
            for (name, schema) in props {
                parameters.insert(
                    name.clone(),
                    ToolParameter {
                        param_type: schema_type(schema),
                        description: schema
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                        required: required.contains(&name.as_str()),
                        default: schema.get("default").cloned(),
                    },
                );
            }
        }

        Self {
            name: def.name,
            description: def.description,
            parameters,
            category: def.category,
            tags: def.tags,
            input_schema: def.input_schema,
        }
    }
}

/// `"type"` may be a string or a list (`["string", "null"]`); take the first
/// non-null entry.
fn schema_type(schema: &Value) -> String {
    match schema.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .unwrap_or("string")
            .to_owned(),
        _ => d_param_type(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a successful tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// The primary text parsed as a JSON object or array.
    Structured(Value),
    /// Anything else, verbatim.
    Text(String),
}

impl ToolOutput {
    /// Two-step decode: structured when the text is a JSON object or array,
    /// plain text otherwise. Bare scalars (`"42"`, `"true"`) stay text.
    pub fn decode(text: impl Into<String>) -> Self {
        let text = text.into();
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                return Self::Structured(value);
            }
        }
        Self::Text(text)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Structured(_) => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            Self::Structured(v) => Some(v),
            Self::Text(_) => None,
        }
    }

    /// Render for display: text verbatim, structured as pretty JSON.
    pub fn render(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Structured(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
        }
    }
}
