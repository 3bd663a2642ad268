use std::collections::BTreeMap;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Declared type of a tool parameter. The model supplies loosely-typed
/// values; coercion into [`ParameterValue`] happens in one explicit
/// validation step, never implicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Number,
}

impl ParameterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    String(String),
    Number(f64),
}

impl ParameterValue {
    pub fn as_json(&self) -> serde_json::Value {
        match self {
            Self::String(value) => serde_json::Value::String(value.clone()),
            Self::Number(value) => serde_json::json!(value),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn has_body(&self) -> bool {
        !matches!(self, Self::Get)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub kind: ParameterKind,
    pub required: bool,
    pub description: Option<String>,
}

/// An external HTTP capability exposed by the customer's own backend.
/// Static per organization; the core only reads these records.
#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub request_method: RequestMethod,
    pub url: String,
    pub auth_token: Option<SecretString>,
    pub available_in_chat: bool,
}

/// Outcome of one tool call, attached to the message pair that records the
/// turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    pub tool_slug: String,
    pub parameters: BTreeMap<String, ParameterValue>,
    pub success: bool,
    pub raw_result: String,
}
