//! Tool registry, parameter validation, and HTTP execution.
//!
//! Tools are dynamic records, not compile-time types: each declares an
//! ordered parameter list with `required` and `string|number` kinds, and
//! the registry resolves invocations by slug. Validation coerces the
//! model's loosely-typed values into [`ParameterValue`]s in one explicit
//! step; unknown parameters are silently dropped. A failed call is never
//! fatal - it becomes a `success=false` tool-result turn the model can
//! react to.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use secrecy::ExposeSecret;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use parley_core::domain::tool::{
    ParameterKind, ParameterValue, RequestMethod, ToolDefinition, ToolInvocationResult,
    ToolParameter,
};

use crate::model::ToolSchema;

/// Reserved tool: invoking it transfers the conversation to a human. No
/// network call is made.
pub const ESCALATION_TOOL_SLUG: &str = "request_human_support";

/// Fixed acknowledgment shown to the model and, ultimately, the customer.
pub const ESCALATION_ACK: &str =
    "The conversation has been escalated to a human agent. You will be contacted soon by email.";

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolCallError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("tool `{tool}` is missing required parameter `{name}`")]
    MissingParameter { tool: String, name: String },
    #[error("tool `{tool}` parameter `{name}` is not a valid {expected}: `{value}`")]
    InvalidParameter { tool: String, name: String, expected: &'static str, value: String },
}

pub fn escalation_tool_schema() -> ToolSchema {
    ToolSchema {
        name: ESCALATION_TOOL_SLUG.to_string(),
        description: "Transfer this conversation to a human support agent. \
                      Escalation reasons must include specific details about the issue."
            .to_string(),
        parameters: vec![ToolParameter {
            name: "reason".to_string(),
            kind: ParameterKind::String,
            required: true,
            description: Some("specific reason the conversation needs a human".to_string()),
        }],
    }
}

/// Chat-surface tool set resolved from the organization's tool records.
pub struct ToolRegistry {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolRegistry {
    pub fn from_definitions(definitions: Vec<ToolDefinition>) -> Self {
        let tools = definitions
            .into_iter()
            .filter(|tool| tool.available_in_chat)
            .map(|tool| (tool.slug.clone(), tool))
            .collect();
        Self { tools }
    }

    pub fn get(&self, slug: &str) -> Option<&ToolDefinition> {
        self.tools.get(slug)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas attached to every model request: the registered tools plus
    /// the reserved escalation tool.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|tool| ToolSchema {
                name: tool.slug.clone(),
                description: format!("{} - {}", tool.name, tool.description),
                parameters: tool.parameters.clone(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas.push(escalation_tool_schema());
        schemas
    }
}

/// Validates raw model-provided arguments against the declared parameter
/// list. Evaluated in declared order so the first violation wins.
pub fn validate_parameters(
    tool: &ToolDefinition,
    raw: &Value,
) -> Result<BTreeMap<String, ParameterValue>, ToolCallError> {
    let empty = serde_json::Map::new();
    let raw = raw.as_object().unwrap_or(&empty);
    let mut validated = BTreeMap::new();

    for parameter in &tool.parameters {
        let value = raw.get(&parameter.name).filter(|value| !value.is_null());
        match (value, parameter.required) {
            (None, true) => {
                return Err(ToolCallError::MissingParameter {
                    tool: tool.slug.clone(),
                    name: parameter.name.clone(),
                });
            }
            (None, false) => continue,
            (Some(value), _) => {
                let coerced = coerce(tool, parameter, value)?;
                validated.insert(parameter.name.clone(), coerced);
            }
        }
    }

    // Anything not declared is dropped, not an error.
    Ok(validated)
}

fn coerce(
    tool: &ToolDefinition,
    parameter: &ToolParameter,
    value: &Value,
) -> Result<ParameterValue, ToolCallError> {
    match parameter.kind {
        ParameterKind::String => match value {
            Value::String(text) => Ok(ParameterValue::String(text.clone())),
            Value::Number(number) => Ok(ParameterValue::String(number.to_string())),
            other => Err(ToolCallError::InvalidParameter {
                tool: tool.slug.clone(),
                name: parameter.name.clone(),
                expected: "string",
                value: other.to_string(),
            }),
        },
        ParameterKind::Number => match value {
            Value::Number(number) => number.as_f64().map(ParameterValue::Number).ok_or_else(|| {
                ToolCallError::InvalidParameter {
                    tool: tool.slug.clone(),
                    name: parameter.name.clone(),
                    expected: "number",
                    value: number.to_string(),
                }
            }),
            Value::String(text) => text.trim().parse::<f64>().map(ParameterValue::Number).map_err(
                |_| ToolCallError::InvalidParameter {
                    tool: tool.slug.clone(),
                    name: parameter.name.clone(),
                    expected: "number",
                    value: text.clone(),
                },
            ),
            other => Err(ToolCallError::InvalidParameter {
                tool: tool.slug.clone(),
                name: parameter.name.clone(),
                expected: "number",
                value: other.to_string(),
            }),
        },
    }
}

/// Issues the declared HTTP request for a validated invocation.
#[derive(Clone)]
pub struct ToolExecutor {
    client: reqwest::Client,
}

impl ToolExecutor {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Never fails the conversation: transport and HTTP errors come back
    /// as a `success=false` result for the model to adapt to.
    pub async fn execute(
        &self,
        tool: &ToolDefinition,
        parameters: BTreeMap<String, ParameterValue>,
    ) -> ToolInvocationResult {
        let method = match tool.request_method {
            RequestMethod::Get => reqwest::Method::GET,
            RequestMethod::Post => reqwest::Method::POST,
            RequestMethod::Put => reqwest::Method::PUT,
            RequestMethod::Patch => reqwest::Method::PATCH,
            RequestMethod::Delete => reqwest::Method::DELETE,
        };

        let mut request = self.client.request(method, &tool.url);
        if let Some(token) = &tool.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        if tool.request_method.has_body() {
            let body: serde_json::Map<String, Value> = parameters
                .iter()
                .map(|(name, value)| (name.clone(), value.as_json()))
                .collect();
            request = request.json(&Value::Object(body));
        } else {
            let query: Vec<(String, String)> = parameters
                .iter()
                .map(|(name, value)| {
                    let rendered = match value {
                        ParameterValue::String(text) => text.clone(),
                        ParameterValue::Number(number) => number.to_string(),
                    };
                    (name.clone(), rendered)
                })
                .collect();
            request = request.query(&query);
        }

        debug!(
            event_name = "engine.tools.dispatch",
            tool_slug = %tool.slug,
            method = tool.request_method.as_str(),
            "dispatching tool call"
        );

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                return failure(tool, parameters, &error.to_string());
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            ToolInvocationResult {
                tool_slug: tool.slug.clone(),
                parameters,
                success: true,
                raw_result: body,
            }
        } else {
            failure(tool, parameters, &format!("{status}: {body}"))
        }
    }
}

fn failure(
    tool: &ToolDefinition,
    parameters: BTreeMap<String, ParameterValue>,
    error: &str,
) -> ToolInvocationResult {
    ToolInvocationResult {
        tool_slug: tool.slug.clone(),
        parameters,
        success: false,
        raw_result: truncate(error, ERROR_BODY_LIMIT),
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
