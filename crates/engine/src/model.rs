//! Model provider contract and the OpenAI-style HTTP client.
//!
//! The provider sees the system prompt, the full turn history including
//! tool-call/tool-result pairs, and the tool schema list; it answers with
//! either free text or one structured tool-call request. Transient
//! failures (timeout, 429, 5xx) are retried a bounded number of times with
//! backoff at this layer only - the agentic loop is never re-run for a
//! transport hiccup.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use parley_core::domain::tool::{ParameterKind, ToolParameter};

#[derive(Clone, Debug, PartialEq)]
pub enum ChatTurn {
    System(String),
    User(String),
    Assistant(String),
    ToolCall { name: String, arguments: Value },
    ToolResult { name: String, result: String, success: bool },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolSchema {
    /// JSON Schema rendering of the declared parameter list.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for parameter in &self.parameters {
            let kind = match parameter.kind {
                ParameterKind::String => "string",
                ParameterKind::Number => "number",
            };
            let mut spec = serde_json::Map::new();
            spec.insert("type".to_string(), Value::String(kind.to_string()));
            if let Some(description) = &parameter.description {
                spec.insert("description".to_string(), Value::String(description.clone()));
            }
            properties.insert(parameter.name.clone(), Value::Object(spec));
            if parameter.required {
                required.push(Value::String(parameter.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct ModelRequest {
    pub turns: Vec<ChatTurn>,
    pub tools: Vec<ToolSchema>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModelOutcome {
    Text(String),
    ToolCall { name: String, arguments: Value },
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("could not decode model response: {0}")]
    Decode(String),
    #[error("model provider unavailable after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelOutcome, ModelError>;
}

/// Chat-completions wire client with bounded retry.
pub struct HttpModelProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    max_retries: u32,
}

impl HttpModelProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ModelError::Transport(error.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            max_retries,
        })
    }

    fn encode_request(&self, request: &ModelRequest) -> Value {
        let mut messages = Vec::new();
        let mut call_index = 0usize;
        for turn in &request.turns {
            match turn {
                ChatTurn::System(content) => {
                    messages.push(serde_json::json!({ "role": "system", "content": content }));
                }
                ChatTurn::User(content) => {
                    messages.push(serde_json::json!({ "role": "user", "content": content }));
                }
                ChatTurn::Assistant(content) => {
                    messages.push(serde_json::json!({ "role": "assistant", "content": content }));
                }
                ChatTurn::ToolCall { name, arguments } => {
                    call_index += 1;
                    messages.push(serde_json::json!({
                        "role": "assistant",
                        "content": Value::Null,
                        "tool_calls": [{
                            "id": format!("call_{call_index}"),
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": arguments.to_string(),
                            },
                        }],
                    }));
                }
                ChatTurn::ToolResult { name, result, success } => {
                    messages.push(serde_json::json!({
                        "role": "tool",
                        "tool_call_id": format!("call_{call_index}"),
                        "name": name,
                        "content": if *success {
                            result.clone()
                        } else {
                            format!("Tool call failed: {result}")
                        },
                    }));
                }
            }
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.1,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters_schema(),
                        },
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    name: String,
    arguments: String,
}

fn decode_outcome(response: CompletionResponse) -> Result<ModelOutcome, ModelError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::Decode("response contained no choices".to_string()))?;

    if let Some(call) = choice.message.tool_calls.into_iter().next() {
        let arguments = serde_json::from_str(&call.function.arguments)
            .unwrap_or(Value::Object(serde_json::Map::new()));
        return Ok(ModelOutcome::ToolCall { name: call.function.name, arguments });
    }

    Ok(ModelOutcome::Text(choice.message.content.unwrap_or_default()))
}

fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 500u64.saturating_mul(1 << attempt.min(4));
    let jitter_ms = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(base_ms + jitter_ms)
}

#[async_trait]
impl ModelProvider for HttpModelProvider {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelOutcome, ModelError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = self.encode_request(request);

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                warn!(
                    event_name = "engine.model.retrying",
                    attempt,
                    "retrying model request after transient error"
                );
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let mut http_request = self.client.post(&url).json(&body);
            if let Some(api_key) = &self.api_key {
                http_request = http_request.bearer_auth(api_key.expose_secret());
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(error) => {
                    // Timeouts and connection failures are transient.
                    last_error = error.to_string();
                    continue;
                }
            };

            let status = response.status();
            debug!(event_name = "engine.model.response", status = %status, attempt, "model response received");

            if status.is_success() {
                let decoded: CompletionResponse = response
                    .json()
                    .await
                    .map_err(|error| ModelError::Decode(error.to_string()))?;
                return decode_outcome(decoded);
            }

            let body_text = response.text().await.unwrap_or_default();
            if is_transient_status(status) {
                last_error = format!("{status}: {body_text}");
                continue;
            }
            return Err(ModelError::Provider { status: status.as_u16(), body: body_text });
        }

        Err(ModelError::ExhaustedRetries {
            attempts: self.max_retries + 1,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_core::domain::tool::{ParameterKind, ToolParameter};

    use super::{
        decode_outcome, ChatTurn, CompletionResponse, HttpModelProvider, ModelOutcome,
        ModelRequest, ToolSchema,
    };

    fn provider() -> HttpModelProvider {
        HttpModelProvider::new(
            "https://api.example.com/v1",
            "gpt-4.1",
            None,
            Duration::from_secs(5),
            1,
        )
        .expect("build provider")
    }

    #[test]
    fn tool_schema_renders_json_schema_with_required_list() {
        let schema = ToolSchema {
            name: "refund_lookup".to_string(),
            description: "Look up a refund".to_string(),
            parameters: vec![
                ToolParameter {
                    name: "amount".to_string(),
                    kind: ParameterKind::Number,
                    required: true,
                    description: Some("refund amount".to_string()),
                },
                ToolParameter {
                    name: "note".to_string(),
                    kind: ParameterKind::String,
                    required: false,
                    description: None,
                },
            ],
        };

        let rendered = schema.parameters_schema();
        assert_eq!(rendered["properties"]["amount"]["type"], "number");
        assert_eq!(rendered["properties"]["note"]["type"], "string");
        assert_eq!(rendered["required"], serde_json::json!(["amount"]));
    }

    #[test]
    fn tool_turn_pairs_encode_with_matching_call_ids() {
        let request = ModelRequest {
            turns: vec![
                ChatTurn::System("system".to_string()),
                ChatTurn::User("check my order".to_string()),
                ChatTurn::ToolCall {
                    name: "order_lookup".to_string(),
                    arguments: serde_json::json!({"order_id": "A-1"}),
                },
                ChatTurn::ToolResult {
                    name: "order_lookup".to_string(),
                    result: "{\"status\":\"shipped\"}".to_string(),
                    success: true,
                },
            ],
            tools: Vec::new(),
        };

        let encoded = provider().encode_request(&request);
        let messages = encoded["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 4);
        assert_eq!(
            messages[2]["tool_calls"][0]["id"],
            messages[3]["tool_call_id"],
        );
        assert_eq!(messages[3]["role"], "tool");
    }

    #[test]
    fn failed_tool_results_are_marked_for_the_model() {
        let request = ModelRequest {
            turns: vec![
                ChatTurn::ToolCall {
                    name: "order_lookup".to_string(),
                    arguments: serde_json::json!({}),
                },
                ChatTurn::ToolResult {
                    name: "order_lookup".to_string(),
                    result: "504 gateway timeout".to_string(),
                    success: false,
                },
            ],
            tools: Vec::new(),
        };

        let encoded = provider().encode_request(&request);
        let content = encoded["messages"][1]["content"].as_str().expect("content");
        assert!(content.starts_with("Tool call failed:"));
    }

    #[test]
    fn decode_prefers_tool_calls_over_text() {
        let raw = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "function": {
                            "name": "request_human_support",
                            "arguments": "{\"reason\":\"explicit request\"}",
                        },
                    }],
                },
            }],
        });
        let response: CompletionResponse = serde_json::from_value(raw).expect("decode");
        let outcome = decode_outcome(response).expect("outcome");
        assert_eq!(
            outcome,
            ModelOutcome::ToolCall {
                name: "request_human_support".to_string(),
                arguments: serde_json::json!({"reason": "explicit request"}),
            }
        );
    }

    #[test]
    fn decode_returns_text_when_no_tool_calls() {
        let raw = serde_json::json!({
            "choices": [{"message": {"content": "You can request a refund from settings."}}],
        });
        let response: CompletionResponse = serde_json::from_value(raw).expect("decode");
        let outcome = decode_outcome(response).expect("outcome");
        assert_eq!(
            outcome,
            ModelOutcome::Text("You can request a refund from settings.".to_string())
        );
    }
}
