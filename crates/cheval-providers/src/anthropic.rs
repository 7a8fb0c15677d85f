//! Anthropic Messages API adapter.
//!
//! Anthropic wants the system prompt as a separate parameter, tool
//! results as user-side content blocks, and tools in its own schema;
//! this adapter translates both directions and lifts `thinking` blocks
//! into the canonical result field.

use async_trait::async_trait;
use cheval_config::{ModelConfig, ProviderConfig, ProviderKind};
use cheval_core::{
    ChevalResult, CompletionRequest, CompletionResult, MessageRole, ToolCall, Usage,
};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::adapter::{
    auth_value, build_client, empty_response_error, enforce_context_window, estimated_usage_warned,
    extract_error_message, map_status_error, post_json, sensitive_header, ProviderAdapter,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for the Anthropic Messages API.
pub struct AnthropicAdapter {
    name: String,
    config: ProviderConfig,
    client: Client,
}

impl AnthropicAdapter {
    /// Construct the adapter.
    ///
    /// # Errors
    ///
    /// `INVALID_CONFIG` when the HTTP client cannot be built.
    pub fn new(name: &str, config: ProviderConfig) -> ChevalResult<Self> {
        let client = build_client(&config)?;
        Ok(Self {
            name: name.to_owned(),
            config,
            client,
        })
    }

    fn model_config(&self, model_id: &str) -> ModelConfig {
        self.config
            .models
            .get(model_id)
            .cloned()
            .unwrap_or_default()
    }

    fn parse_response(
        &self,
        resp: &Value,
        latency_ms: u64,
        input_chars: usize,
    ) -> ChevalResult<CompletionResult> {
        let Some(blocks) = resp.get("content").and_then(Value::as_array) else {
            return Err(empty_response_error(&self.name, "no content blocks"));
        };

        let mut text_parts = Vec::new();
        let mut thinking_parts = Vec::new();
        let mut tool_calls = Vec::new();

        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        text_parts.push(text.to_owned());
                    }
                },
                Some("thinking") => {
                    if let Some(thinking) = block.get("thinking").and_then(Value::as_str) {
                        thinking_parts.push(thinking.to_owned());
                    }
                },
                Some("tool_use") => {
                    let input = block.get("input").cloned().unwrap_or(json!({}));
                    let arguments = match input {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    tool_calls.push(ToolCall::new(
                        block.get("id").and_then(Value::as_str).unwrap_or_default(),
                        block.get("name").and_then(Value::as_str).unwrap_or_default(),
                        arguments,
                    ));
                },
                _ => {},
            }
        }

        let content = text_parts.join("\n");
        let usage = match resp.get("usage").filter(|u| !u.is_null()) {
            Some(usage) => Usage::actual(
                usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                // Anthropic reports thinking tokens inside output.
                0,
            ),
            None => estimated_usage_warned(&self.name, "unknown", input_chars, content.len()),
        };

        Ok(CompletionResult {
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            thinking: (!thinking_parts.is_empty()).then(|| thinking_parts.join("\n")),
            usage,
            model: resp
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned(),
            latency_ms,
            provider: self.name.clone(),
            interaction_id: None,
        })
    }
}

/// Split canonical messages into Anthropic's shape: one merged system
/// prompt plus user/assistant turns, with tool results lifted into
/// `tool_result` content blocks.
fn transform_messages(request: &CompletionRequest) -> (Option<String>, Vec<Value>) {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages = Vec::new();

    for msg in &request.messages {
        match msg.role {
            MessageRole::System => {
                if let Some(text) = msg.content.as_str() {
                    system_parts.push(text.to_owned());
                }
            },
            MessageRole::Tool => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.content.get("tool_call_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default(),
                        "content": msg.content.get("content")
                            .cloned()
                            .unwrap_or_else(|| msg.content.clone()),
                    }],
                }));
            },
            MessageRole::User | MessageRole::Assistant => {
                let role = if msg.role == MessageRole::Assistant {
                    "assistant"
                } else {
                    "user"
                };
                messages.push(json!({ "role": role, "content": msg.content }));
            },
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, messages)
}

/// OpenAI-format tools → Anthropic tool schema.
fn transform_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter(|t| t.get("type").and_then(Value::as_str) == Some("function"))
        .map(|t| {
            let function = t.get("function").cloned().unwrap_or_default();
            json!({
                "name": function.get("name").and_then(Value::as_str).unwrap_or_default(),
                "description": function.get("description").and_then(Value::as_str).unwrap_or_default(),
                "input_schema": function.get("parameters").cloned()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
            })
        })
        .collect()
}

fn transform_tool_choice(choice: &str) -> Value {
    match choice {
        "required" => json!({ "type": "any" }),
        "none" => json!({ "type": "none" }),
        _ => json!({ "type": "auto" }),
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> ChevalResult<CompletionResult> {
        let model_config = self.model_config(&request.model);
        enforce_context_window(request, &model_config)?;

        let (system, messages) = transform_messages(request);
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(tools) = &request.tools {
            body["tools"] = json!(transform_tools(tools));
        }
        if let Some(choice) = &request.tool_choice {
            body["tool_choice"] = transform_tool_choice(choice);
        }

        let auth = auth_value(&self.config, &self.name)?;
        let headers = [
            ("x-api-key", sensitive_header(auth, &self.name)?),
            (
                "anthropic-version",
                sensitive_header(ANTHROPIC_VERSION, &self.name)?,
            ),
        ];

        let url = format!("{}/messages", self.config.endpoint);
        debug!(provider = %self.name, model = %request.model, "sending messages request");

        let start = std::time::Instant::now();
        let (status, resp) = post_json(&self.client, &self.name, &url, &headers, &body).await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        if status >= 400 {
            return Err(map_status_error(
                status,
                &self.name,
                &extract_error_message(&resp),
            ));
        }

        let input_chars: usize = request
            .messages
            .iter()
            .filter_map(|m| m.content.as_str().map(str::len))
            .sum();
        self.parse_response(&resp, latency_ms, input_chars)
    }

    fn validate_config(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.config.endpoint.is_empty() {
            errors.push(format!("provider '{}': endpoint is required", self.name));
        }
        if self.config.auth.is_blank() {
            errors.push(format!("provider '{}': auth is required", self.name));
        }
        if self.config.kind != ProviderKind::Anthropic {
            errors.push(format!("provider '{}': type must be 'anthropic'", self.name));
        }
        errors
    }

    async fn health_check(&self) -> bool {
        // No models endpoint; send a minimal one-token request.
        let Ok(auth) = auth_value(&self.config, &self.name) else {
            return false;
        };
        let Ok(key_header) = sensitive_header(auth, &self.name) else {
            return false;
        };
        let Ok(version_header) = sensitive_header(ANTHROPIC_VERSION, &self.name) else {
            return false;
        };

        let body = json!({
            "model": "claude-haiku-4-5",
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        });
        let url = format!("{}/messages", self.config.endpoint);
        matches!(
            post_json(
                &self.client,
                &self.name,
                &url,
                &[("x-api-key", key_header), ("anthropic-version", version_header)],
                &body,
            )
            .await,
            Ok((200, _))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cheval_config::SecretString;
    use cheval_core::Message;
    use std::collections::BTreeMap;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter::new(
            "anthropic",
            ProviderConfig {
                kind: ProviderKind::Anthropic,
                endpoint: "https://api.anthropic.com/v1".to_owned(),
                auth: SecretString::new("sk-ant-test-abcdefgh"),
                models: BTreeMap::new(),
                connect_timeout: 10.0,
                read_timeout: 120.0,
                write_timeout: 30.0,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_system_messages_merged() {
        let request = CompletionRequest::new(
            vec![
                Message::system("first"),
                Message::system("second"),
                Message::user("hello"),
            ],
            "claude-sonnet-4-6",
        );
        let (system, messages) = transform_messages(&request);
        assert_eq!(system.as_deref(), Some("first\n\nsecond"));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn test_tools_transformed_to_anthropic_schema() {
        let tools = vec![json!({
            "type": "function",
            "function": {
                "name": "search",
                "description": "find things",
                "parameters": { "type": "object", "properties": { "q": { "type": "string" } } }
            }
        })];
        let out = transform_tools(&tools);
        assert_eq!(out[0]["name"], "search");
        assert!(out[0].get("input_schema").is_some());
        assert!(out[0].get("parameters").is_none());
    }

    #[test]
    fn test_tool_choice_mapping() {
        assert_eq!(transform_tool_choice("auto")["type"], "auto");
        assert_eq!(transform_tool_choice("required")["type"], "any");
        assert_eq!(transform_tool_choice("none")["type"], "none");
        assert_eq!(transform_tool_choice("bogus")["type"], "auto");
    }

    #[test]
    fn test_parse_extracts_thinking_and_tools() {
        let adapter = adapter();
        let resp = json!({
            "model": "claude-sonnet-4-6",
            "content": [
                { "type": "thinking", "thinking": "pondering" },
                { "type": "text", "text": "answer" },
                { "type": "tool_use", "id": "tu_1", "name": "grep",
                  "input": { "pattern": "fn main" } }
            ],
            "usage": { "input_tokens": 12, "output_tokens": 8 }
        });

        let result = adapter.parse_response(&resp, 5, 0).unwrap();
        assert_eq!(result.content, "answer");
        assert_eq!(result.thinking.as_deref(), Some("pondering"));
        let calls = result.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "grep");
        // Structured input serialized to a JSON string.
        let parsed: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(parsed["pattern"], "fn main");
        assert_eq!(result.usage.input_tokens, 12);
    }

    #[test]
    fn test_parse_no_content_fails() {
        let adapter = adapter();
        let err = adapter.parse_response(&json!({}), 1, 0).unwrap_err();
        assert_eq!(err.kind, cheval_core::ErrorKind::InvalidResponse);
    }

    #[test]
    fn test_validate_config_wrong_kind() {
        let wrong = AnthropicAdapter::new(
            "anthropic",
            ProviderConfig {
                kind: ProviderKind::Openai,
                endpoint: "https://api.anthropic.com/v1".to_owned(),
                auth: SecretString::new("sk-ant-x"),
                models: BTreeMap::new(),
                connect_timeout: 10.0,
                read_timeout: 120.0,
                write_timeout: 30.0,
            },
        )
        .unwrap();
        assert_eq!(wrong.validate_config().len(), 1);
    }
}
