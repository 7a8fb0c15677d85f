//! OpenAI adapter, also covering OpenAI-compatible endpoints.
//!
//! The canonical request shape is the OpenAI chat schema, so the
//! translation here is mostly pass-through. The one wire quirk is the
//! output-length parameter name, which newer model families rename;
//! the model config's `token_param` supplies it.

use async_trait::async_trait;
use cheval_config::{ModelConfig, ProviderConfig, ProviderKind};
use cheval_core::{
    ChevalResult, CompletionRequest, CompletionResult, ToolCall, Usage,
};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::adapter::{
    auth_value, build_client, empty_response_error, enforce_context_window, estimated_usage_warned,
    extract_error_message, get_json, map_status_error, post_json, sensitive_header,
    ProviderAdapter,
};

/// Adapter for OpenAI and OpenAI-compatible APIs.
pub struct OpenAiAdapter {
    name: String,
    config: ProviderConfig,
    client: Client,
}

impl OpenAiAdapter {
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

    fn build_body(&self, request: &CompletionRequest, model_config: &ModelConfig) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
        });
        body[model_config.token_param.as_str()] = json!(request.max_tokens);

        if let Some(tools) = &request.tools {
            body["tools"] = json!(tools);
        }
        if let Some(tool_choice) = &request.tool_choice {
            body["tool_choice"] = json!(tool_choice);
        }
        body
    }

    fn parse_response(&self, resp: &Value, latency_ms: u64, input_chars: usize) -> ChevalResult<CompletionResult> {
        let Some(message) = resp
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
        else {
            return Err(empty_response_error(&self.name, "no choices in response"));
        };

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| calls.iter().map(normalize_tool_call).collect::<Vec<_>>())
            .filter(|calls: &Vec<ToolCall>| !calls.is_empty());

        let usage = match resp.get("usage").filter(|u| !u.is_null()) {
            Some(usage) => Usage::actual(
                usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                usage
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                usage
                    .get("completion_tokens_details")
                    .and_then(|d| d.get("reasoning_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            ),
            None => estimated_usage_warned(&self.name, "unknown", input_chars, content.len()),
        };

        Ok(CompletionResult {
            content,
            tool_calls,
            // OpenAI does not expose thinking traces; degrade silently.
            thinking: None,
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

/// Normalize one tool call to the canonical shape. Arguments emerge as
/// a JSON string whether the backend sent a string or an object.
fn normalize_tool_call(raw: &Value) -> ToolCall {
    let function = raw.get("function").cloned().unwrap_or_default();
    let arguments = match function.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_owned(),
    };
    ToolCall::new(
        raw.get("id").and_then(Value::as_str).unwrap_or_default(),
        function
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default(),
        arguments,
    )
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> ChevalResult<CompletionResult> {
        let model_config = self.model_config(&request.model);
        enforce_context_window(request, &model_config)?;

        let body = self.build_body(request, &model_config);
        let auth = auth_value(&self.config, &self.name)?;
        let headers = [(
            "Authorization",
            sensitive_header(&format!("Bearer {auth}"), &self.name)?,
        )];

        let url = format!("{}/chat/completions", self.config.endpoint);
        debug!(provider = %self.name, model = %request.model, "sending chat completion");

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
        if !matches!(
            self.config.kind,
            ProviderKind::Openai | ProviderKind::OpenaiCompat
        ) {
            errors.push(format!(
                "provider '{}': type must be 'openai' or 'openai_compat'",
                self.name
            ));
        }
        errors
    }

    async fn health_check(&self) -> bool {
        let Ok(auth) = auth_value(&self.config, &self.name) else {
            return false;
        };
        let Ok(header) = sensitive_header(&format!("Bearer {auth}"), &self.name) else {
            return false;
        };
        let url = format!("{}/models", self.config.endpoint);
        matches!(
            get_json(&self.client, &self.name, &url, &[("Authorization", header)]).await,
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

    fn adapter() -> OpenAiAdapter {
        let mut models = BTreeMap::new();
        models.insert(
            "gpt-5.2".to_owned(),
            ModelConfig {
                token_param: "max_completion_tokens".to_owned(),
                ..ModelConfig::default()
            },
        );
        OpenAiAdapter::new(
            "openai",
            ProviderConfig {
                kind: ProviderKind::Openai,
                endpoint: "https://api.openai.com/v1".to_owned(),
                auth: SecretString::new("sk-test-key-abcdefgh"),
                models,
                connect_timeout: 10.0,
                read_timeout: 120.0,
                write_timeout: 30.0,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_body_uses_configured_token_param() {
        let adapter = adapter();
        let mut request =
            CompletionRequest::new(vec![Message::user("hi")], "gpt-5.2");
        request.max_tokens = 512;
        let model_config = adapter.model_config("gpt-5.2");

        let body = adapter.build_body(&request, &model_config);
        assert_eq!(body["max_completion_tokens"], 512);
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["model"], "gpt-5.2");
    }

    #[test]
    fn test_unregistered_model_uses_default_param() {
        let adapter = adapter();
        let request = CompletionRequest::new(vec![Message::user("hi")], "gpt-other");
        let model_config = adapter.model_config("gpt-other");
        let body = adapter.build_body(&request, &model_config);
        assert!(body.get("max_tokens").is_some());
    }

    #[test]
    fn test_parse_response_with_string_arguments() {
        let adapter = adapter();
        let resp = json!({
            "model": "gpt-5.2",
            "choices": [{
                "message": {
                    "content": "calling a tool",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "search", "arguments": "{\"q\":\"x\"}" }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5 }
        });

        let result = adapter.parse_response(&resp, 42, 100).unwrap();
        assert_eq!(result.content, "calling a tool");
        let calls = result.tool_calls.unwrap();
        assert_eq!(calls[0].function.arguments, "{\"q\":\"x\"}");
        assert_eq!(result.usage.input_tokens, 10);
        assert_eq!(result.usage.source, cheval_core::UsageSource::Actual);
    }

    #[test]
    fn test_parse_response_object_arguments_become_string() {
        let adapter = adapter();
        let resp = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_2",
                        "function": { "name": "lookup", "arguments": { "key": "value" } }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        });

        let result = adapter.parse_response(&resp, 1, 0).unwrap();
        let calls = result.tool_calls.unwrap();
        let parsed: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(parsed["key"], "value");
    }

    #[test]
    fn test_parse_response_missing_usage_estimates() {
        let adapter = adapter();
        let resp = json!({
            "choices": [{ "message": { "content": "seven chars long response" } }]
        });
        let result = adapter.parse_response(&resp, 1, 350).unwrap();
        assert_eq!(result.usage.source, cheval_core::UsageSource::Estimated);
        assert_eq!(result.usage.input_tokens, 100);
    }

    #[test]
    fn test_parse_response_no_choices_fails() {
        let adapter = adapter();
        let resp = json!({ "choices": [] });
        let err = adapter.parse_response(&resp, 1, 0).unwrap_err();
        assert_eq!(err.kind, cheval_core::ErrorKind::InvalidResponse);
    }

    #[test]
    fn test_parse_reasoning_tokens() {
        let adapter = adapter();
        let resp = json!({
            "choices": [{ "message": { "content": "ok" } }],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 5,
                "completion_tokens_details": { "reasoning_tokens": 3 }
            }
        });
        let result = adapter.parse_response(&resp, 1, 0).unwrap();
        assert_eq!(result.usage.reasoning_tokens, 3);
    }

    #[test]
    fn test_validate_config_clean() {
        assert!(adapter().validate_config().is_empty());
    }

    #[test]
    fn test_validate_config_missing_endpoint() {
        let bad = OpenAiAdapter::new(
            "openai",
            ProviderConfig {
                kind: ProviderKind::Openai,
                endpoint: String::new(),
                auth: SecretString::new(""),
                models: BTreeMap::new(),
                connect_timeout: 10.0,
                read_timeout: 120.0,
                write_timeout: 30.0,
            },
        )
        .unwrap();
        let errors = bad.validate_config();
        assert_eq!(errors.len(), 2);
    }
}
