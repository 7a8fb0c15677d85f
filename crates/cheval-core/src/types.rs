//! Canonical request/result types for provider adapters.
//!
//! Adapters translate between these shapes and each provider's wire
//! format. The shapes are deliberately close to the OpenAI chat schema,
//! which is the pass-through case.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved alias that always resolves to the in-process runtime.
pub const NATIVE_ALIAS: &str = "native";
/// Provider sentinel for the in-process runtime.
pub const NATIVE_PROVIDER: &str = "claude-code";
/// Model sentinel for the in-process runtime.
pub const NATIVE_MODEL: &str = "session";

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message (instructions).
    System,
    /// User message.
    User,
    /// Assistant message.
    Assistant,
    /// Tool result.
    Tool,
}

/// A message in the conversation.
///
/// Content is kept as a JSON value so structured multimodal blocks pass
/// through untouched; the common case is [`Value::String`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message role.
    pub role: MessageRole,
    /// Message content (string, or provider-specific structured blocks).
    pub content: Value,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Value::String(content.into()),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Value::String(content.into()),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Value::String(content.into()),
        }
    }

    /// Text content, if this message carries a plain string.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

/// Canonical request sent to any provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Ordered conversation messages.
    pub messages: Vec<Message>,
    /// Provider-specific model id (e.g. `gpt-5.2`).
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum output tokens to reserve.
    pub max_tokens: u32,
    /// Tool schemas in OpenAI function format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    /// Tool-choice directive: `auto`, `required`, or `none`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    /// Caller bookkeeping (agent, trace id). Never sent to the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl CompletionRequest {
    /// Create a request with defaults for temperature and output budget.
    pub fn new(messages: Vec<Message>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            temperature: 0.7,
            max_tokens: 4096,
            tools: None,
            tool_choice: None,
            metadata: None,
        }
    }
}

/// Where a usage count came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    /// Counts reported by the provider.
    Actual,
    /// Counts estimated by the adapter.
    Estimated,
}

/// Token usage for a single completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    /// Input (prompt) tokens.
    pub input_tokens: u64,
    /// Output (completion) tokens.
    pub output_tokens: u64,
    /// Reasoning/thinking tokens, when the provider reports them.
    pub reasoning_tokens: u64,
    /// Whether the counts are provider-reported or estimated.
    pub source: UsageSource,
}

impl Usage {
    /// Provider-reported usage.
    #[must_use]
    pub fn actual(input_tokens: u64, output_tokens: u64, reasoning_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            reasoning_tokens,
            source: UsageSource::Actual,
        }
    }

    /// Adapter-estimated usage.
    #[must_use]
    pub fn estimated(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            reasoning_tokens: 0,
            source: UsageSource::Estimated,
        }
    }

    /// Total tokens across all categories.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.reasoning_tokens)
    }
}

/// The function half of a canonical tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFunction {
    /// Tool name.
    pub name: String,
    /// Arguments as a JSON-encoded string, regardless of what the
    /// provider returned.
    pub arguments: String,
}

/// Canonical tool invocation shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id.
    pub id: String,
    /// Function name and JSON-string arguments.
    pub function: ToolFunction,
    /// Always `"function"`.
    #[serde(rename = "type")]
    pub call_type: String,
}

impl ToolCall {
    /// Build a canonical tool call. `arguments` must already be a
    /// JSON-encoded string.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            function: ToolFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
            call_type: "function".to_owned(),
        }
    }
}

/// Canonical result returned from any provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    /// Model response text.
    pub content: String,
    /// Normalized tool calls, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Reasoning/thinking trace, when the backend distinguishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Token usage.
    pub usage: Usage,
    /// Model actually used (may differ from requested).
    pub model: String,
    /// Observed wall-clock latency.
    pub latency_ms: u64,
    /// Provider that served the request.
    pub provider: String,
    /// Long-running interaction id, for cost deduplication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
}

/// Fully resolved provider + model id pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedModel {
    /// Provider name (e.g. `openai`).
    pub provider: String,
    /// Provider-specific model id (e.g. `gpt-5.2`).
    pub model_id: String,
}

impl ResolvedModel {
    /// Construct from provider and model id.
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
        }
    }

    /// The in-process runtime sentinel.
    #[must_use]
    pub fn native() -> Self {
        Self::new(NATIVE_PROVIDER, NATIVE_MODEL)
    }

    /// Whether this resolution targets the in-process runtime.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.provider == NATIVE_PROVIDER
    }

    /// Canonical `provider:model-id` key used by visited sets.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model_id)
    }
}

impl std::fmt::Display for ResolvedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.model_id)
    }
}

/// How strongly an agent requires a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    /// Hard requirement; resolution fails without it.
    Required,
    /// Soft requirement; absence is a warning only.
    Preferred,
}

/// Per-agent model binding with capability requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBinding {
    /// Agent name.
    pub agent: String,
    /// Model reference: alias or `provider:model-id`.
    pub model: String,
    /// Default sampling temperature, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Required capabilities keyed by name.
    #[serde(default)]
    pub requires: BTreeMap<String, Requirement>,
}

impl AgentBinding {
    /// Whether this binding demands the in-process runtime.
    #[must_use]
    pub fn requires_native_runtime(&self) -> bool {
        matches!(
            self.requires.get("native_runtime"),
            Some(Requirement::Required)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text() {
        let msg = Message::user("hello");
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.text(), Some("hello"));

        let structured = Message {
            role: MessageRole::User,
            content: serde_json::json!([{ "type": "text", "text": "hi" }]),
        };
        assert_eq!(structured.text(), None);
    }

    #[test]
    fn test_tool_call_shape() {
        let call = ToolCall::new("call_1", "search", r#"{"query":"x"}"#);
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "search");
        assert!(json["function"]["arguments"].is_string());
    }

    #[test]
    fn test_resolved_model_native() {
        let native = ResolvedModel::native();
        assert!(native.is_native());
        assert_eq!(native.key(), "claude-code:session");
        assert!(!ResolvedModel::new("openai", "gpt-5.2").is_native());
    }

    #[test]
    fn test_binding_native_requirement() {
        let mut binding = AgentBinding {
            agent: "implementing-tasks".to_owned(),
            model: NATIVE_ALIAS.to_owned(),
            temperature: None,
            requires: BTreeMap::new(),
        };
        assert!(!binding.requires_native_runtime());

        binding
            .requires
            .insert("native_runtime".to_owned(), Requirement::Required);
        assert!(binding.requires_native_runtime());

        binding
            .requires
            .insert("native_runtime".to_owned(), Requirement::Preferred);
        assert!(!binding.requires_native_runtime());
    }

    #[test]
    fn test_usage_total_saturates() {
        let usage = Usage::actual(u64::MAX, 1, 0);
        assert_eq!(usage.total(), u64::MAX);
    }
}
