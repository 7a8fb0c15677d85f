//! Google Gemini adapter: generateContent plus the Interactions API
//! for deep research.
//!
//! Standard models go through `models/<id>:generateContent` with
//! model-aware thinking config. Models whose `api_mode` is
//! `interactions` run the long-running create → poll → cancel lifecycle
//! with crash-recoverable metadata and citation extraction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use cheval_config::{ModelConfig, ProviderConfig, ProviderKind};
use cheval_core::{
    ChevalError, ChevalResult, CompletionRequest, CompletionResult, MessageRole, Usage,
};
use rand::Rng;
use reqwest::header::HeaderValue;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::adapter::{
    auth_value, build_client, empty_response_error, enforce_context_window, estimate_tokens,
    extract_error_message, get_json, map_status_error, post_json, sensitive_header,
    InteractionSupport, ProviderAdapter,
};
use crate::interactions::{normalize_citations, InteractionRegistry};
use crate::semaphore::FlockSemaphore;

/// Statuses worth retrying inside a single completion call.
const RETRYABLE_STATUSES: &[u16] = &[429, 500, 503];

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(8);
const JITTER_MAX_MS: u64 = 500;

/// Intermediate poll states that are expected and not worth a warning.
const EXPECTED_PENDING_STATES: &[&str] = &["processing", "pending", "running", "queued"];
const COMPLETED_STATES: &[&str] = &["completed", "done", "succeeded"];
const FAILED_STATES: &[&str] = &["failed", "error", "cancelled"];

/// Adapter for the Google Gemini API.
pub struct GoogleAdapter {
    name: String,
    config: ProviderConfig,
    client: Client,
    api_version: String,
    run_dir: PathBuf,
    registry: InteractionRegistry,
}

impl GoogleAdapter {
    /// Construct the adapter.
    ///
    /// # Errors
    ///
    /// `INVALID_CONFIG` when the HTTP client cannot be built.
    pub fn new(name: &str, config: ProviderConfig, run_dir: &Path) -> ChevalResult<Self> {
        let client = build_client(&config)?;
        Ok(Self {
            name: name.to_owned(),
            config,
            client,
            api_version: "v1beta".to_owned(),
            run_dir: run_dir.to_path_buf(),
            registry: InteractionRegistry::new(run_dir),
        })
    }

    fn model_config(&self, model_id: &str) -> ModelConfig {
        self.config
            .models
            .get(model_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Base URL + API version in one place. An endpoint that already
    /// carries a version suffix is stripped so versions never double
    /// up; `extra.api_version` overrides the default.
    fn build_url(&self, path: &str, model_config: &ModelConfig) -> String {
        let mut base = self.config.endpoint.trim_end_matches('/').to_owned();
        for version in ["v1beta", "v1alpha", "v1"] {
            if let Some(stripped) = base.strip_suffix(&format!("/{version}")) {
                base = stripped.to_owned();
                break;
            }
        }
        let version = model_config
            .extra
            .as_ref()
            .and_then(|e| e.api_version.clone())
            .unwrap_or_else(|| self.api_version.clone());
        format!("{base}/{version}/{path}")
    }

    fn auth_header(&self) -> ChevalResult<HeaderValue> {
        let auth = auth_value(&self.config, &self.name)?;
        sensitive_header(auth, &self.name)
    }

    /// POST with bounded retry on transient statuses, exponential
    /// backoff capped at [`MAX_BACKOFF`] plus jitter.
    async fn post_with_retry(
        &self,
        url: &str,
        headers: &[(&'static str, HeaderValue)],
        body: &Value,
    ) -> ChevalResult<(u16, Value)> {
        let mut last = (0u16, Value::Null);

        for attempt in 0..=MAX_RETRIES {
            let (status, resp) = post_json(&self.client, &self.name, url, headers, body).await?;
            if !RETRYABLE_STATUSES.contains(&status) {
                return Ok((status, resp));
            }
            last = (status, resp);

            if attempt < MAX_RETRIES {
                let backoff = INITIAL_BACKOFF
                    .saturating_mul(1 << attempt)
                    .min(MAX_BACKOFF);
                let jitter =
                    Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MAX_MS));
                let delay = backoff + jitter;
                warn!(
                    provider = %self.name,
                    attempt = attempt + 1,
                    status,
                    delay_ms = delay.as_millis() as u64,
                    "retrying transient provider status"
                );
                tokio::time::sleep(delay).await;
            }
        }
        Ok(last)
    }

    async fn complete_standard(
        &self,
        request: &CompletionRequest,
        model_config: &ModelConfig,
    ) -> ChevalResult<CompletionResult> {
        enforce_context_window(request, model_config)?;

        let (system_instruction, contents) = translate_messages(request, model_config)?;

        let mut generation_config = json!({
            "temperature": request.temperature,
            "maxOutputTokens": request.max_tokens,
        });
        if let Some(thinking) = build_thinking_config(&request.model, model_config) {
            generation_config["thinkingConfig"] = thinking;
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if let Some(system) = system_instruction {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        let headers = [("x-goog-api-key", self.auth_header()?)];
        let url = self.build_url(
            &format!("models/{}:generateContent", request.model),
            model_config,
        );

        let semaphore = FlockSemaphore::new(
            "google-standard",
            5,
            &self.run_dir,
            Duration::from_secs(30),
        );
        let _slot = semaphore.acquire().await?;

        let start = std::time::Instant::now();
        let (status, resp) = self.post_with_retry(&url, &headers, &body).await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        if status >= 400 {
            return Err(map_status_error(
                status,
                &self.name,
                &extract_error_message(&resp),
            ));
        }

        parse_generate_response(
            &resp,
            &request.model,
            latency_ms,
            &self.name,
            estimate_tokens(request),
        )
    }

    async fn complete_deep_research(
        &self,
        request: &CompletionRequest,
        model_config: &ModelConfig,
    ) -> ChevalResult<CompletionResult> {
        let extra = model_config.extra.clone().unwrap_or_default();
        let poll_interval = Duration::from_secs(extra.polling_interval_s.unwrap_or(5));
        let max_poll_time = Duration::from_secs(extra.max_poll_time_s.unwrap_or(600));
        let store = extra.store.unwrap_or(false);

        enforce_context_window(request, model_config)?;

        // Deep-research queues run long; the semaphore deadline follows
        // the poll deadline rather than the standard 30s.
        let semaphore = FlockSemaphore::new(
            "google-deep-research",
            3,
            &self.run_dir,
            max_poll_time,
        );
        let _slot = semaphore.acquire().await?;

        let interaction_id = self
            .create_interaction(request, model_config, store)
            .await?;

        let start = std::time::Instant::now();
        let result = self
            .poll_interaction(&interaction_id, poll_interval, max_poll_time)
            .await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let normalized = normalize_citations(
            result
                .get("output")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );
        let content = normalized.to_string();

        let usage = match result.get("usageMetadata").filter(|u| !u.is_null()) {
            Some(meta) => Usage::actual(
                meta.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0),
                meta.get("candidatesTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                0,
            ),
            None => Usage::estimated(estimate_tokens(request), 0),
        };

        Ok(CompletionResult {
            content,
            tool_calls: None,
            thinking: None,
            usage,
            model: request.model.clone(),
            latency_ms,
            provider: self.name.clone(),
            interaction_id: Some(interaction_id),
        })
    }
}

/// Translate canonical messages to Gemini `contents`.
///
/// System messages collect into a single `systemInstruction`; user
/// stays `user` and assistant maps to `model`. Structured content
/// blocks are not supported by this adapter and fail with a capability
/// hint when the model lacks multimodal support.
fn translate_messages(
    request: &CompletionRequest,
    model_config: &ModelConfig,
) -> ChevalResult<(Option<String>, Vec<Value>)> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut contents = Vec::new();

    for msg in &request.messages {
        match &msg.content {
            Value::String(text) => {
                if text.trim().is_empty() {
                    continue;
                }
                if msg.role == MessageRole::System {
                    system_parts.push(text.clone());
                    continue;
                }
                let role = if msg.role == MessageRole::Assistant {
                    "model"
                } else {
                    "user"
                };
                contents.push(json!({ "role": role, "parts": [{ "text": text }] }));
            },
            Value::Array(blocks) => {
                let block_types: Vec<&str> = blocks
                    .iter()
                    .map(|b| b.get("type").and_then(Value::as_str).unwrap_or("unknown"))
                    .collect();
                let mut message = format!(
                    "Google Gemini adapter does not support array content blocks \
                     (found types: {}).",
                    block_types.join(", ")
                );
                if !model_config.has_capability("images") && !model_config.has_capability("vision")
                {
                    message.push_str(
                        " This model lacks multimodal capabilities. Consider an OpenAI or \
                         Anthropic model for image/multi-part content.",
                    );
                }
                return Err(ChevalError::invalid_input(message));
            },
            _ => {},
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    Ok((system, contents))
}

/// Model-aware thinking config: Gemini 3 takes a string level, Gemini
/// 2.5 takes an integer budget (`-1` dynamic, `0` disables thinking
/// entirely). Other model families get none.
fn build_thinking_config(model_id: &str, model_config: &ModelConfig) -> Option<Value> {
    let extra = model_config.extra.as_ref();

    if model_id.starts_with("gemini-3") {
        let level = extra
            .and_then(|e| e.thinking_level.clone())
            .unwrap_or_else(|| "high".to_owned());
        return Some(json!({ "thinkingLevel": level }));
    }

    if model_id.starts_with("gemini-2.5") {
        let budget = extra.and_then(|e| e.thinking_budget).unwrap_or(-1);
        if budget == 0 {
            return None;
        }
        return Some(json!({ "thinkingBudget": budget }));
    }

    None
}

fn parse_generate_response(
    resp: &Value,
    model_id: &str,
    latency_ms: u64,
    provider: &str,
    estimated_input: u64,
) -> ChevalResult<CompletionResult> {
    let Some(candidate) = resp
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        return Err(empty_response_error(
            provider,
            "empty candidates list; check model availability and request validity",
        ));
    };

    let finish_reason = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .unwrap_or("");

    match finish_reason {
        "SAFETY" => {
            let ratings = candidate
                .get("safetyRatings")
                .and_then(Value::as_array)
                .map(|rs| {
                    rs.iter()
                        .map(|r| {
                            format!(
                                "{}={}",
                                r.get("category").and_then(Value::as_str).unwrap_or("?"),
                                r.get("probability").and_then(Value::as_str).unwrap_or("?")
                            )
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            return Err(ChevalError::invalid_input(format!(
                "response blocked by safety filters: {ratings}"
            )));
        },
        "RECITATION" => {
            return Err(ChevalError::invalid_input(
                "response blocked due to recitation (potential copyright content)",
            ));
        },
        "MAX_TOKENS" => {
            warn!(model = model_id, "response truncated at max output tokens");
        },
        "STOP" | "OTHER" | "" => {},
        unknown => {
            warn!(model = model_id, reason = unknown, "unknown finish reason");
        },
    }

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut text_parts = Vec::new();
    let mut thinking_parts = Vec::new();
    for part in &parts {
        let Some(text) = part.get("text").and_then(Value::as_str) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            thinking_parts.push(text.to_owned());
        } else {
            text_parts.push(text.to_owned());
        }
    }

    let content = text_parts.join("\n");
    let thinking = (!thinking_parts.is_empty()).then(|| thinking_parts.join("\n"));

    let usage = match resp.get("usageMetadata").filter(|u| !u.is_null()) {
        Some(meta) => {
            if meta.get("thoughtsTokenCount").is_none() && thinking.is_some() {
                warn!(model = model_id, "usage metadata missing thoughtsTokenCount");
            }
            Usage::actual(
                meta.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0),
                meta.get("candidatesTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                meta.get("thoughtsTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            )
        },
        None => {
            warn!(model = model_id, "usage metadata missing, using estimate");
            Usage::estimated(
                estimated_input,
                crate::adapter::estimate_tokens_for_text_len(content.len()),
            )
        },
    };

    debug!(
        model = model_id,
        latency_ms,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        "google completion finished"
    );

    Ok(CompletionResult {
        content,
        // Tool calls are not supported on this path.
        tool_calls: None,
        thinking,
        usage,
        model: model_id.to_owned(),
        latency_ms,
        provider: provider.to_owned(),
        interaction_id: None,
    })
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> ChevalResult<CompletionResult> {
        let model_config = self.model_config(&request.model);
        match model_config.api_mode {
            Some(cheval_config::ApiMode::Interactions) => {
                self.complete_deep_research(request, &model_config).await
            },
            _ => self.complete_standard(request, &model_config).await,
        }
    }

    fn validate_config(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.config.endpoint.is_empty() {
            errors.push(format!("provider '{}': endpoint is required", self.name));
        }
        if self.config.auth.is_blank() {
            errors.push(format!("provider '{}': auth is required", self.name));
        }
        if self.config.kind != ProviderKind::Google {
            errors.push(format!("provider '{}': type must be 'google'", self.name));
        }
        errors
    }

    async fn health_check(&self) -> bool {
        let Ok(header) = self.auth_header() else {
            return false;
        };
        let url = self.build_url("models", &ModelConfig::default());
        matches!(
            get_json(&self.client, &self.name, &url, &[("x-goog-api-key", header)]).await,
            Ok((status, _)) if status < 400
        )
    }

    fn interactions(&self) -> Option<&dyn InteractionSupport> {
        Some(self)
    }
}

#[async_trait]
impl InteractionSupport for GoogleAdapter {
    async fn create_interaction(
        &self,
        request: &CompletionRequest,
        model_config: &ModelConfig,
        store: bool,
    ) -> ChevalResult<String> {
        let query = request
            .messages
            .iter()
            .find(|m| m.role == MessageRole::User)
            .and_then(|m| m.content.as_str())
            .unwrap_or_default()
            .to_owned();

        let body = json!({ "query": query, "background": true, "store": store });
        let headers = [("x-goog-api-key", self.auth_header()?)];
        let url = self.build_url(
            &format!("models/{}:createInteraction", request.model),
            model_config,
        );

        let (status, resp) = self.post_with_retry(&url, &headers, &body).await?;
        if status >= 400 {
            return Err(map_status_error(
                status,
                &self.name,
                &extract_error_message(&resp),
            ));
        }

        let interaction_id = resp
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        if interaction_id.is_empty() {
            return Err(ChevalError::invalid_input(
                "deep-research createInteraction returned no interaction id",
            ));
        }

        // Crash-recovery metadata; failure to persist must not lose the
        // already-created interaction.
        if let Err(e) = self.registry.record(&interaction_id, &request.model) {
            warn!(interaction_id, error = %e, "failed to persist interaction metadata");
        }

        Ok(interaction_id)
    }

    async fn poll_interaction(
        &self,
        interaction_id: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> ChevalResult<Value> {
        let headers = [("x-goog-api-key", self.auth_header()?)];
        let url = self.build_url(interaction_id, &ModelConfig::default());

        let start = std::time::Instant::now();
        let mut last_progress_log = start;
        let mut transient_failures = 0u32;

        loop {
            if start.elapsed() >= timeout {
                return Err(ChevalError::timeout(format!(
                    "deep-research poll timed out after {}s for {interaction_id}",
                    timeout.as_secs()
                )));
            }

            let (status, resp) = get_json(&self.client, &self.name, &url, &headers).await?;

            if RETRYABLE_STATUSES.contains(&status) {
                transient_failures += 1;
                if transient_failures > MAX_RETRIES {
                    return Err(map_status_error(
                        status,
                        &self.name,
                        &extract_error_message(&resp),
                    ));
                }
                let delay = poll_interval
                    .saturating_mul(1 << transient_failures)
                    .min(Duration::from_secs(30));
                warn!(
                    interaction_id,
                    attempt = transient_failures,
                    status,
                    "retrying transient poll failure"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            if status >= 400 {
                return Err(map_status_error(
                    status,
                    &self.name,
                    &extract_error_message(&resp),
                ));
            }
            transient_failures = 0;

            // Schema tolerance: accept either `status` or `state`.
            let state = resp
                .get("status")
                .or_else(|| resp.get("state"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();

            if COMPLETED_STATES.contains(&state.as_str()) {
                return Ok(resp);
            }
            if FAILED_STATES.contains(&state.as_str()) {
                return Err(ChevalError::provider_unavailable(
                    &self.name,
                    format!("deep research failed: {}", extract_error_message(&resp)),
                ));
            }
            if !state.is_empty() && !EXPECTED_PENDING_STATES.contains(&state.as_str()) {
                warn!(interaction_id, state = %state, "unknown interaction status");
            }

            // Progress heartbeat every ~30s; never includes prompt content.
            if last_progress_log.elapsed() >= Duration::from_secs(30) {
                info!(
                    interaction_id,
                    elapsed_s = start.elapsed().as_secs(),
                    state = %state,
                    "deep research still running"
                );
                last_progress_log = std::time::Instant::now();
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn cancel_interaction(&self, interaction_id: &str) -> ChevalResult<bool> {
        let headers = [("x-goog-api-key", self.auth_header()?)];
        let url = self.build_url(&format!("{interaction_id}:cancel"), &ModelConfig::default());

        // Idempotent: 200 = cancelled, 4xx = already done. Only a 5xx
        // means the cancellation was not accepted.
        match post_json(&self.client, &self.name, &url, &headers, &json!({})).await {
            Ok((status, _)) => Ok(status < 500),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cheval_config::{ModelExtra, SecretString};
    use cheval_core::Message;
    use std::collections::BTreeMap;

    fn adapter(dir: &Path) -> GoogleAdapter {
        let mut models = BTreeMap::new();
        models.insert(
            "gemini-3-pro",
            ModelConfig {
                capabilities: vec!["chat".to_owned()],
                ..ModelConfig::default()
            },
        );
        GoogleAdapter::new(
            "google",
            ProviderConfig {
                kind: ProviderKind::Google,
                endpoint: "https://generativelanguage.googleapis.com/v1beta".to_owned(),
                auth: SecretString::new("AIza-test-key"),
                models: models
                    .into_iter()
                    .map(|(k, v)| (k.to_owned(), v))
                    .collect(),
                connect_timeout: 10.0,
                read_timeout: 120.0,
                write_timeout: 30.0,
            },
            dir,
        )
        .unwrap()
    }

    #[test]
    fn test_build_url_strips_duplicate_version() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        let url = adapter.build_url("models/gemini-3-pro:generateContent", &ModelConfig::default());
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-3-pro:generateContent"
        );
    }

    #[test]
    fn test_build_url_honors_api_version_extra() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        let model = ModelConfig {
            extra: Some(ModelExtra {
                api_version: Some("v1alpha".to_owned()),
                ..ModelExtra::default()
            }),
            ..ModelConfig::default()
        };
        let url = adapter.build_url("models", &model);
        assert!(url.ends_with("/v1alpha/models"));
    }

    #[test]
    fn test_translate_messages_roles() {
        let request = CompletionRequest::new(
            vec![
                Message::system("be brief"),
                Message::user("hello"),
                Message::assistant("hi"),
            ],
            "gemini-3-pro",
        );
        let (system, contents) = translate_messages(&request, &ModelConfig::default()).unwrap();
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn test_translate_rejects_array_content() {
        let mut request = CompletionRequest::new(vec![], "gemini-3-pro");
        request.messages = vec![Message {
            role: MessageRole::User,
            content: serde_json::json!([{ "type": "image", "data": "..." }]),
        }];
        let err = translate_messages(&request, &ModelConfig::default()).unwrap_err();
        assert_eq!(err.kind, cheval_core::ErrorKind::InvalidInput);
        assert!(err.message.contains("image"));
        assert!(err.message.contains("multimodal"));
    }

    #[test]
    fn test_thinking_config_gemini_3_level() {
        let model = ModelConfig {
            extra: Some(ModelExtra {
                thinking_level: Some("medium".to_owned()),
                ..ModelExtra::default()
            }),
            ..ModelConfig::default()
        };
        let thinking = build_thinking_config("gemini-3-pro", &model).unwrap();
        assert_eq!(thinking["thinkingLevel"], "medium");

        let default = build_thinking_config("gemini-3-pro", &ModelConfig::default()).unwrap();
        assert_eq!(default["thinkingLevel"], "high");
    }

    #[test]
    fn test_thinking_config_gemini_25_budget() {
        let dynamic = build_thinking_config("gemini-2.5-flash", &ModelConfig::default()).unwrap();
        assert_eq!(dynamic["thinkingBudget"], -1);

        let disabled = ModelConfig {
            extra: Some(ModelExtra {
                thinking_budget: Some(0),
                ..ModelExtra::default()
            }),
            ..ModelConfig::default()
        };
        assert!(build_thinking_config("gemini-2.5-flash", &disabled).is_none());

        assert!(build_thinking_config("gpt-5.2", &ModelConfig::default()).is_none());
    }

    #[test]
    fn test_parse_response_text_and_thinking() {
        let resp = json!({
            "candidates": [{
                "finishReason": "STOP",
                "content": { "parts": [
                    { "text": "reasoning here", "thought": true },
                    { "text": "the answer" }
                ]}
            }],
            "usageMetadata": {
                "promptTokenCount": 10,
                "candidatesTokenCount": 5,
                "thoughtsTokenCount": 7
            }
        });
        let result = parse_generate_response(&resp, "gemini-3-pro", 3, "google", 0).unwrap();
        assert_eq!(result.content, "the answer");
        assert_eq!(result.thinking.as_deref(), Some("reasoning here"));
        assert_eq!(result.usage.reasoning_tokens, 7);
    }

    #[test]
    fn test_parse_response_safety_block() {
        let resp = json!({
            "candidates": [{
                "finishReason": "SAFETY",
                "safetyRatings": [{ "category": "HARM", "probability": "HIGH" }]
            }]
        });
        let err = parse_generate_response(&resp, "gemini-3-pro", 1, "google", 0).unwrap_err();
        assert_eq!(err.kind, cheval_core::ErrorKind::InvalidInput);
        assert!(err.message.contains("HARM=HIGH"));
    }

    #[test]
    fn test_parse_response_recitation_block() {
        let resp = json!({ "candidates": [{ "finishReason": "RECITATION" }] });
        let err = parse_generate_response(&resp, "gemini-3-pro", 1, "google", 0).unwrap_err();
        assert!(err.message.contains("recitation"));
    }

    #[test]
    fn test_parse_response_empty_candidates() {
        let resp = json!({ "candidates": [] });
        let err = parse_generate_response(&resp, "gemini-3-pro", 1, "google", 0).unwrap_err();
        assert_eq!(err.kind, cheval_core::ErrorKind::InvalidResponse);
    }

    #[test]
    fn test_parse_response_missing_usage_estimates() {
        let resp = json!({
            "candidates": [{
                "finishReason": "STOP",
                "content": { "parts": [{ "text": "x".repeat(35) }] }
            }]
        });
        let result = parse_generate_response(&resp, "gemini-3-pro", 1, "google", 100).unwrap();
        assert_eq!(result.usage.source, cheval_core::UsageSource::Estimated);
        assert_eq!(result.usage.input_tokens, 100);
        assert_eq!(result.usage.output_tokens, 10);
    }

    #[test]
    fn test_interactions_capability_exposed() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        assert!(adapter.interactions().is_some());
    }
}
