//! Provider adapter contract and shared HTTP plumbing.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use cheval_config::{ModelConfig, ProviderConfig, ProviderKind};
use cheval_core::redaction::redact_str;
use cheval_core::{ChevalError, ChevalResult, CompletionRequest, CompletionResult, ErrorKind};
use reqwest::header::HeaderValue;
use reqwest::Client;
use serde_json::Value;

/// Optional long-running interaction capability.
///
/// Adapters expose this through [`ProviderAdapter::interactions`]; the
/// orchestrator probes the capability instead of guessing by provider
/// name.
#[async_trait]
pub trait InteractionSupport: Send + Sync {
    /// Start a long-running interaction; returns the interaction id.
    async fn create_interaction(
        &self,
        request: &CompletionRequest,
        model_config: &ModelConfig,
        store: bool,
    ) -> ChevalResult<String>;

    /// Poll an interaction until a terminal state or the deadline.
    /// Returns the provider's completed-interaction object.
    async fn poll_interaction(
        &self,
        interaction_id: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> ChevalResult<Value>;

    /// Best-effort, idempotent cancellation. `Ok(true)` when accepted;
    /// cancelling a completed interaction is a success.
    async fn cancel_interaction(&self, interaction_id: &str) -> ChevalResult<bool>;
}

/// The contract every provider implementation satisfies.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name as configured.
    fn provider(&self) -> &str;

    /// Send a completion request and return the normalized result.
    async fn complete(&self, request: &CompletionRequest) -> ChevalResult<CompletionResult>;

    /// Validate provider-specific configuration; returns error strings.
    fn validate_config(&self) -> Vec<String>;

    /// Quick reachability probe.
    async fn health_check(&self) -> bool;

    /// Long-running interaction capability, when supported.
    fn interactions(&self) -> Option<&dyn InteractionSupport> {
        None
    }
}

/// Select and construct the adapter for a provider by its configured
/// `type`.
///
/// # Errors
///
/// `INVALID_CONFIG` for an unusable provider configuration.
pub fn get_adapter(
    name: &str,
    config: &ProviderConfig,
    run_dir: &Path,
) -> ChevalResult<Box<dyn ProviderAdapter>> {
    let adapter: Box<dyn ProviderAdapter> = match config.kind {
        ProviderKind::Openai | ProviderKind::OpenaiCompat => {
            Box::new(crate::openai::OpenAiAdapter::new(name, config.clone())?)
        },
        ProviderKind::Anthropic => {
            Box::new(crate::anthropic::AnthropicAdapter::new(name, config.clone())?)
        },
        ProviderKind::Google => Box::new(crate::google::GoogleAdapter::new(
            name,
            config.clone(),
            run_dir,
        )?),
    };
    Ok(adapter)
}

/// Build the HTTP client for a provider with its configured timeouts.
pub(crate) fn build_client(config: &ProviderConfig) -> ChevalResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs_f64(config.connect_timeout))
        .timeout(Duration::from_secs_f64(
            config.connect_timeout + config.read_timeout,
        ))
        .build()
        .map_err(|e| ChevalError::invalid_config(format!("HTTP client build failed: {e}")))
}

/// Resolve the auth value for a provider, wrapping failures uniformly.
///
/// # Errors
///
/// `INVALID_CONFIG` when no auth is configured or the value is blank.
pub fn auth_value<'a>(config: &'a ProviderConfig, provider: &str) -> ChevalResult<&'a str> {
    if config.auth.is_blank() {
        return Err(ChevalError::invalid_config(format!(
            "API key is empty for provider '{provider}'"
        )));
    }
    Ok(config.auth.expose())
}

/// Build a header value marked sensitive so HTTP-layer logging never
/// emits it.
pub(crate) fn sensitive_header(value: &str, provider: &str) -> ChevalResult<HeaderValue> {
    let mut header = HeaderValue::try_from(value).map_err(|e| {
        ChevalError::invalid_config(format!(
            "invalid API key characters for provider '{provider}': {e}"
        ))
    })?;
    header.set_sensitive(true);
    Ok(header)
}

/// Best-effort token estimation over the request messages.
///
/// A conservative chars/3.5 heuristic; good enough for preflight and
/// for estimated usage when the provider omits counts.
#[must_use]
pub fn estimate_tokens(request: &CompletionRequest) -> u64 {
    let chars: usize = request
        .messages
        .iter()
        .map(|m| match &m.content {
            Value::String(s) => s.len(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str).map(str::len))
                .sum(),
            _ => 0,
        })
        .sum();
    estimate_tokens_for_text_len(chars)
}

/// The chars/3.5 heuristic on a raw character count.
#[must_use]
pub fn estimate_tokens_for_text_len(chars: usize) -> u64 {
    (chars as f64 / 3.5) as u64
}

/// Check that the input plus the reserved output fits the context
/// window.
///
/// # Errors
///
/// `CONTEXT_TOO_LARGE` when the estimate exceeds the available space.
pub fn enforce_context_window(
    request: &CompletionRequest,
    model_config: &ModelConfig,
) -> ChevalResult<()> {
    let reserved = u64::from(request.max_tokens);
    let available = model_config.context_window.saturating_sub(reserved);
    let estimated = estimate_tokens(request);
    if estimated > available {
        return Err(ChevalError::context_too_large(
            estimated,
            available,
            model_config.context_window,
        ));
    }
    Ok(())
}

/// Map an HTTP status to the normalized error taxonomy.
///
/// 400 → `INVALID_INPUT`, 401 → `INVALID_CONFIG`, 403 →
/// `PROVIDER_UNAVAILABLE`, 404 → `INVALID_INPUT`, 429 → `RATE_LIMITED`,
/// 5xx and everything else → `PROVIDER_UNAVAILABLE`. The message is
/// redacted before it leaves this function.
#[must_use]
pub fn map_status_error(status: u16, provider: &str, message: &str) -> ChevalError {
    let message = redact_str(message);
    match status {
        400 => ChevalError::invalid_input(format!("{provider} API error (400): {message}")),
        401 => ChevalError::invalid_config(format!(
            "{provider} API authentication failed (401): {message}"
        )),
        403 => ChevalError::provider_unavailable(provider, format!("permission denied (403): {message}")),
        404 => ChevalError::invalid_input(format!("{provider} model not found (404): {message}")),
        429 => ChevalError::rate_limited(provider),
        status => {
            ChevalError::provider_unavailable(provider, format!("HTTP {status}: {message}"))
        },
    }
}

/// Extract the error message from a provider error body of the common
/// `{"error": {"message": ...}}` shape.
#[must_use]
pub fn extract_error_message(body: &Value) -> String {
    match body.get("error") {
        Some(Value::Object(error)) => error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| body.to_string(), ToOwned::to_owned),
        Some(other) => other.to_string(),
        None => body.to_string(),
    }
}

/// POST a JSON body and return `(status, parsed_body)`.
///
/// A body that fails to parse as JSON is wrapped in the common error
/// shape so status mapping still works.
///
/// # Errors
///
/// `PROVIDER_UNAVAILABLE` on network failure or timeout.
pub(crate) async fn post_json(
    client: &Client,
    provider: &str,
    url: &str,
    headers: &[(&'static str, HeaderValue)],
    body: &Value,
) -> ChevalResult<(u16, Value)> {
    let mut req = client.post(url).json(body);
    for (name, value) in headers {
        req = req.header(*name, value.clone());
    }

    let response = req.send().await.map_err(|e| {
        ChevalError::provider_unavailable(provider, redact_str(&e.to_string()))
    })?;
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let parsed = serde_json::from_str(&text)
        .unwrap_or_else(|_| serde_json::json!({ "error": { "message": text } }));
    Ok((status, parsed))
}

/// GET and return `(status, parsed_body)`; parse failures are wrapped
/// like [`post_json`].
pub(crate) async fn get_json(
    client: &Client,
    provider: &str,
    url: &str,
    headers: &[(&'static str, HeaderValue)],
) -> ChevalResult<(u16, Value)> {
    let mut req = client.get(url);
    for (name, value) in headers {
        req = req.header(*name, value.clone());
    }

    let response = req.send().await.map_err(|e| {
        ChevalError::provider_unavailable(provider, redact_str(&e.to_string()))
    })?;
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let parsed = serde_json::from_str(&text)
        .unwrap_or_else(|_| serde_json::json!({ "error": { "message": text } }));
    Ok((status, parsed))
}

/// Usage fallback: mark estimated and log when the provider omitted
/// counts.
pub(crate) fn estimated_usage_warned(
    provider: &str,
    model: &str,
    input_chars: usize,
    output_chars: usize,
) -> cheval_core::Usage {
    tracing::warn!(
        provider,
        model,
        "provider response missing usage counts, using estimate"
    );
    cheval_core::Usage::estimated(
        estimate_tokens_for_text_len(input_chars),
        estimate_tokens_for_text_len(output_chars),
    )
}

/// Shared guard for result kinds that must not silently succeed.
pub(crate) fn empty_response_error(provider: &str, detail: &str) -> ChevalError {
    ChevalError::new(
        ErrorKind::InvalidResponse,
        format!("{provider} returned a response the adapter cannot normalize: {detail}"),
    )
}
