//! Gateway error taxonomy.
//!
//! A single error type crosses the whole dispatch pipeline. Each error
//! carries an [`ErrorKind`] with a stable string code, a retryability
//! flag that drives the retry orchestrator, and an exit code for the
//! CLI boundary. Structured context rides along for the JSON diagnostic
//! payload but is never required for control flow.

use serde_json::{Map, Value};
use thiserror::Error;

/// Result type for gateway operations.
pub type ChevalResult<T> = Result<T, ChevalError>;

/// The fixed error taxonomy carried across the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller-supplied data malformed, agent unknown, exclusive flags.
    InvalidInput,
    /// Config schema/validation failure, bad secret reference.
    InvalidConfig,
    /// Attempt to remote-route a native-only agent.
    NativeRuntimeRequired,
    /// Credential absent from every chain provider.
    MissingApiKey,
    /// Preflight token estimate + reserved output exceeds model window.
    ContextTooLarge,
    /// Provider returned 429.
    RateLimited,
    /// Provider 5xx / 403 / network failure / breaker open.
    ProviderUnavailable,
    /// Global attempt budget reached.
    RetriesExhausted,
    /// Daily spend at or over limit under the `block` policy.
    BudgetExceeded,
    /// Provider returned a schema the adapter cannot normalize.
    InvalidResponse,
    /// Long-running task started but not yet complete.
    InteractionPending,
    /// Integer cost multiplication would lose precision.
    BudgetOverflow,
    /// Absolute deadline elapsed (poll loops, semaphore acquire).
    Timeout,
    /// Unclassified provider-side failure.
    ApiError,
}

impl ErrorKind {
    /// Stable string code used in diagnostics and the wire contract.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::NativeRuntimeRequired => "NATIVE_RUNTIME_REQUIRED",
            Self::MissingApiKey => "MISSING_API_KEY",
            Self::ContextTooLarge => "CONTEXT_TOO_LARGE",
            Self::RateLimited => "RATE_LIMITED",
            Self::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            Self::RetriesExhausted => "RETRIES_EXHAUSTED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::InvalidResponse => "INVALID_RESPONSE",
            Self::InteractionPending => "INTERACTION_PENDING",
            Self::BudgetOverflow => "BUDGET_OVERFLOW",
            Self::Timeout => "TIMEOUT",
            Self::ApiError => "API_ERROR",
        }
    }

    /// Whether the retry orchestrator may retry this error.
    #[must_use]
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ProviderUnavailable | Self::ApiError
        )
    }

    /// Process exit code for the CLI boundary.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::ApiError | Self::RateLimited | Self::ProviderUnavailable | Self::RetriesExhausted => 1,
            Self::InvalidInput | Self::InvalidConfig | Self::NativeRuntimeRequired => 2,
            Self::Timeout => 3,
            Self::MissingApiKey => 4,
            Self::InvalidResponse => 5,
            Self::BudgetExceeded | Self::BudgetOverflow => 6,
            Self::ContextTooLarge => 7,
            Self::InteractionPending => 8,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Error carried across all gateway operations.
#[derive(Debug, Error)]
#[error("[cheval] {kind}: {message}")]
pub struct ChevalError {
    /// Classification driving retry and exit-code behavior.
    pub kind: ErrorKind,
    /// Human-readable message. Already redacted at construction when it
    /// may contain provider output.
    pub message: String,
    /// Structured extras for the JSON diagnostic payload.
    pub context: Map<String, Value>,
}

impl ChevalError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Map::new(),
        }
    }

    /// Attach a structured context value.
    #[must_use]
    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_owned(), value.into());
        self
    }

    /// Whether the retry loop may retry this error.
    #[must_use]
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    /// Render the `{error:true, code, message, retryable, ...}` payload
    /// emitted on the diagnostic channel.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("error".to_owned(), Value::Bool(true));
        obj.insert("code".to_owned(), Value::String(self.kind.code().to_owned()));
        obj.insert("message".to_owned(), Value::String(self.to_string()));
        obj.insert("retryable".to_owned(), Value::Bool(self.retryable()));
        for (k, v) in &self.context {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(obj)
    }

    // -- Constructors for the common kinds --

    /// Caller input is malformed.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// Configuration is invalid.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    /// Agent requires the native runtime.
    pub fn native_runtime_required(agent: &str) -> Self {
        Self::new(
            ErrorKind::NativeRuntimeRequired,
            format!("agent '{agent}' requires native_runtime"),
        )
        .with_context("agent", agent)
    }

    /// Provider is unreachable or refused service.
    pub fn provider_unavailable(provider: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorKind::ProviderUnavailable,
            format!("provider '{provider}' unavailable: {reason}"),
        )
        .with_context("provider", provider)
    }

    /// Provider returned 429.
    pub fn rate_limited(provider: &str) -> Self {
        Self::new(ErrorKind::RateLimited, format!("rate limited by {provider}"))
            .with_context("provider", provider)
    }

    /// Daily budget at or over limit.
    pub fn budget_exceeded(spent: u64, limit: u64) -> Self {
        Self::new(
            ErrorKind::BudgetExceeded,
            format!("budget exceeded: {spent} >= {limit} micro-USD"),
        )
        .with_context("spent", spent)
        .with_context("limit", limit)
    }

    /// Input exceeds the model context window.
    pub fn context_too_large(estimated: u64, available: u64, context_window: u64) -> Self {
        Self::new(
            ErrorKind::ContextTooLarge,
            format!(
                "input ~{estimated} tokens exceeds available {available} tokens \
                 (context_window={context_window})"
            ),
        )
        .with_context("estimated_tokens", estimated)
        .with_context("available", available)
        .with_context("context_window", context_window)
    }

    /// All retry/fallback attempts exhausted.
    pub fn retries_exhausted(total_attempts: u32, last_error: Option<&str>) -> Self {
        Self::new(
            ErrorKind::RetriesExhausted,
            format!(
                "failed after {total_attempts} attempts: {}",
                last_error.unwrap_or("unknown")
            ),
        )
        .with_context("total_attempts", total_attempts)
    }

    /// Deadline elapsed.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Provider response could not be normalized.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidResponse, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_stable() {
        assert_eq!(ErrorKind::InvalidConfig.code(), "INVALID_CONFIG");
        assert_eq!(ErrorKind::BudgetOverflow.code(), "BUDGET_OVERFLOW");
        assert_eq!(ErrorKind::InteractionPending.code(), "INTERACTION_PENDING");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ErrorKind::RateLimited.retryable());
        assert!(ErrorKind::ProviderUnavailable.retryable());
        assert!(!ErrorKind::InvalidInput.retryable());
        assert!(!ErrorKind::BudgetExceeded.retryable());
        assert!(!ErrorKind::RetriesExhausted.retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ErrorKind::RateLimited.exit_code(), 1);
        assert_eq!(ErrorKind::NativeRuntimeRequired.exit_code(), 2);
        assert_eq!(ErrorKind::Timeout.exit_code(), 3);
        assert_eq!(ErrorKind::MissingApiKey.exit_code(), 4);
        assert_eq!(ErrorKind::InvalidResponse.exit_code(), 5);
        assert_eq!(ErrorKind::BudgetExceeded.exit_code(), 6);
        assert_eq!(ErrorKind::ContextTooLarge.exit_code(), 7);
        assert_eq!(ErrorKind::InteractionPending.exit_code(), 8);
    }

    #[test]
    fn test_json_payload() {
        let err = ChevalError::budget_exceeded(100, 50);
        let json = err.to_json();
        assert_eq!(json["error"], true);
        assert_eq!(json["code"], "BUDGET_EXCEEDED");
        assert_eq!(json["retryable"], false);
        assert_eq!(json["spent"], 100);
        assert_eq!(json["limit"], 50);
    }

    #[test]
    fn test_display_includes_code() {
        let err = ChevalError::native_runtime_required("implementing-tasks");
        let rendered = err.to_string();
        assert!(rendered.contains("NATIVE_RUNTIME_REQUIRED"));
        assert!(rendered.contains("implementing-tasks"));
    }
}
