//! Typed schema for the `hounfour` configuration document.

use std::collections::BTreeMap;
use std::path::PathBuf;

use cheval_core::redaction::REDACTED;
use cheval_core::Requirement;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::Value;

/// A string that holds a resolved secret.
///
/// Debug, Display, and Serialize never reveal the value; callers use
/// [`SecretString::expose`] at the single point the value crosses into
/// an HTTP header.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a resolved secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The underlying secret. Call only where the value is consumed.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the secret is empty or whitespace-only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretString").field(&REDACTED).finish()
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Merged `hounfour` configuration after interpolation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HounfourConfig {
    /// Provider table keyed by provider name.
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Alias map: alias → alias or `provider:model-id`.
    pub aliases: BTreeMap<String, String>,
    /// Agent bindings keyed by agent name.
    pub agents: BTreeMap<String, AgentConfig>,
    /// Routing chains, rate limits, and circuit-breaker settings.
    pub routing: RoutingConfig,
    /// Retry orchestrator budgets.
    pub retry: RetryConfig,
    /// Cost metering and budget enforcement.
    pub metering: MeteringConfig,
    /// Feature gates.
    pub feature_flags: FeatureFlags,
    /// Extra env-var name patterns allowed in `{env:...}` interpolation.
    pub secret_env_allowlist: Vec<String>,
    /// Extra directories allowed for `{file:...}` interpolation.
    pub secret_paths: Vec<PathBuf>,
    /// Whether `{cmd:...}` interpolation is permitted at all.
    pub secret_commands_enabled: bool,
    /// Model override from `LOA_MODEL` (layer 3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_model_override: Option<String>,
    /// Model override from the CLI (layer 4).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_model_override: Option<String>,
    /// Invocation defaults applied when the caller omits a value.
    pub defaults: InvokeDefaults,
}

impl HounfourConfig {
    /// Look up a model config through the provider table.
    #[must_use]
    pub fn model_config(&self, provider: &str, model_id: &str) -> Option<&ModelConfig> {
        self.providers.get(provider)?.models.get(model_id)
    }
}

/// Provider adapter family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI chat/completions wire format.
    Openai,
    /// Any endpoint speaking the OpenAI wire format.
    OpenaiCompat,
    /// Anthropic messages API.
    Anthropic,
    /// Google Gemini generateContent + Interactions API.
    Google,
}

/// Per-provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Adapter family selecting the wire translation.
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// API base URL.
    pub endpoint: String,
    /// Resolved auth value. Interpolated at load; never displayed.
    #[serde(default)]
    pub auth: SecretString,
    /// Registered models keyed by model id.
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    /// TCP connect timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    /// Response read timeout.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: f64,
    /// Request write timeout.
    #[serde(default = "default_write_timeout")]
    pub write_timeout: f64,
}

fn default_connect_timeout() -> f64 {
    10.0
}
fn default_read_timeout() -> f64 {
    120.0
}
fn default_write_timeout() -> f64 {
    30.0
}

/// API surface used for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiMode {
    /// Single-request completion endpoint.
    Standard,
    /// Long-running create/poll/cancel interaction endpoint.
    Interactions,
}

/// Per-model configuration within a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Declared capabilities (`chat`, `tools`, `thinking_traces`, ...).
    pub capabilities: Vec<String>,
    /// Context window size in tokens.
    pub context_window: u64,
    /// Wire parameter name for the output-length limit.
    pub token_param: String,
    /// Pricing, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing: Option<PricingConfig>,
    /// `standard` (default) or `interactions`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_mode: Option<ApiMode>,
    /// Provider-specific extras.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<ModelExtra>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            context_window: 128_000,
            token_param: "max_tokens".to_owned(),
            pricing: None,
            api_mode: None,
            extra: None,
        }
    }
}

impl ModelConfig {
    /// Whether the model declares a capability.
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }
}

/// Recognized model extras, with unknown keys retained opaquely and
/// passed through to the adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelExtra {
    /// Gemini 3 thinking level: `low`, `medium`, or `high`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    /// Gemini 2.5 thinking budget; `-1` = dynamic, `0` = disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<i64>,
    /// Deep-research poll cadence in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling_interval_s: Option<u64>,
    /// Deep-research absolute poll deadline in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_poll_time_s: Option<u64>,
    /// Provider-side storage flag for interactions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    /// API version override for versioned endpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Unrecognized keys, preserved for the adapter to consume or ignore.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// Pricing mode discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingMode {
    /// Per-token pricing.
    #[default]
    Token,
    /// Flat per-task pricing; token counts informational only.
    Task,
    /// Token pricing plus a flat per-task amount.
    Hybrid,
}

/// Per-model pricing in integer micro-USD.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Micro-USD per million input tokens.
    pub input_per_mtok: u64,
    /// Micro-USD per million output tokens.
    pub output_per_mtok: u64,
    /// Micro-USD per million reasoning tokens.
    pub reasoning_per_mtok: u64,
    /// Flat per-task micro-USD amount.
    pub per_task_micro_usd: u64,
    /// Mode discriminator.
    pub pricing_mode: PricingMode,
}

/// Mixed-type requirement value as written in YAML: `true` for a hard
/// requirement or the string `preferred` for a soft one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequireLevel {
    /// `true` = required, `false` = ignored.
    Flag(bool),
    /// `"preferred"` = soft requirement.
    Named(String),
}

impl RequireLevel {
    /// Convert to the core requirement, dropping `false`/unknown values.
    #[must_use]
    pub fn to_requirement(&self) -> Option<Requirement> {
        match self {
            Self::Flag(true) => Some(Requirement::Required),
            Self::Flag(false) => None,
            Self::Named(s) if s == "preferred" => Some(Requirement::Preferred),
            Self::Named(_) => None,
        }
    }
}

/// Agent binding as written in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model reference: alias or `provider:model-id`.
    pub model: String,
    /// Default sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Persona file path relative to the project root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    /// Capability requirements.
    pub requires: BTreeMap<String, RequireLevel>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: cheval_core::NATIVE_ALIAS.to_owned(),
            temperature: None,
            persona: None,
            requires: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    /// Resolve the binding for an agent name.
    #[must_use]
    pub fn binding(&self, agent: &str) -> cheval_core::AgentBinding {
        let requires = self
            .requires
            .iter()
            .filter_map(|(k, v)| v.to_requirement().map(|r| (k.clone(), r)))
            .collect();
        cheval_core::AgentBinding {
            agent: agent.to_owned(),
            model: self.model.clone(),
            temperature: self.temperature,
            requires,
        }
    }
}

/// Routing chains, rate limits, and circuit-breaker settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Fallback chains keyed by original provider.
    pub fallback: BTreeMap<String, Vec<String>>,
    /// Downgrade chains keyed by alias.
    pub downgrade: BTreeMap<String, Vec<String>>,
    /// Per-provider rate limits.
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    /// Circuit-breaker tuning.
    pub circuit_breaker: BreakerSettings,
}

/// Per-provider RPM/TPM limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per minute.
    pub rpm: u32,
    /// Tokens per minute.
    pub tpm: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rpm: 60,
            tpm: 1_000_000,
        }
    }
}

/// Circuit-breaker tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failures within the count window before the breaker opens.
    pub failure_threshold: u32,
    /// Seconds in OPEN before a read transitions to HALF_OPEN.
    pub reset_timeout_seconds: u64,
    /// Concurrent probes permitted in HALF_OPEN.
    pub half_open_max_probes: u32,
    /// Seconds after which a stale failure count resets.
    pub count_window_seconds: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_seconds: 60,
            half_open_max_probes: 1,
            count_window_seconds: 300,
        }
    }
}

/// Retry orchestrator budgets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Per-provider retry attempts.
    pub max_retries: u32,
    /// Global attempt budget across providers.
    pub max_total_attempts: u32,
    /// How many times the chain walker may cross providers.
    pub max_provider_switches: u32,
    /// Base backoff delay in seconds.
    pub base_delay_seconds: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_total_attempts: 6,
            max_provider_switches: 2,
            base_delay_seconds: 1.0,
        }
    }
}

/// Cost metering and budget enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeteringConfig {
    /// Master switch for cost recording and budget checks.
    pub enabled: bool,
    /// JSONL ledger path relative to the project root.
    pub ledger_path: String,
    /// Daily budget policy.
    pub budget: BudgetConfig,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ledger_path: ".run/cost-ledger.jsonl".to_owned(),
            budget: BudgetConfig::default(),
        }
    }
}

/// Policy applied when daily spend reaches the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExceeded {
    /// Log and continue.
    Warn,
    /// Route to a cheaper model via the downgrade chain.
    #[default]
    Downgrade,
    /// Refuse the request.
    Block,
}

/// Daily budget policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Daily limit in micro-USD.
    pub daily_micro_usd: u64,
    /// Warn threshold as a percentage of the limit.
    pub warn_at_percent: u64,
    /// Policy at/over the limit.
    pub on_exceeded: OnExceeded,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_micro_usd: 500_000_000,
            warn_at_percent: 80,
            on_exceeded: OnExceeded::Downgrade,
        }
    }
}

/// Context-filter rollout mode.
///
/// Mixed-type flag in YAML: `false` disables, `"audit"` logs without
/// mutating, `"enforce"` applies the filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContextFilterMode {
    /// Filtering disabled.
    #[default]
    Off,
    /// Run the pipeline on a copy, log impact, return the original.
    Audit,
    /// Apply the filter to outgoing messages.
    Enforce,
}

impl Serialize for ContextFilterMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Off => serializer.serialize_bool(false),
            Self::Audit => serializer.serialize_str("audit"),
            Self::Enforce => serializer.serialize_str("enforce"),
        }
    }
}

impl<'de> Deserialize<'de> for ContextFilterMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Bool(false) => Ok(Self::Off),
            Value::Bool(true) => Ok(Self::Enforce),
            Value::String(s) if s == "audit" => Ok(Self::Audit),
            Value::String(s) if s == "enforce" => Ok(Self::Enforce),
            other => Err(D::Error::custom(format!(
                "context_filtering must be false, \"audit\", or \"enforce\" (got {other:?})"
            ))),
        }
    }
}

/// Feature gates. All boolean flags default on (opt-out).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Whether the Google adapter may be used at all.
    pub google_adapter: bool,
    /// Whether deep-research models may be used.
    pub deep_research: bool,
    /// Whether thinking config is forwarded to providers.
    pub thinking_traces: bool,
    /// Whether metering hooks are wired.
    pub metering: bool,
    /// Context filter rollout mode.
    pub context_filtering: ContextFilterMode,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            google_adapter: true,
            deep_research: true,
            thinking_traces: true,
            metering: true,
            context_filtering: ContextFilterMode::Off,
        }
    }
}

/// Invocation defaults applied when the caller omits a value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokeDefaults {
    /// Request timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Maximum output tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}
