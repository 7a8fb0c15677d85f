//! Secret redaction for error messages, logs, and display output.
//!
//! Every error message that may carry provider output, interpolated
//! config, or HTTP headers passes through [`redact_str`] before it
//! reaches a log sink or the diagnostic channel. The redactor replaces
//! known secret substrings with a fixed sentinel; it never reveals
//! partial values.

use std::sync::LazyLock;

use regex::Regex;

/// Sentinel substituted for any redacted value.
pub const REDACTED: &str = "***REDACTED***";

/// Env vars whose values are always treated as secrets.
pub const SECRET_ENV_VARS: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "MOONSHOT_API_KEY",
    "GOOGLE_API_KEY",
];

static AUTH_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(Authorization:\s*Bearer\s+)\S+").expect("valid regex"));

static XAPI_KEY_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(x-api-key:\s*)\S+").expect("valid regex"));

static GOOG_KEY_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(x-goog-api-key:\s*)\S+").expect("valid regex"));

static URL_AUTH_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([?&])(api[_-]?key|token|secret|auth)=([^&\s]+)").expect("valid regex")
});

/// Key-name pattern that suggests a sensitive value.
static SENSITIVE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(auth|key|secret|token|password|credential|bearer)").expect("valid regex")
});

/// Whether a config key name suggests its value is sensitive.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY.is_match(key)
}

/// Redact known secret patterns from a string.
///
/// Replaces values of known secret env vars (plus any `LOA_*` value
/// longer than 8 characters), `Authorization: Bearer` and API-key
/// headers, and URL query auth parameters.
#[must_use]
pub fn redact_str(value: &str) -> String {
    let mut result = value.to_owned();

    for env_var in SECRET_ENV_VARS {
        if let Ok(secret) = std::env::var(env_var) {
            if !secret.is_empty() && result.contains(&secret) {
                result = result.replace(&secret, REDACTED);
            }
        }
    }

    for (key, secret) in std::env::vars() {
        if key.starts_with("LOA_") && secret.len() > 8 && result.contains(&secret) {
            result = result.replace(&secret, REDACTED);
        }
    }

    result = AUTH_HEADER
        .replace_all(&result, format!("${{1}}{REDACTED}"))
        .into_owned();
    result = XAPI_KEY_HEADER
        .replace_all(&result, format!("${{1}}{REDACTED}"))
        .into_owned();
    result = GOOG_KEY_HEADER
        .replace_all(&result, format!("${{1}}{REDACTED}"))
        .into_owned();
    result = URL_AUTH_PARAM
        .replace_all(&result, format!("${{1}}${{2}}={REDACTED}"))
        .into_owned();

    result
}

/// Redact additional caller-known secrets, then the standard patterns.
///
/// Used by the credential health checks, which hold resolved values that
/// may not originate from the environment.
#[must_use]
pub fn redact_with_secrets(value: &str, secrets: &[&str]) -> String {
    let mut result = value.to_owned();
    for secret in secrets {
        if !secret.is_empty() && result.contains(secret) {
            result = result.replace(secret, REDACTED);
        }
    }
    redact_str(&result)
}
