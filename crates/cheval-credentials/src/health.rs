//! Credential health checks.
//!
//! Two modes:
//! - **Format-only** (default, dry-run-safe): structural validation of
//!   prefix, minimum length, and character set. Credentials whose format
//!   is too loose to vouch for (Moonshot) report `Unknown` rather than
//!   a false `Ok`.
//! - **Live**: one minimally-scoped request per credential. For OpenAI
//!   and Moonshot that is a models list; for Anthropic, a deliberately
//!   malformed messages request whose 400 proves the key authenticates
//!   (401 = invalid key, 403 = forbidden).
//!
//! All report text passes through redaction before leaving this module.

use std::time::Duration;

use cheval_core::redaction::redact_with_secrets;
use tracing::debug;

use crate::chain::CredentialProvider;

/// Outcome of a single credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The credential looks valid (or authenticated live).
    Ok,
    /// The provider rejected the key (HTTP 401).
    Invalid,
    /// The key authenticates but lacks access (HTTP 403).
    Forbidden,
    /// No chain provider holds this credential.
    Missing,
    /// Format validation is too weak to vouch for this credential.
    Unknown,
    /// The check itself failed (network, unexpected status).
    Error,
}

impl HealthStatus {
    /// Short label for diagnostics output.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Invalid => "invalid",
            Self::Forbidden => "forbidden",
            Self::Missing => "missing",
            Self::Unknown => "unknown/weak_validation",
            Self::Error => "error",
        }
    }
}

/// Result of checking one credential.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Credential id (env-var name).
    pub credential_id: String,
    /// Outcome.
    pub status: HealthStatus,
    /// Redacted human-readable detail.
    pub message: String,
}

/// Expected shape of a known credential.
struct CredentialFormat {
    id: &'static str,
    description: &'static str,
    prefix: &'static str,
    min_len: usize,
    /// Too loose to vouch for; report `Unknown` even when shape matches.
    weak_validation: bool,
}

/// Known credential ids, in check order.
pub const KNOWN_CREDENTIALS: &[&str] = &["OPENAI_API_KEY", "ANTHROPIC_API_KEY", "MOONSHOT_API_KEY"];

const FORMATS: &[CredentialFormat] = &[
    CredentialFormat {
        id: "OPENAI_API_KEY",
        description: "OpenAI API",
        prefix: "sk-",
        min_len: 20,
        weak_validation: false,
    },
    CredentialFormat {
        id: "ANTHROPIC_API_KEY",
        description: "Anthropic API",
        prefix: "sk-ant-",
        min_len: 20,
        weak_validation: false,
    },
    CredentialFormat {
        id: "MOONSHOT_API_KEY",
        description: "Moonshot API",
        prefix: "",
        min_len: 8,
        weak_validation: true,
    },
];

fn format_for(credential_id: &str) -> Option<&'static CredentialFormat> {
    FORMATS.iter().find(|f| f.id == credential_id)
}

fn charset_ok(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Format-only validation of a single credential value.
#[must_use]
pub fn check_format(credential_id: &str, value: &str) -> HealthReport {
    let Some(format) = format_for(credential_id) else {
        return HealthReport {
            credential_id: credential_id.to_owned(),
            status: HealthStatus::Unknown,
            message: "no format rule configured".to_owned(),
        };
    };

    if !value.starts_with(format.prefix) {
        return HealthReport {
            credential_id: credential_id.to_owned(),
            status: HealthStatus::Invalid,
            message: format!(
                "{}: expected prefix '{}'",
                format.description, format.prefix
            ),
        };
    }
    if value.len() < format.min_len {
        return HealthReport {
            credential_id: credential_id.to_owned(),
            status: HealthStatus::Invalid,
            message: format!(
                "{}: shorter than {} characters",
                format.description, format.min_len
            ),
        };
    }
    if !charset_ok(value) {
        return HealthReport {
            credential_id: credential_id.to_owned(),
            status: HealthStatus::Invalid,
            message: format!("{}: unexpected characters", format.description),
        };
    }

    if format.weak_validation {
        return HealthReport {
            credential_id: credential_id.to_owned(),
            status: HealthStatus::Unknown,
            message: format!(
                "{}: format check passed but is too weak to confirm validity",
                format.description
            ),
        };
    }

    HealthReport {
        credential_id: credential_id.to_owned(),
        status: HealthStatus::Ok,
        message: format!("{}: format looks valid", format.description),
    }
}

/// Format-only check of every known credential in the chain.
#[must_use]
pub fn check_all_format(provider: &dyn CredentialProvider) -> Vec<HealthReport> {
    KNOWN_CREDENTIALS
        .iter()
        .map(|id| match provider.get(id) {
            Some(value) => check_format(id, &value),
            None => HealthReport {
                credential_id: (*id).to_owned(),
                status: HealthStatus::Missing,
                message: format!("{id} not configured"),
            },
        })
        .collect()
}

/// Endpoint configuration for one live check.
struct LiveCheck {
    id: &'static str,
    description: &'static str,
    url: &'static str,
    method: LiveMethod,
}

enum LiveMethod {
    /// GET expecting 200.
    Get { header: &'static str, bearer: bool },
    /// Anthropic: POST a body missing its required `model` field. A 400
    /// proves the key authenticates without generating a completion.
    AnthropicProbe,
}

const LIVE_CHECKS: &[LiveCheck] = &[
    LiveCheck {
        id: "OPENAI_API_KEY",
        description: "OpenAI API",
        url: "https://api.openai.com/v1/models",
        method: LiveMethod::Get {
            header: "Authorization",
            bearer: true,
        },
    },
    LiveCheck {
        id: "ANTHROPIC_API_KEY",
        description: "Anthropic API",
        url: "https://api.anthropic.com/v1/messages",
        method: LiveMethod::AnthropicProbe,
    },
    LiveCheck {
        id: "MOONSHOT_API_KEY",
        description: "Moonshot API",
        url: "https://api.moonshot.cn/v1/models",
        method: LiveMethod::Get {
            header: "Authorization",
            bearer: true,
        },
    },
];

fn classify_live(check: &LiveCheck, status: u16, expect_400: bool) -> (HealthStatus, String) {
    match status {
        401 => (
            HealthStatus::Invalid,
            format!("{}: invalid key (HTTP 401)", check.description),
        ),
        403 => (
            HealthStatus::Forbidden,
            format!("{}: access denied (HTTP 403)", check.description),
        ),
        400 if expect_400 => (
            HealthStatus::Ok,
            format!("{}: valid (HTTP 400)", check.description),
        ),
        200 if !expect_400 => (
            HealthStatus::Ok,
            format!("{}: valid (HTTP 200)", check.description),
        ),
        other => (
            HealthStatus::Error,
            format!("{}: unexpected HTTP {other}", check.description),
        ),
    }
}

async fn run_live_check(check: &LiveCheck, value: &str, timeout: Duration) -> HealthReport {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => {
            return HealthReport {
                credential_id: check.id.to_owned(),
                status: HealthStatus::Error,
                message: redact_with_secrets(&format!("client build failed: {e}"), &[value]),
            };
        },
    };

    let result = match &check.method {
        LiveMethod::Get { header, bearer } => {
            let header_value = if *bearer {
                format!("Bearer {value}")
            } else {
                value.to_owned()
            };
            client
                .get(check.url)
                .header(*header, header_value)
                .send()
                .await
        },
        LiveMethod::AnthropicProbe => {
            client
                .post(check.url)
                .header("x-api-key", value)
                .header("anthropic-version", "2023-06-01")
                .json(&serde_json::json!({
                    "max_tokens": 1,
                    "messages": [{"role": "user", "content": "ping"}],
                }))
                .send()
                .await
        },
    };

    match result {
        Ok(resp) => {
            let expect_400 = matches!(check.method, LiveMethod::AnthropicProbe);
            let (status, message) = classify_live(check, resp.status().as_u16(), expect_400);
            debug!(credential = check.id, status = status.label(), "live check");
            HealthReport {
                credential_id: check.id.to_owned(),
                status,
                message: redact_with_secrets(&message, &[value]),
            }
        },
        Err(e) => HealthReport {
            credential_id: check.id.to_owned(),
            status: HealthStatus::Error,
            message: redact_with_secrets(&format!("{}: {e}", check.description), &[value]),
        },
    }
}

/// Live check of every known credential in the chain.
pub async fn check_all_live(
    provider: &dyn CredentialProvider,
    timeout: Duration,
) -> Vec<HealthReport> {
    let mut reports = Vec::with_capacity(LIVE_CHECKS.len());
    for check in LIVE_CHECKS {
        match provider.get(check.id) {
            Some(value) => reports.push(run_live_check(check, &value, timeout).await),
            None => reports.push(HealthReport {
                credential_id: check.id.to_owned(),
                status: HealthStatus::Missing,
                message: format!("{} not configured", check.id),
            }),
        }
    }
    reports
}
