//! One logical invocation: retry on a provider, fall back across
//! providers, downgrade under budget pressure.
//!
//! The retry orchestrator owns a single provider; this layer owns the
//! chain walking around it. A budget `DOWNGRADE` is applied once, up
//! front, by walking the downgrade chain; provider failures walk the
//! fallback chain, capped by `max_provider_switches`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use cheval_config::{ContextFilterMode, HounfourConfig, ProviderConfig};
use cheval_core::{
    AgentBinding, ChevalError, ChevalResult, CompletionRequest, CompletionResult, ErrorKind,
    ResolvedModel,
};
use cheval_metering::{check_budget, BudgetDecision, TokenBucketLimiter};
use cheval_routing::{walk_downgrade_chain, walk_fallback_chain, CircuitBreaker, PermissionsCache};
use tracing::{info, warn};

use crate::adapter::{estimate_tokens, get_adapter};
use crate::retry::{invoke_with_retry, BudgetHook, NoopMetricsHook};

/// Filesystem roots and identity for one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Run directory for breaker, semaphore, and rate-limit state.
    pub run_dir: PathBuf,
    /// Cost ledger path.
    pub ledger_path: PathBuf,
    /// Model permissions file for trust-scope lookup.
    pub permissions_path: PathBuf,
}

/// Check feature gates for a resolved target. Returns an error message
/// when the target is disabled.
#[must_use]
pub fn feature_flag_block(
    config: &HounfourConfig,
    resolved: &ResolvedModel,
) -> Option<String> {
    let flags = &config.feature_flags;
    let provider_kind = config.providers.get(&resolved.provider).map(|p| p.kind);

    if provider_kind == Some(cheval_config::ProviderKind::Google) && !flags.google_adapter {
        return Some(
            "Google adapter is disabled (hounfour.feature_flags.google_adapter: false)".to_owned(),
        );
    }
    if resolved.model_id.contains("deep-research") && !flags.deep_research {
        return Some(
            "Deep Research is disabled (hounfour.feature_flags.deep_research: false)".to_owned(),
        );
    }
    None
}

/// Strip thinking configuration from a provider config when the
/// `thinking_traces` flag is off.
fn apply_thinking_flag(config: &HounfourConfig, provider: &mut ProviderConfig) {
    if config.feature_flags.thinking_traces {
        return;
    }
    for model in provider.models.values_mut() {
        if let Some(extra) = &mut model.extra {
            extra.thinking_level = None;
            extra.thinking_budget = None;
        }
    }
}

/// Apply context filtering to the request per the configured mode and
/// the target model's trust scopes.
fn apply_context_filter(
    request: &mut CompletionRequest,
    config: &HounfourConfig,
    resolved: &ResolvedModel,
    permissions: &PermissionsCache,
) {
    let access = permissions.lookup(&resolved.provider, &resolved.model_id);
    match config.feature_flags.context_filtering {
        ContextFilterMode::Off => {},
        ContextFilterMode::Audit => {
            request.messages = cheval_routing::audit_filter_context(
                &request.messages,
                access,
                &resolved.provider,
                &resolved.model_id,
                resolved.is_native(),
            );
        },
        ContextFilterMode::Enforce => {
            request.messages = cheval_routing::filter_context(
                &request.messages,
                access,
                resolved.is_native(),
            );
        },
    }
}

fn provider_config<'a>(
    config: &'a HounfourConfig,
    provider: &str,
) -> ChevalResult<&'a ProviderConfig> {
    config.providers.get(provider).ok_or_else(|| {
        ChevalError::invalid_config(format!("provider '{provider}' not configured"))
    })
}

/// Run one logical invocation end to end.
///
/// # Errors
///
/// Propagates resolution, budget, and adapter errors after the
/// fallback and downgrade chains are exhausted.
pub async fn invoke(
    config: &HounfourConfig,
    binding: &AgentBinding,
    resolved: ResolvedModel,
    mut request: CompletionRequest,
    options: &DispatchOptions,
    budget_hook: &mut dyn BudgetHook,
) -> ChevalResult<CompletionResult> {
    let breaker = CircuitBreaker::new(&options.run_dir, config.routing.circuit_breaker);
    let permissions = PermissionsCache::new(&options.permissions_path);
    let mut visited: HashSet<String> = HashSet::new();
    let mut current = resolved;

    // Budget pressure reroutes to a cheaper model before the first
    // attempt; the retry loop itself never switches models.
    if check_budget(config, &options.ledger_path) == BudgetDecision::Downgrade {
        match walk_downgrade_chain(&current, binding, config, &mut visited) {
            Ok(cheaper) => {
                info!(agent = %binding.agent, from = %current, to = %cheaper, "budget downgrade applied");
                current = cheaper;
            },
            Err(e) => {
                warn!(agent = %binding.agent, error = %e, "no downgrade available, continuing");
            },
        }
    }

    let mut switches: u32 = 0;
    loop {
        if let Some(reason) = feature_flag_block(config, &current) {
            return Err(ChevalError::invalid_config(reason));
        }

        let mut prov_config = provider_config(config, &current.provider)?.clone();
        apply_thinking_flag(config, &mut prov_config);

        request.model = current.model_id.clone();
        apply_context_filter(&mut request, config, &current, &permissions);

        // Advisory rate limit: log and proceed; hard enforcement is the
        // budget enforcer's job.
        let limiter = TokenBucketLimiter::for_provider(&current.provider, config, &options.run_dir);
        if !limiter.check(&current.provider, estimate_tokens(&request)) {
            warn!(provider = %current.provider, "advisory rate limit exceeded, proceeding");
        }

        let adapter = get_adapter(&current.provider, &prov_config, &options.run_dir)?;
        match invoke_with_retry(
            adapter.as_ref(),
            &request,
            config,
            &breaker,
            budget_hook,
            &mut NoopMetricsHook,
        )
        .await
        {
            Ok(result) => {
                if let Err(e) = limiter.record(&current.provider, result.usage.total()) {
                    warn!(error = %e, "rate limiter record failed");
                }
                return Ok(result);
            },
            Err(e) if e.kind == ErrorKind::ProviderUnavailable => {
                if switches >= config.retry.max_provider_switches {
                    warn!(
                        agent = %binding.agent,
                        switches,
                        "provider switch budget exhausted"
                    );
                    return Err(e);
                }
                let next = walk_fallback_chain(&current, binding, config, None, &mut visited)?;
                switches += 1;
                info!(
                    agent = %binding.agent,
                    from = %current,
                    to = %next,
                    switches,
                    "falling back to next provider"
                );
                current = next;
            },
            Err(e) => return Err(e),
        }
    }
}

/// Convenience for tests and tooling: the run dir's standard location
/// under a project root.
#[must_use]
pub fn default_run_dir(project_root: &Path) -> PathBuf {
    project_root.join(".run")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cheval_config::{AgentConfig, FeatureFlags, ModelConfig, ProviderKind, SecretString};
    use std::collections::BTreeMap;

    fn config_with_google() -> HounfourConfig {
        let mut config = HounfourConfig::default();
        let mut models = BTreeMap::new();
        models.insert(
            "gemini-3-deep-research".to_owned(),
            ModelConfig::default(),
        );
        config.providers.insert(
            "google".to_owned(),
            ProviderConfig {
                kind: ProviderKind::Google,
                endpoint: "https://generativelanguage.googleapis.com".to_owned(),
                auth: SecretString::new("AIza-test"),
                models,
                connect_timeout: 10.0,
                read_timeout: 120.0,
                write_timeout: 30.0,
            },
        );
        config
    }

    #[test]
    fn test_google_flag_blocks_provider() {
        let mut config = config_with_google();
        config.feature_flags = FeatureFlags {
            google_adapter: false,
            ..FeatureFlags::default()
        };
        let resolved = ResolvedModel::new("google", "gemini-3-pro");
        let block = feature_flag_block(&config, &resolved).unwrap();
        assert!(block.contains("google_adapter"));
    }

    #[test]
    fn test_deep_research_flag_blocks_model() {
        let mut config = config_with_google();
        config.feature_flags = FeatureFlags {
            deep_research: false,
            ..FeatureFlags::default()
        };
        let resolved = ResolvedModel::new("google", "gemini-3-deep-research");
        let block = feature_flag_block(&config, &resolved).unwrap();
        assert!(block.contains("deep_research"));
    }

    #[test]
    fn test_flags_default_allow() {
        let config = config_with_google();
        let resolved = ResolvedModel::new("google", "gemini-3-deep-research");
        assert!(feature_flag_block(&config, &resolved).is_none());
    }

    #[test]
    fn test_thinking_flag_strips_extras() {
        let mut config = config_with_google();
        config.feature_flags = FeatureFlags {
            thinking_traces: false,
            ..FeatureFlags::default()
        };

        let mut provider = config.providers["google"].clone();
        provider.models.insert(
            "gemini-3-pro".to_owned(),
            ModelConfig {
                extra: Some(cheval_config::ModelExtra {
                    thinking_level: Some("high".to_owned()),
                    thinking_budget: Some(-1),
                    polling_interval_s: Some(5),
                    ..cheval_config::ModelExtra::default()
                }),
                ..ModelConfig::default()
            },
        );

        apply_thinking_flag(&config, &mut provider);
        let extra = provider.models["gemini-3-pro"].extra.as_ref().unwrap();
        assert!(extra.thinking_level.is_none());
        assert!(extra.thinking_budget.is_none());
        // Non-thinking extras survive.
        assert_eq!(extra.polling_interval_s, Some(5));
    }

    #[tokio::test]
    async fn test_invoke_unknown_provider_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = HounfourConfig::default();
        let binding = AgentConfig::default().binding("ghost");
        let options = DispatchOptions {
            run_dir: dir.path().to_path_buf(),
            ledger_path: dir.path().join("ledger.jsonl"),
            permissions_path: dir.path().join("model-permissions.yaml"),
        };

        let err = invoke(
            &config,
            &binding,
            ResolvedModel::new("nowhere", "ghost-model"),
            CompletionRequest::new(vec![cheval_core::Message::user("hi")], "ghost-model"),
            &options,
            &mut crate::retry::NoopBudgetHook,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidConfig);
        assert!(err.message.contains("not configured"));
    }
}
