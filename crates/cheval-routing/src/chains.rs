//! Fallback and downgrade chain walking.
//!
//! Fallback runs when a provider is unavailable; downgrade runs when
//! the budget asks for a cheaper model. Both filter candidates by the
//! agent's required capabilities and a per-walk visited set, and both
//! log the routing decision. Only fallback consults a health probe:
//! downgrade is cost-motivated, not availability-motivated.

use std::collections::HashSet;

use cheval_config::HounfourConfig;
use cheval_core::{AgentBinding, ChevalError, ChevalResult, Requirement, ResolvedModel};
use tracing::info;

use crate::resolver::resolve_alias;

/// Why a candidate was passed over, for the exhaustion diagnostic.
#[derive(Debug)]
struct Rejection {
    candidate: String,
    reason: String,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.candidate, self.reason)
    }
}

fn capability_ok(
    candidate: &str,
    resolved: &ResolvedModel,
    binding: &AgentBinding,
    config: &HounfourConfig,
    rejections: &mut Vec<Rejection>,
) -> bool {
    for (capability, level) in &binding.requires {
        if capability == "native_runtime" {
            // Native-bound agents never reroute to a remote candidate.
            if *level == Requirement::Required {
                rejections.push(Rejection {
                    candidate: candidate.to_owned(),
                    reason: "native_runtime required".to_owned(),
                });
                return false;
            }
            continue;
        }
        if *level != Requirement::Required {
            continue;
        }
        let has = config
            .model_config(&resolved.provider, &resolved.model_id)
            .is_some_and(|m| m.has_capability(capability));
        if !has {
            rejections.push(Rejection {
                candidate: candidate.to_owned(),
                reason: format!("missing capability: {capability}"),
            });
            return false;
        }
    }
    true
}

fn walk_chain(
    chain: &[String],
    binding: &AgentBinding,
    config: &HounfourConfig,
    health_probe: Option<&dyn Fn(&str) -> bool>,
    visited: &mut HashSet<String>,
    rejections: &mut Vec<Rejection>,
) -> Option<ResolvedModel> {
    for candidate in chain {
        let Ok(resolved) = resolve_alias(candidate, &config.aliases) else {
            rejections.push(Rejection {
                candidate: candidate.clone(),
                reason: "cannot resolve alias".to_owned(),
            });
            continue;
        };

        let key = resolved.key();
        if visited.contains(&key) {
            rejections.push(Rejection {
                candidate: candidate.clone(),
                reason: "already visited (cycle prevention)".to_owned(),
            });
            continue;
        }

        if !capability_ok(candidate, &resolved, binding, config, rejections) {
            continue;
        }

        if let Some(probe) = health_probe {
            if !probe(&resolved.provider) {
                rejections.push(Rejection {
                    candidate: candidate.clone(),
                    reason: "provider unhealthy".to_owned(),
                });
                continue;
            }
        }

        visited.insert(key);
        return Some(resolved);
    }
    None
}

fn format_rejections(rejections: &[Rejection]) -> String {
    rejections
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Walk the fallback chain for an unavailable provider.
///
/// The chain is keyed by the original provider. Candidates already in
/// `visited`, missing a required capability, or failing the health
/// probe are skipped; the first survivor wins and is added to
/// `visited`.
///
/// # Errors
///
/// `PROVIDER_UNAVAILABLE` with the accumulated rejection list when no
/// chain is configured or the chain is exhausted.
pub fn walk_fallback_chain(
    original: &ResolvedModel,
    binding: &AgentBinding,
    config: &HounfourConfig,
    health_probe: Option<&dyn Fn(&str) -> bool>,
    visited: &mut HashSet<String>,
) -> ChevalResult<ResolvedModel> {
    visited.insert(original.key());

    let chain = config
        .routing
        .fallback
        .get(&original.provider)
        .cloned()
        .unwrap_or_default();
    if chain.is_empty() {
        return Err(ChevalError::provider_unavailable(
            &original.provider,
            format!(
                "no fallback chain configured for provider '{}'",
                original.provider
            ),
        ));
    }

    let mut rejections = Vec::new();
    if let Some(resolved) = walk_chain(
        &chain,
        binding,
        config,
        health_probe,
        visited,
        &mut rejections,
    ) {
        info!(
            agent = %binding.agent,
            from = %original,
            to = %resolved,
            reason = "provider_unavailable",
            "fallback routing"
        );
        return Ok(resolved);
    }

    Err(ChevalError::provider_unavailable(
        &original.provider,
        format!(
            "fallback chain exhausted for agent '{}' (original: {original}). Rejections: {}",
            binding.agent,
            format_rejections(&rejections)
        ),
    ))
}

/// Walk the downgrade chain when the budget says slow down.
///
/// The downgrade map is keyed by alias; the applicable chain is the one
/// whose key resolves to the original target. No health probe applies.
///
/// # Errors
///
/// `PROVIDER_UNAVAILABLE` when no chain matches or the chain is
/// exhausted.
pub fn walk_downgrade_chain(
    original: &ResolvedModel,
    binding: &AgentBinding,
    config: &HounfourConfig,
    visited: &mut HashSet<String>,
) -> ChevalResult<ResolvedModel> {
    visited.insert(original.key());

    let chain = find_downgrade_chain(original, config);
    let Some(chain) = chain else {
        return Err(ChevalError::provider_unavailable(
            &original.provider,
            format!("no downgrade chain found for {original}"),
        ));
    };

    let mut rejections = Vec::new();
    if let Some(resolved) = walk_chain(&chain, binding, config, None, visited, &mut rejections) {
        info!(
            agent = %binding.agent,
            from = %original,
            to = %resolved,
            reason = "budget_exceeded",
            "downgrade routing"
        );
        return Ok(resolved);
    }

    Err(ChevalError::provider_unavailable(
        &original.provider,
        format!(
            "downgrade chain exhausted for agent '{}' (original: {original}). Rejections: {}",
            binding.agent,
            format_rejections(&rejections)
        ),
    ))
}

/// Find the downgrade chain whose alias resolves to the original model.
fn find_downgrade_chain(
    original: &ResolvedModel,
    config: &HounfourConfig,
) -> Option<Vec<String>> {
    for (alias, chain) in &config.routing.downgrade {
        if let Ok(resolved) = resolve_alias(alias, &config.aliases) {
            if resolved == *original {
                return Some(chain.clone());
            }
        }
    }
    None
}

/// Validate routing chains at config-load time: every entry must
/// resolve, and no chain may revisit a target.
#[must_use]
pub fn validate_chains(config: &HounfourConfig) -> Vec<String> {
    let mut errors = Vec::new();

    for (provider, chain) in &config.routing.fallback {
        check_chain(chain, config, &format!("fallback chain for '{provider}'"), &mut errors);
    }
    for (alias, chain) in &config.routing.downgrade {
        check_chain(chain, config, &format!("downgrade chain for '{alias}'"), &mut errors);
    }

    errors
}

fn check_chain(
    chain: &[String],
    config: &HounfourConfig,
    label: &str,
    errors: &mut Vec<String>,
) {
    let mut seen = HashSet::new();
    for candidate in chain {
        match resolve_alias(candidate, &config.aliases) {
            Ok(resolved) => {
                if !seen.insert(resolved.key()) {
                    errors.push(format!("{label} has cycle at '{candidate}'"));
                }
            },
            Err(e) => {
                errors.push(format!("{label}: cannot resolve '{candidate}': {}", e.message));
            },
        }
    }
}
