//! Alias resolution and agent binding lookup.

use std::collections::HashSet;

use cheval_config::HounfourConfig;
use cheval_core::{
    AgentBinding, ChevalError, ChevalResult, Requirement, ResolvedModel, NATIVE_ALIAS,
};
use tracing::warn;

/// Maximum resolution depth for chained aliases.
const MAX_ALIAS_DEPTH: usize = 10;

/// Resolve an alias to a `provider:model-id` pair.
///
/// Handles chained aliases and detects circular references. The
/// reserved `native` alias always resolves to the in-process runtime
/// sentinel; a reference already in `provider:model` form is split
/// without consulting the alias map.
///
/// # Errors
///
/// `INVALID_CONFIG` on circular references, unknown aliases, or chains
/// deeper than the depth cap.
pub fn resolve_alias(
    alias: &str,
    aliases: &std::collections::BTreeMap<String, String>,
) -> ChevalResult<ResolvedModel> {
    if alias == NATIVE_ALIAS {
        return Ok(ResolvedModel::native());
    }

    if let Some((provider, model_id)) = alias.split_once(':') {
        return Ok(ResolvedModel::new(provider, model_id));
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut current = alias;

    for _ in 0..MAX_ALIAS_DEPTH {
        if !visited.insert(current) {
            let mut chain: Vec<&str> = visited.into_iter().collect();
            chain.sort_unstable();
            return Err(ChevalError::invalid_config(format!(
                "circular alias reference detected: {} -> {current}",
                chain.join(" -> ")
            )));
        }

        let Some(target) = aliases.get(current) else {
            let mut available: Vec<&String> = aliases.keys().collect();
            available.sort();
            return Err(ChevalError::invalid_config(format!(
                "unknown alias: '{current}'. Available aliases: {available:?}"
            )));
        };

        if let Some((provider, model_id)) = target.split_once(':') {
            return Ok(ResolvedModel::new(provider, model_id));
        }
        current = target;
    }

    Err(ChevalError::invalid_config(format!(
        "alias resolution exceeded max depth ({MAX_ALIAS_DEPTH}): {alias}"
    )))
}

/// Look up an agent's binding.
///
/// # Errors
///
/// `INVALID_INPUT` when the agent is not configured.
pub fn resolve_agent_binding(
    agent_name: &str,
    config: &HounfourConfig,
) -> ChevalResult<AgentBinding> {
    let Some(agent_config) = config.agents.get(agent_name) else {
        let mut available: Vec<&String> = config.agents.keys().collect();
        available.sort();
        return Err(ChevalError::invalid_input(format!(
            "unknown agent: '{agent_name}'. Available agents: {available:?}"
        )));
    };
    Ok(agent_config.binding(agent_name))
}

/// Full resolution pipeline: agent → binding → alias → provider:model.
///
/// # Errors
///
/// - `NATIVE_RUNTIME_REQUIRED` when the binding demands the native
///   runtime but the selected reference resolves elsewhere.
/// - `INVALID_INPUT` for an unknown agent.
/// - `INVALID_CONFIG` for alias resolution failures.
pub fn resolve_execution(
    agent_name: &str,
    config: &HounfourConfig,
    model_override: Option<&str>,
) -> ChevalResult<(AgentBinding, ResolvedModel)> {
    let binding = resolve_agent_binding(agent_name, config)?;
    let model_ref = model_override.unwrap_or(&binding.model);

    if binding.requires_native_runtime() {
        let native_key = ResolvedModel::native().key();
        if model_ref == NATIVE_ALIAS || model_ref == native_key {
            return Ok((binding, ResolvedModel::native()));
        }
        return Err(ChevalError::native_runtime_required(agent_name));
    }

    let resolved = resolve_alias(model_ref, &config.aliases)?;
    Ok((binding, resolved))
}

/// Validate every agent binding against the provider table.
///
/// Collects all errors rather than stopping at the first; preferred
/// capability gaps are logged as warnings, not errors.
#[must_use]
pub fn validate_bindings(config: &HounfourConfig) -> Vec<String> {
    let mut errors = Vec::new();

    for (agent_name, agent_config) in &config.agents {
        let resolved = match resolve_alias(&agent_config.model, &config.aliases) {
            Ok(r) => r,
            Err(e) => {
                errors.push(format!("agent '{agent_name}': {}", e.message));
                continue;
            },
        };

        if resolved.is_native() {
            continue;
        }

        let Some(provider_config) = config.providers.get(&resolved.provider) else {
            errors.push(format!(
                "agent '{agent_name}': model '{}' resolves to provider '{}' which is not configured",
                agent_config.model, resolved.provider
            ));
            continue;
        };

        let Some(model_config) = provider_config.models.get(&resolved.model_id) else {
            errors.push(format!(
                "agent '{agent_name}': model '{}' not found in provider '{}' models",
                resolved.model_id, resolved.provider
            ));
            continue;
        };

        let binding = agent_config.binding(agent_name);
        for (capability, level) in &binding.requires {
            if capability == "native_runtime" {
                continue;
            }
            if model_config.has_capability(capability) {
                continue;
            }
            match level {
                Requirement::Required => errors.push(format!(
                    "agent '{agent_name}': requires '{capability}' but model '{}' does not list \
                     it in capabilities",
                    resolved.model_id
                )),
                Requirement::Preferred => warn!(
                    agent = agent_name,
                    capability,
                    model = %resolved.model_id,
                    "agent prefers capability the model does not support"
                ),
            }
        }
    }

    if let Err(e) = cheval_config::detect_alias_cycles(&config.aliases) {
        errors.push(e.message);
    }
    errors.extend(crate::chains::validate_chains(config));

    errors
}
