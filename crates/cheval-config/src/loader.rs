//! Four-layer config merge with per-leaf provenance.
//!
//! Precedence (lowest → highest):
//! 1. Embedded system defaults (`defaults.yaml`)
//! 2. Project config (`.loa.config.yaml` → `hounfour:` section)
//! 3. Environment variables (`LOA_MODEL` only)
//! 4. CLI arguments

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use cheval_core::{ChevalError, ChevalResult};
use serde_yaml::Value;
use tracing::debug;

use crate::interpolate::{interpolate_tree, InterpolationContext};
use crate::schema::HounfourConfig;
use crate::validate;

/// Embedded system defaults.
const DEFAULTS_YAML: &str = include_str!("defaults.yaml");

/// Project config file name, searched upward from the working directory.
pub const PROJECT_CONFIG_FILE: &str = ".loa.config.yaml";

/// Which layer a config leaf came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    /// Embedded defaults.
    SystemDefaults,
    /// `.loa.config.yaml` `hounfour:` section.
    ProjectConfig,
    /// Environment variable override.
    EnvOverride,
    /// CLI argument override.
    CliOverride,
}

impl ConfigLayer {
    /// Short name used in the effective-config display.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::SystemDefaults => "system_defaults",
            Self::ProjectConfig => "project_config",
            Self::EnvOverride => "env_override",
            Self::CliOverride => "cli_override",
        }
    }
}

/// CLI-supplied overrides (layer 4).
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// `--model` override (alias or `provider:model-id`).
    pub model: Option<String>,
    /// `--timeout` override in seconds.
    pub timeout: Option<u64>,
}

/// The merged, interpolated configuration plus its provenance.
#[derive(Debug)]
pub struct LoadedConfig {
    /// Typed config after interpolation.
    pub config: HounfourConfig,
    /// Merged tree *before* interpolation, for display purposes. Raw
    /// interpolation tokens remain in place here, so the display layer
    /// never sees a resolved secret.
    pub raw: Value,
    /// Dotted leaf path → source layer.
    pub sources: BTreeMap<String, ConfigLayer>,
    /// Dotted paths whose values contained interpolation tokens.
    pub secret_keys: BTreeSet<String>,
}

/// Walk up from `start` to find the project root: the first directory
/// containing `.loa.config.yaml` or a `.claude/` directory.
#[must_use]
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(PROJECT_CONFIG_FILE).exists() || dir.join(".claude").is_dir() {
            return dir.to_path_buf();
        }
        current = dir.parent();
    }
    start.to_path_buf()
}

/// Deep-merge `overlay` into `base`. Overlay values win; nested mappings
/// merge recursively. Each overwritten leaf is tagged with `layer`.
fn deep_merge_tracking(
    base: &mut Value,
    overlay: &Value,
    path: &str,
    layer: ConfigLayer,
    sources: &mut BTreeMap<String, ConfigLayer>,
) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                let key_str = k.as_str().unwrap_or_default();
                let child_path = if path.is_empty() {
                    key_str.to_owned()
                } else {
                    format!("{path}.{key_str}")
                };
                if let Some(existing) = base_map.get_mut(k) {
                    deep_merge_tracking(existing, v, &child_path, layer, sources);
                } else {
                    base_map.insert(k.clone(), v.clone());
                    record_leaves(v, &child_path, layer, sources);
                }
            }
        },
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
            sources.insert(path.to_owned(), layer);
        },
    }
}

/// Tag every leaf under `value` with `layer`.
fn record_leaves(
    value: &Value,
    path: &str,
    layer: ConfigLayer,
    sources: &mut BTreeMap<String, ConfigLayer>,
) {
    if let Value::Mapping(map) = value {
        for (k, v) in map {
            let key_str = k.as_str().unwrap_or_default();
            let child_path = if path.is_empty() {
                key_str.to_owned()
            } else {
                format!("{path}.{key_str}")
            };
            record_leaves(v, &child_path, layer, sources);
        }
    } else {
        sources.insert(path.to_owned(), layer);
    }
}

fn load_yaml_file(path: &Path) -> ChevalResult<Option<Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ChevalError::invalid_config(format!(
                "failed to read {}: {e}",
                path.display()
            )));
        },
    };

    let value: Value = serde_yaml::from_str(&content).map_err(|e| {
        ChevalError::invalid_config(format!("failed to parse {}: {e}", path.display()))
    })?;
    Ok(Some(value))
}

/// Load the merged configuration through the four-layer pipeline.
///
/// # Errors
///
/// `INVALID_CONFIG` on unreadable/unparseable files, interpolation
/// failures, invalid allowlist regexes, or alias-graph cycles.
pub fn load_config(
    project_root: Option<&Path>,
    cli: &CliOverrides,
) -> ChevalResult<LoadedConfig> {
    let root = match project_root {
        Some(r) => r.to_path_buf(),
        None => {
            let cwd = std::env::current_dir().map_err(|e| {
                ChevalError::invalid_config(format!("cannot determine working directory: {e}"))
            })?;
            find_project_root(&cwd)
        },
    };

    let mut sources = BTreeMap::new();

    // Layer 1: embedded defaults.
    let mut merged: Value = serde_yaml::from_str(DEFAULTS_YAML)
        .map_err(|e| ChevalError::invalid_config(format!("embedded defaults invalid: {e}")))?;
    record_leaves(&merged, "", ConfigLayer::SystemDefaults, &mut sources);

    // Layer 2: project config, hounfour: section.
    let project_path = root.join(PROJECT_CONFIG_FILE);
    if let Some(full) = load_yaml_file(&project_path)? {
        if let Some(section) = full.get("hounfour") {
            deep_merge_tracking(
                &mut merged,
                section,
                "",
                ConfigLayer::ProjectConfig,
                &mut sources,
            );
            debug!(path = %project_path.display(), "loaded project config");
        }
    }

    // Layer 3: environment overrides. Only the model alias override is
    // honored; env vars cannot rewrite routing, pricing, or bindings.
    if let Ok(model) = std::env::var("LOA_MODEL") {
        if !model.is_empty() {
            if let Value::Mapping(map) = &mut merged {
                map.insert(
                    Value::String("env_model_override".to_owned()),
                    Value::String(model),
                );
            }
            sources.insert("env_model_override".to_owned(), ConfigLayer::EnvOverride);
        }
    }

    // Layer 4: CLI overrides.
    if let Value::Mapping(map) = &mut merged {
        if let Some(model) = &cli.model {
            map.insert(
                Value::String("cli_model_override".to_owned()),
                Value::String(model.clone()),
            );
            sources.insert("cli_model_override".to_owned(), ConfigLayer::CliOverride);
        }
        if let Some(timeout) = cli.timeout {
            let defaults = map
                .entry(Value::String("defaults".to_owned()))
                .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
            if let Value::Mapping(d) = defaults {
                d.insert(
                    Value::String("timeout".to_owned()),
                    Value::Number(timeout.into()),
                );
            }
            sources.insert("defaults.timeout".to_owned(), ConfigLayer::CliOverride);
        }
    }

    // Resolve secret interpolation on a copy; the raw tree is kept for
    // the effective-config display.
    let raw = merged.clone();

    let env_allowlist = string_list(&merged, "secret_env_allowlist");
    let secret_paths: Vec<PathBuf> = string_list(&merged, "secret_paths")
        .into_iter()
        .map(|p| {
            let path = PathBuf::from(p);
            if path.is_absolute() {
                path
            } else {
                root.join(path)
            }
        })
        .collect();
    let commands_enabled = merged
        .get("secret_commands_enabled")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let ctx = InterpolationContext::new(&root, &env_allowlist, secret_paths, commands_enabled)?;
    let mut secret_keys = BTreeSet::new();
    let interpolated = interpolate_tree(&merged, &ctx, "", &mut secret_keys)?;

    let config: HounfourConfig = serde_yaml::from_value(interpolated)
        .map_err(|e| ChevalError::invalid_config(format!("config schema invalid: {e}")))?;

    // Alias graph must be acyclic before anything downstream walks it.
    validate::detect_alias_cycles(&config.aliases)?;

    Ok(LoadedConfig {
        config,
        raw,
        sources,
        secret_keys,
    })
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Process-local config holder with explicit invalidation.
///
/// Not thread-safe; single-threaded CLI use is the supported pattern.
/// Library embedders synchronize externally or call [`load_config`]
/// directly.
#[derive(Debug, Default)]
pub struct ConfigCache {
    cached: Option<LoadedConfig>,
}

impl ConfigCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached config, loading on first call.
    ///
    /// # Errors
    ///
    /// Propagates [`load_config`] failures; nothing is cached on error.
    pub fn get_or_load(
        &mut self,
        project_root: Option<&Path>,
        cli: &CliOverrides,
    ) -> ChevalResult<&LoadedConfig> {
        if self.cached.is_none() {
            self.cached = Some(load_config(project_root, cli)?);
        }
        Ok(self.cached.as_ref().expect("cache populated above"))
    }

    /// Drop the cached config so the next access reloads.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}
