//! Display-safe rendering of the effective configuration.
//!
//! Renders the merged (pre-interpolation) tree with `# from <layer>`
//! source annotations. Values carrying interpolation tokens show the
//! token reference but never the resolved secret; keys whose names
//! suggest a secret are redacted wholesale.

use std::collections::BTreeMap;

use cheval_core::redaction::{is_sensitive_key, REDACTED};
use serde_yaml::Value;

use crate::interpolate::{contains_token, token_sources};
use crate::loader::{ConfigLayer, LoadedConfig};

/// Render the effective config with source annotations and redaction.
#[must_use]
pub fn effective_config_display(loaded: &LoadedConfig) -> String {
    let mut lines = vec![
        "# Effective Hounfour Configuration".to_owned(),
        "# Values show source layer in comments".to_owned(),
        String::new(),
    ];
    format_value(&loaded.raw, &loaded.sources, &mut lines, "", 0);
    lines.join("\n")
}

fn source_comment(sources: &BTreeMap<String, ConfigLayer>, path: &str) -> String {
    sources
        .get(path)
        .map(|layer| format!("  # from {}", layer.label()))
        .unwrap_or_default()
}

fn render_scalar(key: &str, value: &Value) -> String {
    match value {
        Value::String(s) if contains_token(s) => {
            let annotations = token_sources(s).join(", ");
            format!("{REDACTED} (from {annotations})")
        },
        _ if is_sensitive_key(key) => REDACTED.to_owned(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "~".to_owned(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_owned(),
    }
}

fn format_value(
    value: &Value,
    sources: &BTreeMap<String, ConfigLayer>,
    lines: &mut Vec<String>,
    path: &str,
    indent: usize,
) {
    let pad = "  ".repeat(indent);
    if let Value::Mapping(map) = value {
        for (k, v) in map {
            let key = k.as_str().unwrap_or_default();
            let child_path = if path.is_empty() {
                key.to_owned()
            } else {
                format!("{path}.{key}")
            };
            match v {
                Value::Mapping(_) => {
                    lines.push(format!(
                        "{pad}{key}:{}",
                        source_comment(sources, &child_path)
                    ));
                    format_value(v, sources, lines, &child_path, indent + 1);
                },
                Value::Sequence(seq) => {
                    lines.push(format!(
                        "{pad}{key}:{}",
                        source_comment(sources, &child_path)
                    ));
                    for item in seq {
                        match item {
                            Value::Mapping(_) => {
                                lines.push(format!("{pad}  -"));
                                format_value(item, sources, lines, &child_path, indent + 2);
                            },
                            other => {
                                lines.push(format!("{pad}  - {}", render_scalar(key, other)));
                            },
                        }
                    }
                },
                scalar => {
                    lines.push(format!(
                        "{pad}{key}: {}{}",
                        render_scalar(key, scalar),
                        source_comment(sources, &child_path)
                    ));
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{load_config, CliOverrides, PROJECT_CONFIG_FILE};

    #[test]
    fn test_display_redacts_interpolated_values() {
        std::env::set_var("LOA_DISPLAY_SECRET", "super-secret-display-value");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            "hounfour:\n  providers:\n    openai:\n      type: openai\n      endpoint: https://api.openai.com/v1\n      auth: \"{env:LOA_DISPLAY_SECRET}\"\n",
        )
        .unwrap();

        let loaded = load_config(Some(dir.path()), &CliOverrides::default()).unwrap();
        let display = effective_config_display(&loaded);

        assert!(!display.contains("super-secret-display-value"));
        assert!(display.contains("***REDACTED*** (from env:LOA_DISPLAY_SECRET)"));
        assert!(display.contains("# from project_config"));
        std::env::remove_var("LOA_DISPLAY_SECRET");
    }

    #[test]
    fn test_display_redacts_sensitive_key_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            "hounfour:\n  webhook_secret: plaintext-oops\n",
        )
        .unwrap();

        let loaded = load_config(Some(dir.path()), &CliOverrides::default()).unwrap();
        let display = effective_config_display(&loaded);
        assert!(!display.contains("plaintext-oops"));
        assert!(display.contains("webhook_secret: ***REDACTED***"));
    }

    #[test]
    fn test_display_annotates_default_layer() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(Some(dir.path()), &CliOverrides::default()).unwrap();
        let display = effective_config_display(&loaded);
        assert!(display.contains("# from system_defaults"));
        assert!(display.contains("max_total_attempts: 6"));
    }
}
