//! Epistemic trust-scope filtering for remote model requests.
//!
//! Filters prompt context based on a model's `context_access` trust
//! scopes before it reaches a remote provider adapter. Four dimensions
//! are recognized:
//!
//! - `architecture`: `full` | `summary` | `none`
//! - `business_logic`: `full` | `redacted` | `none`
//! - `security`: `full` | `redacted` | `none`
//! - `lore`: `full` | `summary` | `none`
//!
//! A missing `context_access` entry means all dimensions `full`. The
//! transforms are content-reduction heuristics, not a security
//! boundary: the function-body redactor recognizes Python, JavaScript,
//! and class definitions only.
//!
//! Audit mode runs the same pipeline on a copy, logs what would change,
//! and returns the unmodified input.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use cheval_core::Message;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{info, warn};

/// Per-section character cap applied by the architecture summarizer.
const ARCHITECTURE_SUMMARY_MAX_CHARS: usize = 500;

/// Access level for one trust-scope dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    /// Content passes through unchanged.
    #[default]
    Full,
    /// Content is reduced to headers and leading paragraphs.
    Summary,
    /// Sensitive spans are replaced with placeholders.
    Redacted,
    /// Matching sections are dropped entirely.
    None,
}

/// Resolved trust scopes for a provider:model pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextAccess {
    /// Design documents, protocol docs, data models.
    pub architecture: ScopeLevel,
    /// Implementation code.
    pub business_logic: ScopeLevel,
    /// Audit findings, CVEs, vulnerability discussion.
    pub security: ScopeLevel,
    /// Institutional knowledge and narrative context.
    pub lore: ScopeLevel,
}

impl ContextAccess {
    /// Whether every dimension is `full` (no filtering needed).
    #[must_use]
    pub fn is_all_full(&self) -> bool {
        self.architecture == ScopeLevel::Full
            && self.business_logic == ScopeLevel::Full
            && self.security == ScopeLevel::Full
            && self.lore == ScopeLevel::Full
    }

    /// Dimensions not at `full`, for audit logging.
    #[must_use]
    pub fn restricted_dimensions(&self) -> Vec<(&'static str, ScopeLevel)> {
        let mut out = Vec::new();
        for (name, level) in [
            ("architecture", self.architecture),
            ("business_logic", self.business_logic),
            ("security", self.security),
            ("lore", self.lore),
        ] {
            if level != ScopeLevel::Full {
                out.push((name, level));
            }
        }
        out
    }
}

static ARCH_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?mi)^#+\s*(?:Software Design|System Architecture|SDD|PRD|Technical Design|API Design|Data Model)|^##\s+(?:Overview|Architecture|Components|Interfaces|Endpoints)",
    )
    .expect("valid regex")
});

static SECURITY_INLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)CVE-\d{4}-\d+|VULN-|SECURITY:|audit finding|vulnerability|OWASP|injection|XSS|CSRF|(?:secret|credential) (?:leak|exposure)",
    )
    .expect("valid regex")
});

static SECURITY_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^#{1,4}\s*(?:Security|Audit|Vulnerability|Findings)").expect("valid regex")
});

static LORE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?mi)^#+\s*(?:Lore|Vision|Bridgebuilder|Retrospective)|lore_index|vision_registry|institutional knowledge|context:\s*['"]"#,
    )
    .expect("valid regex")
});

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```\w*\n[\s\S]*?```").expect("valid regex"));

static ANY_CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\s\S]*?```").expect("valid regex"));

static CVE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CVE-\d{4}-\d+").expect("valid regex"));

static ANY_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,3}\s+").expect("valid regex"));

static LORE_CONTEXT_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*context:\s*['"|>]"#).expect("valid regex"));

static YAML_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\w+:").expect("valid regex"));

/// Drop sections whose heading matches `marker`, keeping everything
/// until the next top-level heading that does not match.
fn strip_marked_sections(text: &str, marker: &Regex) -> String {
    let mut result = Vec::new();
    let mut in_section = false;
    for line in text.lines() {
        if marker.is_match(line) {
            in_section = true;
            continue;
        }
        if in_section && ANY_HEADING.is_match(line) && !marker.is_match(line) {
            in_section = false;
        }
        if !in_section {
            result.push(line);
        }
    }
    result.join("\n")
}

/// Reduce architecture content to headers plus the first paragraph
/// after each, under a per-section character cap.
fn summarize_architecture(text: &str) -> String {
    let mut result = Vec::new();
    let mut chars = 0usize;
    let mut in_first_paragraph = false;

    for line in text.lines() {
        if line.starts_with('#') {
            result.push(line.to_owned());
            chars += line.len();
            in_first_paragraph = true;
            continue;
        }
        if in_first_paragraph && !line.trim().is_empty() {
            if chars < ARCHITECTURE_SUMMARY_MAX_CHARS {
                result.push(line.to_owned());
                chars += line.len();
            } else {
                result.push("[... content summarized ...]".to_owned());
                in_first_paragraph = false;
            }
        } else if line.trim().is_empty() {
            in_first_paragraph = false;
            result.push(String::new());
        }
    }
    result.join("\n")
}

/// Replace function/method bodies with `[redacted]`, keeping the
/// signature lines. Recognizes `def`, `async def`, `function`, and
/// `class` definitions; other languages pass through.
fn redact_function_bodies(code: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_body = false;

    for line in code.lines() {
        let trimmed = line.trim_start();
        let is_signature = trimmed.starts_with("def ")
            || trimmed.starts_with("async def ")
            || trimmed.starts_with("function ")
            || trimmed.starts_with("class ");

        if is_signature {
            out.push(line.to_owned());
            out.push("    [redacted]".to_owned());
            in_body = true;
        } else if in_body {
            let indented = line.starts_with(' ') || line.starts_with('\t') || line.is_empty()
                || line.starts_with('}');
            if !indented {
                in_body = false;
                out.push(line.to_owned());
            }
        } else {
            out.push(line.to_owned());
        }
    }
    out.join("\n")
}

/// Strip security-headed sections and rewrite inline security markers.
fn strip_security_content(text: &str) -> String {
    let mut result = Vec::new();
    let mut in_section = false;

    for line in text.lines() {
        if SECURITY_HEADING.is_match(line) {
            in_section = true;
            continue;
        }
        if in_section && ANY_HEADING.is_match(line) && !SECURITY_HEADING.is_match(line) {
            in_section = false;
        }
        if !in_section {
            result.push(
                SECURITY_INLINE
                    .replace_all(line, "[security content filtered]")
                    .into_owned(),
            );
        }
    }
    result.join("\n")
}

/// Strip nested `context:` blocks from structured lore documents,
/// keeping short fields.
fn summarize_lore(text: &str) -> String {
    let mut result = Vec::new();
    let mut in_context_block = false;

    for line in text.lines() {
        if LORE_CONTEXT_FIELD.is_match(line) {
            in_context_block = true;
            continue;
        }
        if in_context_block {
            if YAML_FIELD.is_match(line) && !line.trim_start().starts_with('-') {
                in_context_block = false;
            } else if line.trim().is_empty() {
                in_context_block = false;
                continue;
            } else {
                continue;
            }
        }
        result.push(line);
    }
    result.join("\n")
}

/// Filter a single message's text content per the resolved scopes.
#[must_use]
pub fn filter_message_content(content: &str, access: &ContextAccess) -> String {
    if content.is_empty() {
        return content.to_owned();
    }

    let mut result = content.to_owned();

    match access.architecture {
        ScopeLevel::None if ARCH_HEADING.is_match(&result) => {
            result = strip_marked_sections(&result, &ARCH_HEADING);
        },
        ScopeLevel::Summary if ARCH_HEADING.is_match(&result) => {
            result = summarize_architecture(&result);
        },
        _ => {},
    }

    match access.business_logic {
        ScopeLevel::None => {
            result = ANY_CODE_BLOCK
                .replace_all(&result, "[code block filtered]")
                .into_owned();
        },
        ScopeLevel::Redacted => {
            result = CODE_BLOCK
                .replace_all(&result, |caps: &regex::Captures<'_>| {
                    let block = &caps[0];
                    let Some((fence_line, rest)) = block.split_once('\n') else {
                        return block.to_owned();
                    };
                    let (code, closing) = rest
                        .strip_suffix("```")
                        .map_or((rest, ""), |c| (c, "```"));
                    format!("{fence_line}\n{}{closing}", redact_function_bodies(code))
                })
                .into_owned();
        },
        _ => {},
    }

    match access.security {
        ScopeLevel::None => {
            result = strip_security_content(&result);
        },
        ScopeLevel::Redacted => {
            result = CVE_ID.replace_all(&result, "[CVE-redacted]").into_owned();
        },
        _ => {},
    }

    match access.lore {
        ScopeLevel::None if LORE_HEADING.is_match(&result) => {
            result = strip_marked_sections(&result, &LORE_HEADING);
        },
        ScopeLevel::Summary if LORE_HEADING.is_match(&result) => {
            result = summarize_lore(&result);
        },
        _ => {},
    }

    result
}

/// Filter message context per a model's trust scopes.
///
/// Native runtime models bypass filtering entirely: the runtime has
/// direct workspace access, so prompt filtering would be theater. When
/// all dimensions are `full` the input is returned unchanged. Otherwise
/// each string-valued content is transformed in an independent copy;
/// structured (non-string) content passes through with a warning.
#[must_use]
pub fn filter_context(
    messages: &[Message],
    access: Option<ContextAccess>,
    is_native_runtime: bool,
) -> Vec<Message> {
    if is_native_runtime {
        return messages.to_vec();
    }

    let access = access.unwrap_or_default();
    if access.is_all_full() {
        return messages.to_vec();
    }

    info!(
        dimensions = ?access.restricted_dimensions(),
        "applying context filter"
    );

    messages
        .iter()
        .map(|msg| {
            let mut msg = msg.clone();
            match &msg.content {
                serde_json::Value::String(s) if !s.is_empty() => {
                    msg.content =
                        serde_json::Value::String(filter_message_content(s, &access));
                },
                serde_json::Value::String(_) | serde_json::Value::Null => {},
                other => {
                    warn!(
                        role = ?msg.role,
                        content_type = %json_type_name(other),
                        "non-string content bypasses context filtering"
                    );
                },
            }
            msg
        })
        .collect()
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Audit-mode filtering: run the pipeline on a copy, log the impact,
/// and return the original messages unmodified.
#[must_use]
pub fn audit_filter_context(
    messages: &[Message],
    access: Option<ContextAccess>,
    provider: &str,
    model_id: &str,
    is_native_runtime: bool,
) -> Vec<Message> {
    if is_native_runtime {
        return messages.to_vec();
    }

    let resolved = access.unwrap_or_default();
    if resolved.is_all_full() {
        return messages.to_vec();
    }

    let filtered = filter_context(messages, Some(resolved), false);

    let char_count = |msgs: &[Message]| -> usize {
        msgs.iter()
            .filter_map(|m| m.content.as_str().map(str::len))
            .sum()
    };
    let original_chars = char_count(messages);
    let filtered_chars = char_count(&filtered);

    warn!(
        model = %format!("{provider}:{model_id}"),
        dimensions = ?resolved.restricted_dimensions(),
        original_chars,
        filtered_chars,
        chars_removed = original_chars.saturating_sub(filtered_chars),
        "context filter audit"
    );

    messages.to_vec()
}

/// Loads and caches the model-permissions file, invalidating when its
/// modification time changes so long-running callers pick up edits
/// without restart.
#[derive(Debug)]
pub struct PermissionsCache {
    path: PathBuf,
    cache: RefCell<Option<(SystemTime, Value)>>,
}

impl PermissionsCache {
    /// Create a cache over the given permissions file.
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            cache: RefCell::new(None),
        }
    }

    /// Drop the cached document so the next lookup reloads.
    pub fn invalidate(&self) {
        *self.cache.borrow_mut() = None;
    }

    fn load(&self) -> Value {
        let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => {
                warn!(path = %self.path.display(), "model permissions file not found");
                return Value::Null;
            },
        };

        if let Some((cached_mtime, doc)) = self.cache.borrow().as_ref() {
            if *cached_mtime == mtime {
                return doc.clone();
            }
        }

        let doc = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_yaml::from_str(&content).ok())
            .unwrap_or(Value::Null);
        *self.cache.borrow_mut() = Some((mtime, doc.clone()));
        doc
    }

    /// Look up `context_access` for a provider:model pair. `None` means
    /// no entry (which defaults to unrestricted).
    #[must_use]
    pub fn lookup(&self, provider: &str, model_id: &str) -> Option<ContextAccess> {
        let doc = self.load();
        let key = format!("{provider}:{model_id}");
        let raw = doc
            .get("model_permissions")?
            .get(key.as_str())?
            .get("trust_scopes")?
            .get("context_access")?;
        serde_yaml::from_value(raw.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(
        architecture: ScopeLevel,
        business_logic: ScopeLevel,
        security: ScopeLevel,
        lore: ScopeLevel,
    ) -> ContextAccess {
        ContextAccess {
            architecture,
            business_logic,
            security,
            lore,
        }
    }

    fn user(content: &str) -> Message {
        Message::user(content)
    }

    #[test]
    fn test_all_full_is_byte_identical() {
        let messages = vec![
            Message::system("## Architecture\ndetails"),
            user("```python\ndef f():\n    pass\n```"),
        ];
        let out = filter_context(&messages, Some(ContextAccess::default()), false);
        for (a, b) in messages.iter().zip(&out) {
            assert_eq!(a.content, b.content);
        }
    }

    #[test]
    fn test_absent_scopes_means_full() {
        let messages = vec![user("CVE-2024-1234 in the payment flow")];
        let out = filter_context(&messages, None, false);
        assert_eq!(out[0].content.as_str().unwrap(), messages[0].content.as_str().unwrap());
    }

    #[test]
    fn test_native_runtime_bypasses_everything() {
        let messages = vec![user("CVE-2024-1234")];
        let restrictive = access(
            ScopeLevel::None,
            ScopeLevel::None,
            ScopeLevel::None,
            ScopeLevel::None,
        );
        let out = filter_context(&messages, Some(restrictive), true);
        assert!(out[0].content.as_str().unwrap().contains("CVE-2024-1234"));
    }

    #[test]
    fn test_security_redacted_rewrites_cves() {
        let messages = vec![user("Fix CVE-2024-1234 and CVE-2023-999 now")];
        let scopes = access(
            ScopeLevel::Full,
            ScopeLevel::Full,
            ScopeLevel::Redacted,
            ScopeLevel::Full,
        );
        let out = filter_context(&messages, Some(scopes), false);
        let text = out[0].content.as_str().unwrap();
        assert!(!text.contains("CVE-2024-1234"));
        assert!(text.contains("[CVE-redacted]"));
    }

    #[test]
    fn test_security_none_drops_sections() {
        let doc = "# Report\nintro\n## Security\nCVE-2024-1 details\nmore\n## Next Steps\nplan\n";
        let scopes = access(
            ScopeLevel::Full,
            ScopeLevel::Full,
            ScopeLevel::None,
            ScopeLevel::Full,
        );
        let out = filter_context(&[user(doc)], Some(scopes), false);
        let text = out[0].content.as_str().unwrap();
        assert!(!text.contains("CVE-2024-1"));
        assert!(text.contains("Next Steps"));
        assert!(text.contains("intro"));
    }

    #[test]
    fn test_business_logic_none_removes_code_blocks() {
        let doc = "before\n```python\ndef secret():\n    return 42\n```\nafter";
        let scopes = access(
            ScopeLevel::Full,
            ScopeLevel::None,
            ScopeLevel::Full,
            ScopeLevel::Full,
        );
        let out = filter_context(&[user(doc)], Some(scopes), false);
        let text = out[0].content.as_str().unwrap();
        assert!(!text.contains("return 42"));
        assert!(text.contains("[code block filtered]"));
        assert!(text.contains("before"));
        assert!(text.contains("after"));
    }

    #[test]
    fn test_business_logic_redacted_keeps_signatures() {
        let doc = "```python\ndef compute_margin(x):\n    return x * 0.42\n```";
        let scopes = access(
            ScopeLevel::Full,
            ScopeLevel::Redacted,
            ScopeLevel::Full,
            ScopeLevel::Full,
        );
        let out = filter_context(&[user(doc)], Some(scopes), false);
        let text = out[0].content.as_str().unwrap();
        assert!(text.contains("def compute_margin(x):"));
        assert!(text.contains("[redacted]"));
        assert!(!text.contains("0.42"));
    }

    #[test]
    fn test_architecture_summary_caps_sections() {
        let line = "x".repeat(300);
        let doc = format!("## Architecture\n{line}\n{line}\n{line}\n{line}");
        let scopes = access(
            ScopeLevel::Summary,
            ScopeLevel::Full,
            ScopeLevel::Full,
            ScopeLevel::Full,
        );
        let out = filter_context(&[user(&doc)], Some(scopes), false);
        let text = out[0].content.as_str().unwrap();
        assert!(text.len() < doc.len());
        assert!(text.contains("## Architecture"));
        assert!(text.contains("[... content summarized ...]"));
    }

    #[test]
    fn test_architecture_none_drops_marked_sections() {
        let doc = "## Architecture\nsecret layout\n# Notes\nkeep this";
        let scopes = access(
            ScopeLevel::None,
            ScopeLevel::Full,
            ScopeLevel::Full,
            ScopeLevel::Full,
        );
        let out = filter_context(&[user(doc)], Some(scopes), false);
        let text = out[0].content.as_str().unwrap();
        assert!(!text.contains("secret layout"));
        assert!(text.contains("keep this"));
    }

    #[test]
    fn test_lore_summary_strips_context_blocks() {
        let doc = "# Lore\nname: origin\ncontext: |\n  long tale line one\n  long tale line two\nsummary: short\n";
        let scopes = access(
            ScopeLevel::Full,
            ScopeLevel::Full,
            ScopeLevel::Full,
            ScopeLevel::Summary,
        );
        let out = filter_context(&[user(doc)], Some(scopes), false);
        let text = out[0].content.as_str().unwrap();
        assert!(!text.contains("long tale"));
        assert!(text.contains("summary: short"));
    }

    #[test]
    fn test_non_string_content_passes_through() {
        let structured = Message {
            role: cheval_core::MessageRole::User,
            content: serde_json::json!([{ "type": "text", "text": "CVE-2024-1" }]),
        };
        let scopes = access(
            ScopeLevel::Full,
            ScopeLevel::Full,
            ScopeLevel::Redacted,
            ScopeLevel::Full,
        );
        let out = filter_context(&[structured.clone()], Some(scopes), false);
        assert_eq!(out[0].content, structured.content);
    }

    #[test]
    fn test_audit_mode_returns_originals() {
        let messages = vec![user("Fix CVE-2024-1234 now")];
        let scopes = access(
            ScopeLevel::None,
            ScopeLevel::None,
            ScopeLevel::None,
            ScopeLevel::None,
        );
        let out = audit_filter_context(&messages, Some(scopes), "openai", "gpt-5.2", false);
        assert_eq!(
            out[0].content.as_str().unwrap(),
            messages[0].content.as_str().unwrap()
        );
    }

    #[test]
    fn test_permissions_cache_lookup_and_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model-permissions.yaml");
        std::fs::write(
            &path,
            r"
model_permissions:
  openai:gpt-5.2:
    trust_scopes:
      context_access:
        architecture: summary
        security: none
",
        )
        .unwrap();

        let cache = PermissionsCache::new(&path);
        let scopes = cache.lookup("openai", "gpt-5.2").unwrap();
        assert_eq!(scopes.architecture, ScopeLevel::Summary);
        assert_eq!(scopes.security, ScopeLevel::None);
        assert_eq!(scopes.business_logic, ScopeLevel::Full);

        assert!(cache.lookup("openai", "unlisted-model").is_none());

        cache.invalidate();
        assert!(cache.lookup("openai", "gpt-5.2").is_some());
    }

    #[test]
    fn test_permissions_cache_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PermissionsCache::new(&dir.path().join("absent.yaml"));
        assert!(cache.lookup("openai", "gpt-5.2").is_none());
    }
}
