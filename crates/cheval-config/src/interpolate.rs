//! Secret interpolation for `{env:VAR}` and `{file:PATH}` tokens.
//!
//! Interpolation runs over the merged config tree before it is
//! deserialized into the typed schema. Env lookups are allowlisted;
//! file reads are restricted to declared secret directories and checked
//! for symlinks, ownership, and permissive mode bits. Command
//! interpolation is disabled unless explicitly enabled in config.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use cheval_core::{ChevalError, ChevalResult};
use regex::Regex;
use serde_yaml::Value;

/// Interpolation token: `{env:NAME}`, `{file:PATH}`, or `{cmd:...}`.
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(env|file|cmd):([^}]+)\}").expect("valid regex"));

/// Core env-var allowlist, always applied.
static CORE_ENV_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^LOA_",
        r"^OPENAI_API_KEY$",
        r"^ANTHROPIC_API_KEY$",
        r"^MOONSHOT_API_KEY$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

/// Mode bits that make a secret file unsafe: group write, or any
/// read/write/exec for others.
const UNSAFE_MODE_BITS: u32 = 0o137;

/// Everything interpolation needs besides the value itself.
pub struct InterpolationContext {
    /// Project root for relative `{file:...}` paths.
    pub project_root: PathBuf,
    /// Project-declared env allowlist patterns, pre-compiled.
    pub extra_env_patterns: Vec<Regex>,
    /// Extra allowed directories for `{file:...}`.
    pub allowed_file_dirs: Vec<PathBuf>,
    /// Whether `{cmd:...}` may be used at all.
    pub commands_enabled: bool,
}

impl InterpolationContext {
    /// Build a context from the raw allowlist strings, failing on any
    /// invalid regex.
    pub fn new(
        project_root: impl Into<PathBuf>,
        env_allowlist: &[String],
        allowed_file_dirs: Vec<PathBuf>,
        commands_enabled: bool,
    ) -> ChevalResult<Self> {
        let mut extra_env_patterns = Vec::with_capacity(env_allowlist.len());
        for pattern in env_allowlist {
            let compiled = Regex::new(pattern).map_err(|e| {
                ChevalError::invalid_config(format!(
                    "invalid regex in secret_env_allowlist: {pattern}: {e}"
                ))
            })?;
            extra_env_patterns.push(compiled);
        }
        Ok(Self {
            project_root: project_root.into(),
            extra_env_patterns,
            allowed_file_dirs,
            commands_enabled,
        })
    }

    fn env_allowed(&self, var_name: &str) -> bool {
        CORE_ENV_PATTERNS
            .iter()
            .chain(self.extra_env_patterns.iter())
            .any(|p| p.is_match(var_name))
    }
}

/// Resolve interpolation tokens in a single string value.
///
/// # Errors
///
/// `INVALID_CONFIG` on a disallowed env var, an unset env var, a file
/// failing the safety checks, or a `{cmd:...}` token.
pub fn interpolate_value(value: &str, ctx: &InterpolationContext) -> ChevalResult<String> {
    let mut result = String::with_capacity(value.len());
    let mut last_end = 0;

    for caps in TOKEN_RE.captures_iter(value) {
        let whole = caps.get(0).expect("capture 0 always present");
        result.push_str(&value[last_end..whole.start()]);
        last_end = whole.end();

        let source_type = &caps[1];
        let source_ref = &caps[2];

        let resolved = match source_type {
            "env" => resolve_env(source_ref, ctx)?,
            "file" => resolve_file(source_ref, ctx)?,
            "cmd" => {
                if !ctx.commands_enabled {
                    return Err(ChevalError::invalid_config(
                        "command interpolation ({cmd:...}) is disabled; \
                         set hounfour.secret_commands_enabled: true",
                    ));
                }
                return Err(ChevalError::invalid_config(
                    "command interpolation is not implemented",
                ));
            },
            other => {
                return Err(ChevalError::invalid_config(format!(
                    "unknown interpolation type: {other}"
                )));
            },
        };
        result.push_str(&resolved);
    }

    result.push_str(&value[last_end..]);
    Ok(result)
}

fn resolve_env(var_name: &str, ctx: &InterpolationContext) -> ChevalResult<String> {
    if !ctx.env_allowed(var_name) {
        return Err(ChevalError::invalid_config(format!(
            "environment variable '{var_name}' is not in the allowlist. \
             Allowed: ^LOA_.*, ^OPENAI_API_KEY$, ^ANTHROPIC_API_KEY$, ^MOONSHOT_API_KEY$"
        )));
    }
    std::env::var(var_name).map_err(|_| {
        ChevalError::invalid_config(format!("environment variable '{var_name}' is not set"))
    })
}

fn resolve_file(file_path: &str, ctx: &InterpolationContext) -> ChevalResult<String> {
    let resolved = check_file_allowed(file_path, ctx)?;
    let content = std::fs::read_to_string(&resolved).map_err(|e| {
        ChevalError::invalid_config(format!(
            "failed to read secret file {}: {e}",
            resolved.display()
        ))
    })?;
    Ok(content.trim().to_owned())
}

/// Validate a `{file:...}` path and return its resolved location.
fn check_file_allowed(file_path: &str, ctx: &InterpolationContext) -> ChevalResult<PathBuf> {
    let raw = Path::new(file_path);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        ctx.project_root.join(raw)
    };

    if joined.is_symlink() {
        return Err(ChevalError::invalid_config(format!(
            "secret file must not be a symlink: {file_path}"
        )));
    }

    let resolved = joined.canonicalize().map_err(|_| {
        ChevalError::invalid_config(format!("secret file not found: {}", joined.display()))
    })?;

    let config_d = ctx.project_root.join(".loa.config.d");
    let allowed_roots: Vec<PathBuf> = std::iter::once(config_d)
        .chain(ctx.allowed_file_dirs.iter().cloned())
        .filter_map(|d| d.canonicalize().ok())
        .collect();

    if !allowed_roots.iter().any(|root| resolved.starts_with(root)) {
        return Err(ChevalError::invalid_config(format!(
            "secret file '{file_path}' not in allowed directories. \
             Allowed: .loa.config.d/ or paths in hounfour.secret_paths"
        )));
    }

    let metadata = std::fs::metadata(&resolved).map_err(|e| {
        ChevalError::invalid_config(format!(
            "cannot stat secret file {}: {e}",
            resolved.display()
        ))
    })?;
    if !metadata.is_file() {
        return Err(ChevalError::invalid_config(format!(
            "secret file is not a regular file: {}",
            resolved.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        let file_uid = metadata.uid();
        let current_uid = nix::unistd::geteuid().as_raw();
        if file_uid != current_uid {
            return Err(ChevalError::invalid_config(format!(
                "secret file not owned by current user: {}",
                resolved.display()
            )));
        }

        let mode = metadata.mode() & 0o777;
        if mode & UNSAFE_MODE_BITS != 0 {
            return Err(ChevalError::invalid_config(format!(
                "secret file has unsafe permissions ({mode:o}): {}. Must be <= 0640",
                resolved.display()
            )));
        }
    }

    Ok(resolved)
}

/// Recursively interpolate all string values in a config tree.
///
/// Keys whose values contained tokens are recorded in `secret_keys`
/// (dotted paths) so the display layer can redact them.
pub fn interpolate_tree(
    value: &Value,
    ctx: &InterpolationContext,
    path: &str,
    secret_keys: &mut BTreeSet<String>,
) -> ChevalResult<Value> {
    match value {
        Value::String(s) if TOKEN_RE.is_match(s) => {
            secret_keys.insert(path.to_owned());
            Ok(Value::String(interpolate_value(s, ctx)?))
        },
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::with_capacity(map.len());
            for (k, v) in map {
                let key_str = k.as_str().unwrap_or_default();
                let child_path = if path.is_empty() {
                    key_str.to_owned()
                } else {
                    format!("{path}.{key_str}")
                };
                out.insert(k.clone(), interpolate_tree(v, ctx, &child_path, secret_keys)?);
            }
            Ok(Value::Mapping(out))
        },
        Value::Sequence(seq) => {
            let mut out = Vec::with_capacity(seq.len());
            for item in seq {
                out.push(interpolate_tree(item, ctx, path, secret_keys)?);
            }
            Ok(Value::Sequence(out))
        },
        other => Ok(other.clone()),
    }
}

/// Whether a string still contains an interpolation token.
#[must_use]
pub fn contains_token(value: &str) -> bool {
    TOKEN_RE.is_match(value)
}

/// Token source annotations for display, e.g. `env:OPENAI_API_KEY`.
#[must_use]
pub fn token_sources(value: &str) -> Vec<String> {
    TOKEN_RE
        .captures_iter(value)
        .map(|c| format!("{}:{}", &c[1], &c[2]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ctx(root: &Path) -> InterpolationContext {
        InterpolationContext::new(root, &[], Vec::new(), false).unwrap()
    }

    #[test]
    fn test_env_interpolation_allowlisted() {
        std::env::set_var("LOA_TEST_SECRET_A", "value-a");
        let dir = tempfile::tempdir().unwrap();
        let out = interpolate_value("{env:LOA_TEST_SECRET_A}", &ctx(dir.path())).unwrap();
        assert_eq!(out, "value-a");
        std::env::remove_var("LOA_TEST_SECRET_A");
    }

    #[test]
    fn test_env_interpolation_rejects_unlisted() {
        let dir = tempfile::tempdir().unwrap();
        let err = interpolate_value("{env:HOME}", &ctx(dir.path())).unwrap_err();
        assert_eq!(err.kind, cheval_core::ErrorKind::InvalidConfig);
        assert!(err.message.contains("allowlist"));
    }

    #[test]
    fn test_env_interpolation_unset_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = interpolate_value("{env:LOA_NEVER_SET_XYZ}", &ctx(dir.path())).unwrap_err();
        assert!(err.message.contains("not set"));
    }

    #[test]
    fn test_cmd_interpolation_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let err = interpolate_value("{cmd:cat /etc/passwd}", &ctx(dir.path())).unwrap_err();
        assert!(err.message.contains("disabled"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_interpolation_happy_path() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let secrets = dir.path().join(".loa.config.d");
        std::fs::create_dir(&secrets).unwrap();
        let secret_file = secrets.join("api-key");
        {
            let mut f = std::fs::File::create(&secret_file).unwrap();
            writeln!(f, "sk-from-file").unwrap();
        }
        std::fs::set_permissions(&secret_file, std::fs::Permissions::from_mode(0o600)).unwrap();

        let out = interpolate_value("{file:.loa.config.d/api-key}", &ctx(dir.path())).unwrap();
        assert_eq!(out, "sk-from-file");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_interpolation_rejects_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let secrets = dir.path().join(".loa.config.d");
        std::fs::create_dir(&secrets).unwrap();
        let secret_file = secrets.join("api-key");
        std::fs::write(&secret_file, "leaky").unwrap();
        std::fs::set_permissions(&secret_file, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = interpolate_value("{file:.loa.config.d/api-key}", &ctx(dir.path())).unwrap_err();
        assert!(err.message.contains("unsafe permissions"));
    }

    #[test]
    fn test_file_interpolation_rejects_outside_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("plain.txt");
        std::fs::write(&outside, "nope").unwrap();

        let err = interpolate_value("{file:plain.txt}", &ctx(dir.path())).unwrap_err();
        assert!(err.message.contains("not in allowed directories"));
    }

    #[test]
    fn test_tree_interpolation_tracks_secret_keys() {
        std::env::set_var("LOA_TEST_SECRET_B", "resolved-b");
        let dir = tempfile::tempdir().unwrap();
        let tree: Value = serde_yaml::from_str(
            "providers:\n  openai:\n    auth: \"{env:LOA_TEST_SECRET_B}\"\n    endpoint: https://x\n",
        )
        .unwrap();

        let mut secret_keys = BTreeSet::new();
        let out = interpolate_tree(&tree, &ctx(dir.path()), "", &mut secret_keys).unwrap();

        assert!(secret_keys.contains("providers.openai.auth"));
        let auth = out["providers"]["openai"]["auth"].as_str().unwrap();
        assert_eq!(auth, "resolved-b");
        std::env::remove_var("LOA_TEST_SECRET_B");
    }

    #[test]
    fn test_token_sources() {
        assert_eq!(
            token_sources("{env:OPENAI_API_KEY}"),
            vec!["env:OPENAI_API_KEY".to_owned()]
        );
        assert!(token_sources("plain").is_empty());
    }
}
