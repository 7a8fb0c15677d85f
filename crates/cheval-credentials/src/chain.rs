//! Credential provider chain.
//!
//! Precedence (highest → lowest): environment, project `.env.local`.
//! Additional stores (e.g. an encrypted keyring) plug in behind
//! [`CredentialProvider`] without touching callers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use regex::Regex;

/// A source of credential values.
pub trait CredentialProvider {
    /// Return the credential value, or `None` if this source lacks it.
    fn get(&self, credential_id: &str) -> Option<String>;

    /// Human-readable source name for diagnostics.
    fn name(&self) -> String;
}

/// Reads credentials from environment variables.
#[derive(Debug, Default)]
pub struct EnvProvider;

impl CredentialProvider for EnvProvider {
    fn get(&self, credential_id: &str) -> Option<String> {
        std::env::var(credential_id).ok()
    }

    fn name(&self) -> String {
        "environment".to_owned()
    }
}

static DOTENV_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*)$").expect("valid regex")
});

/// Reads credentials from `.env.local` in the project root.
///
/// Parses `KEY=VALUE` lines, ignoring comments and blanks and stripping
/// surrounding quotes. The parse is cached and invalidated on mtime
/// change so long-running callers pick up edits.
#[derive(Debug)]
pub struct DotenvProvider {
    path: PathBuf,
    cache: RefCell<Option<(SystemTime, HashMap<String, String>)>>,
}

impl DotenvProvider {
    /// Create a provider reading `<project_root>/.env.local`.
    #[must_use]
    pub fn new(project_root: &Path) -> Self {
        Self {
            path: project_root.join(".env.local"),
            cache: RefCell::new(None),
        }
    }

    fn parse(content: &str) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(caps) = DOTENV_LINE.captures(line) {
                let key = caps[1].to_owned();
                let mut val = caps[2].trim().to_owned();
                if val.len() >= 2 {
                    let bytes = val.as_bytes();
                    let first = bytes[0];
                    if (first == b'"' || first == b'\'') && bytes[bytes.len() - 1] == first {
                        val = val[1..val.len() - 1].to_owned();
                    }
                }
                vars.insert(key, val);
            }
        }
        vars
    }

    fn load(&self) -> HashMap<String, String> {
        let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => {
                *self.cache.borrow_mut() = None;
                return HashMap::new();
            },
        };

        if let Some((cached_mtime, vars)) = self.cache.borrow().as_ref() {
            if *cached_mtime == mtime {
                return vars.clone();
            }
        }

        let vars = std::fs::read_to_string(&self.path)
            .map(|content| Self::parse(&content))
            .unwrap_or_default();
        *self.cache.borrow_mut() = Some((mtime, vars.clone()));
        vars
    }
}

impl CredentialProvider for DotenvProvider {
    fn get(&self, credential_id: &str) -> Option<String> {
        self.load().get(credential_id).cloned()
    }

    fn name(&self) -> String {
        "dotenv (.env.local)".to_owned()
    }
}

/// Chains providers in priority order; first non-`None` wins.
pub struct CompositeProvider {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl CompositeProvider {
    /// Build a composite from an ordered provider list.
    #[must_use]
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    /// The chained providers, for diagnostics.
    #[must_use]
    pub fn providers(&self) -> &[Box<dyn CredentialProvider>] {
        &self.providers
    }
}

impl CredentialProvider for CompositeProvider {
    fn get(&self, credential_id: &str) -> Option<String> {
        self.providers.iter().find_map(|p| p.get(credential_id))
    }

    fn name(&self) -> String {
        let names: Vec<String> = self.providers.iter().map(|p| p.name()).collect();
        format!("composite({})", names.join(" -> "))
    }
}

impl std::fmt::Debug for CompositeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeProvider")
            .field("chain", &self.name())
            .finish()
    }
}

/// Build the default credential chain: env → `.env.local`.
#[must_use]
pub fn default_chain(project_root: &Path) -> CompositeProvider {
    CompositeProvider::new(vec![
        Box::new(EnvProvider),
        Box::new(DotenvProvider::new(project_root)),
    ])
}
