//! Long-running interaction support: crash-recoverable registry and
//! deep-research citation extraction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use cheval_core::{ChevalError, ChevalResult};
use fs2::FileExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

/// Metadata persisted per in-flight interaction so external tooling can
/// resume polling or cancel after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    /// Model the interaction was started on.
    pub model: String,
    /// Wall-clock start, seconds since the epoch.
    pub start_time: f64,
    /// Pid of the process that created the interaction.
    pub pid: u32,
}

/// On-disk registry `interaction_id → record`, guarded by a sibling
/// `.lock` file under exclusive flock.
#[derive(Debug)]
pub struct InteractionRegistry {
    path: PathBuf,
}

impl InteractionRegistry {
    /// Registry at `<run_dir>/.dr-interactions.json`.
    #[must_use]
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join(".dr-interactions.json"),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".lock");
        self.path.with_file_name(name)
    }

    fn with_lock<T>(
        &self,
        f: impl FnOnce() -> std::io::Result<T>,
    ) -> ChevalResult<T> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ChevalError::invalid_config(format!(
                    "cannot create registry dir {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let lock_file = std::fs::File::create(self.lock_path()).map_err(|e| {
            ChevalError::invalid_config(format!("cannot create registry lock: {e}"))
        })?;
        lock_file.lock_exclusive().map_err(|e| {
            ChevalError::invalid_config(format!("cannot lock registry: {e}"))
        })?;
        let result = f();
        let _ = fs2::FileExt::unlock(&lock_file);
        result.map_err(|e| {
            ChevalError::invalid_config(format!(
                "registry update failed for {}: {e}",
                self.path.display()
            ))
        })
    }

    fn read_unlocked(&self) -> BTreeMap<String, InteractionRecord> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Persist a newly created interaction.
    ///
    /// # Errors
    ///
    /// I/O failures on the registry or its lock file.
    pub fn record(&self, interaction_id: &str, model: &str) -> ChevalResult<()> {
        self.with_lock(|| {
            let mut entries = self.read_unlocked();
            entries.insert(
                interaction_id.to_owned(),
                InteractionRecord {
                    model: model.to_owned(),
                    start_time: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs_f64())
                        .unwrap_or(0.0),
                    pid: std::process::id(),
                },
            );
            std::fs::write(&self.path, serde_json::to_string_pretty(&entries)?)
        })
    }

    /// Drop a finished interaction from the registry.
    ///
    /// # Errors
    ///
    /// I/O failures on the registry or its lock file.
    pub fn remove(&self, interaction_id: &str) -> ChevalResult<()> {
        self.with_lock(|| {
            let mut entries = self.read_unlocked();
            entries.remove(interaction_id);
            std::fs::write(&self.path, serde_json::to_string_pretty(&entries)?)
        })
    }

    /// Load all persisted interactions (lock-free read for recovery
    /// tooling).
    #[must_use]
    pub fn load(&self) -> BTreeMap<String, InteractionRecord> {
        self.read_unlocked()
    }
}

static REF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("valid regex"));

static DOI_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"10\.\d{4,}/[^\s,)]+").expect("valid regex"));

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"'\]),]+[^\s<>"'\]),.]"#).expect("valid regex")
});

/// Extract structured citations from deep-research output.
///
/// Recognizes bracketed references `[N]`, DOIs, and bare URLs, each
/// emitted as `{type, ...}` objects. Extraction never fails: anything
/// unparseable degrades to an empty citation list with a warning.
#[must_use]
pub fn normalize_citations(raw_output: &str) -> Value {
    if raw_output.is_empty() {
        return json!({ "summary": "", "claims": [], "citations": [], "raw_output": "" });
    }

    let mut citations = Vec::new();

    let mut refs: Vec<u64> = REF_PATTERN
        .captures_iter(raw_output)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    refs.sort_unstable();
    refs.dedup();
    for reference in refs {
        citations.push(json!({ "type": "reference", "id": reference.to_string() }));
    }

    for doi in DOI_PATTERN.find_iter(raw_output) {
        citations.push(json!({ "type": "doi", "value": doi.as_str() }));
    }
    for url in URL_PATTERN.find_iter(raw_output) {
        citations.push(json!({ "type": "url", "value": url.as_str() }));
    }

    if citations.is_empty() {
        warn!("no citations extracted from deep-research output");
    }

    let summary: String = raw_output.chars().take(500).collect();
    json!({
        "summary": summary,
        "claims": [],
        "citations": citations,
        "raw_output": raw_output,
    })
}
