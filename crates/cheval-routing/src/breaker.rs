//! File-persisted circuit breaker, one state machine per provider.
//!
//! States: `CLOSED` → `OPEN` → `HALF_OPEN` → (`CLOSED` | `OPEN`).
//! State lives in `circuit-breaker-<provider>.json` under the run
//! directory.
//!
//! Reads and writes take independent locks, so read-modify-write
//! sequences are NOT atomic across processes: two concurrent callers
//! may both read the same count, both increment, and one write wins.
//! Best-effort counting is acceptable here because a missed count
//! self-corrects on the next failure; compare the daily-spend counter,
//! which holds its lock across the full read-modify-write because cost
//! accounting requires atomicity.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use cheval_config::BreakerSettings;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Requests flow; failures are counted.
    #[serde(rename = "CLOSED")]
    Closed,
    /// Requests are skipped until the reset timeout elapses.
    #[serde(rename = "OPEN")]
    Open,
    /// A bounded number of probes may test the provider.
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerFile {
    provider: String,
    state: BreakerState,
    failure_count: u32,
    last_failure_ts: Option<f64>,
    opened_at: Option<f64>,
    half_open_probes: u32,
}

impl BreakerFile {
    fn default_for(provider: &str) -> Self {
        Self {
            provider: provider.to_owned(),
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_ts: None,
            opened_at: None,
            half_open_probes: 0,
        }
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Per-provider circuit breaker backed by files in a run directory.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    run_dir: PathBuf,
    settings: BreakerSettings,
}

impl CircuitBreaker {
    /// Create a breaker over the given run directory.
    #[must_use]
    pub fn new(run_dir: &Path, settings: BreakerSettings) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            settings,
        }
    }

    fn state_path(&self, provider: &str) -> PathBuf {
        self.run_dir.join(format!("circuit-breaker-{provider}.json"))
    }

    /// Read state, defaulting to CLOSED on a missing or corrupt file.
    fn read(&self, provider: &str) -> BreakerFile {
        let path = self.state_path(provider);
        let Ok(mut file) = std::fs::File::open(&path) else {
            return BreakerFile::default_for(provider);
        };
        let _ = file.lock_shared();
        let mut raw = String::new();
        let read_ok = file.read_to_string(&mut raw).is_ok();
        let _ = fs2::FileExt::unlock(&file);

        if !read_ok {
            return BreakerFile::default_for(provider);
        }
        match serde_json::from_str::<BreakerFile>(&raw) {
            Ok(state) if state.provider == provider => state,
            _ => BreakerFile::default_for(provider),
        }
    }

    fn write(&self, state: &BreakerFile) {
        if std::fs::create_dir_all(&self.run_dir).is_err() {
            warn!(dir = %self.run_dir.display(), "cannot create breaker run dir");
            return;
        }
        let path = self.state_path(&state.provider);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path);
        let Ok(mut file) = file else {
            warn!(path = %path.display(), "cannot open breaker state for write");
            return;
        };
        if file.lock_exclusive().is_err() {
            return;
        }
        let _ = (|| -> std::io::Result<()> {
            file.seek(SeekFrom::Start(0))?;
            file.set_len(0)?;
            file.write_all(serde_json::to_string_pretty(state)?.as_bytes())
        })();
        let _ = fs2::FileExt::unlock(&file);
    }

    /// Current state for a provider, applying the OPEN → HALF_OPEN
    /// transition when the reset timeout has elapsed. In HALF_OPEN,
    /// reads past the probe cap report OPEN.
    pub fn check_state(&self, provider: &str) -> BreakerState {
        let mut state = self.read(provider);

        match state.state {
            BreakerState::Open => {
                if let Some(opened_at) = state.opened_at {
                    if now_epoch() - opened_at >= self.settings.reset_timeout_seconds as f64 {
                        state.state = BreakerState::HalfOpen;
                        state.half_open_probes = 0;
                        self.write(&state);
                        info!(provider, "circuit breaker OPEN -> HALF_OPEN (reset timeout expired)");
                        return BreakerState::HalfOpen;
                    }
                }
                BreakerState::Open
            },
            BreakerState::HalfOpen => {
                if state.half_open_probes >= self.settings.half_open_max_probes {
                    BreakerState::Open
                } else {
                    BreakerState::HalfOpen
                }
            },
            BreakerState::Closed => BreakerState::Closed,
        }
    }

    /// Record a failure; may trip CLOSED → OPEN or HALF_OPEN → OPEN.
    /// Returns the state after recording.
    pub fn record_failure(&self, provider: &str) -> BreakerState {
        let mut state = self.read(provider);
        let now = now_epoch();

        match state.state {
            BreakerState::HalfOpen => {
                // Probe failed; the timer restarts.
                state.state = BreakerState::Open;
                state.opened_at = Some(now);
                state.half_open_probes = 0;
                self.write(&state);
                warn!(provider, "circuit breaker HALF_OPEN -> OPEN (probe failed)");
                BreakerState::Open
            },
            BreakerState::Closed => {
                if let Some(last) = state.last_failure_ts {
                    if now - last > self.settings.count_window_seconds as f64 {
                        state.failure_count = 0;
                    }
                }
                state.failure_count += 1;
                state.last_failure_ts = Some(now);

                if state.failure_count >= self.settings.failure_threshold {
                    state.state = BreakerState::Open;
                    state.opened_at = Some(now);
                    self.write(&state);
                    warn!(
                        provider,
                        failures = state.failure_count,
                        threshold = self.settings.failure_threshold,
                        "circuit breaker CLOSED -> OPEN"
                    );
                    BreakerState::Open
                } else {
                    self.write(&state);
                    BreakerState::Closed
                }
            },
            BreakerState::Open => {
                // Already open; refresh the failure stamp, not the timer.
                state.last_failure_ts = Some(now);
                self.write(&state);
                BreakerState::Open
            },
        }
    }

    /// Record a success; HALF_OPEN resets to the default CLOSED state,
    /// and a CLOSED breaker drops its failure count.
    pub fn record_success(&self, provider: &str) -> BreakerState {
        let mut state = self.read(provider);

        match state.state {
            BreakerState::HalfOpen => {
                let fresh = BreakerFile::default_for(provider);
                self.write(&fresh);
                info!(provider, "circuit breaker HALF_OPEN -> CLOSED (probe succeeded)");
                BreakerState::Closed
            },
            BreakerState::Closed => {
                if state.failure_count > 0 {
                    state.failure_count = 0;
                    self.write(&state);
                }
                BreakerState::Closed
            },
            BreakerState::Open => BreakerState::Open,
        }
    }

    /// Count a half-open probe before attempting it.
    pub fn increment_probe(&self, provider: &str) {
        let mut state = self.read(provider);
        if state.state == BreakerState::HalfOpen {
            state.half_open_probes += 1;
            self.write(&state);
        }
    }

    /// Remove breaker files untouched for longer than `max_age_hours`.
    /// Returns the number removed.
    pub fn cleanup_stale_files(&self, max_age_hours: u64) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.run_dir) else {
            return 0;
        };
        let max_age = std::time::Duration::from_secs(max_age_hours * 3600);
        let mut removed = 0;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("circuit-breaker-") {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .is_some_and(|age| age > max_age);
            if stale && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}
