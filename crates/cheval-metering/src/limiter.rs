//! Per-provider token-bucket rate limiting.
//!
//! Tracks requests-per-minute and tokens-per-minute in a small state
//! file per provider, refilled proportionally to elapsed wall-clock
//! time on access. The limiter is advisory: `check` is a non-locking
//! read, so concurrent callers may both see capacity and proceed. Hard
//! enforcement belongs to the budget enforcer's atomic check.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use cheval_config::HounfourConfig;
use cheval_core::{ChevalError, ChevalResult};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BucketState {
    requests_remaining: f64,
    tokens_remaining: f64,
    last_update: f64,
}

/// Per-provider RPM/TPM rate limiter persisted across processes.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    rpm: u32,
    tpm: u64,
    state_dir: PathBuf,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl TokenBucketLimiter {
    /// Create a limiter with explicit limits.
    #[must_use]
    pub fn new(rpm: u32, tpm: u64, state_dir: &Path) -> Self {
        Self {
            rpm,
            tpm,
            state_dir: state_dir.to_path_buf(),
        }
    }

    /// Build a limiter for a provider from config, falling back to the
    /// built-in defaults table when the provider has no entry.
    #[must_use]
    pub fn for_provider(provider: &str, config: &HounfourConfig, state_dir: &Path) -> Self {
        let limits = config
            .routing
            .rate_limits
            .get(provider)
            .copied()
            .unwrap_or_default();
        Self::new(limits.rpm, limits.tpm, state_dir)
    }

    fn state_path(&self, provider: &str) -> PathBuf {
        self.state_dir.join(format!(".ratelimit-{provider}.json"))
    }

    fn default_state(&self) -> BucketState {
        BucketState {
            requests_remaining: f64::from(self.rpm),
            tokens_remaining: self.tpm as f64,
            last_update: now_epoch(),
        }
    }

    fn refill(&self, mut state: BucketState, now: f64) -> BucketState {
        let elapsed = now - state.last_update;
        if elapsed <= 0.0 {
            return state;
        }
        let minutes = elapsed / 60.0;
        state.requests_remaining =
            (state.requests_remaining + f64::from(self.rpm) * minutes).min(f64::from(self.rpm));
        state.tokens_remaining =
            (state.tokens_remaining + self.tpm as f64 * minutes).min(self.tpm as f64);
        state.last_update = now;
        state
    }

    fn read_state(&self, provider: &str) -> BucketState {
        std::fs::read_to_string(self.state_path(provider))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| self.default_state())
    }

    /// Whether a request fits within the limits right now.
    ///
    /// Non-locking read; does not consume capacity. Call
    /// [`TokenBucketLimiter::record`] after the request completes.
    #[must_use]
    pub fn check(&self, provider: &str, estimated_tokens: u64) -> bool {
        let state = self.refill(self.read_state(provider), now_epoch());

        if state.requests_remaining < 1.0 {
            info!(provider, "rate limited: request bucket exhausted");
            return false;
        }
        if estimated_tokens > 0 && state.tokens_remaining < estimated_tokens as f64 {
            info!(
                provider,
                remaining = state.tokens_remaining as u64,
                needed = estimated_tokens,
                "rate limited: token bucket insufficient"
            );
            return false;
        }
        true
    }

    /// Record usage after a completed request (flock-protected
    /// read-modify-write).
    ///
    /// # Errors
    ///
    /// I/O failures on the state file.
    pub fn record(&self, provider: &str, tokens_used: u64) -> ChevalResult<()> {
        std::fs::create_dir_all(&self.state_dir).map_err(|e| {
            ChevalError::invalid_config(format!(
                "cannot create state dir {}: {e}",
                self.state_dir.display()
            ))
        })?;
        let path = self.state_path(provider);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                ChevalError::invalid_config(format!("cannot open {}: {e}", path.display()))
            })?;
        file.lock_exclusive().map_err(|e| {
            ChevalError::invalid_config(format!("cannot lock {}: {e}", path.display()))
        })?;

        let result = (|| -> std::io::Result<()> {
            let mut raw = String::new();
            file.read_to_string(&mut raw)?;
            let state: BucketState =
                serde_json::from_str(&raw).unwrap_or_else(|_| self.default_state());

            let mut state = self.refill(state, now_epoch());
            state.requests_remaining = (state.requests_remaining - 1.0).max(0.0);
            state.tokens_remaining = (state.tokens_remaining - tokens_used as f64).max(0.0);

            file.seek(SeekFrom::Start(0))?;
            file.set_len(0)?;
            file.write_all(serde_json::to_string(&state)?.as_bytes())?;
            Ok(())
        })();

        let _ = fs2::FileExt::unlock(&file);
        result.map_err(|e| {
            ChevalError::invalid_config(format!("cannot update {}: {e}", path.display()))
        })
    }
}
