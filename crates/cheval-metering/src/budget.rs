//! Budget enforcement: pre-call checks and post-call reconciliation.
//!
//! `pre_call` reads the O(1) daily counter without a lock; concurrent
//! invocations may both pass before either records cost, with overshoot
//! bounded by the attempt budget times the largest single-call cost.
//! `pre_call_atomic` holds the summary file lock across read, check,
//! and reservation, eliminating the check-then-act race at the cost of
//! one flock round-trip.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cheval_config::{HounfourConfig, OnExceeded};
use cheval_core::{ChevalError, ChevalResult, CompletionResult};
use chrono::Utc;
use fs2::FileExt;
use tracing::{info, warn};

use crate::ledger::{daily_spend_path, read_daily_spend, record_cost, LedgerEntry};

/// Outcome of a pre-call budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Under budget.
    Allow,
    /// Past the warn threshold, or at the limit under the warn policy.
    Warn,
    /// At the limit under the downgrade policy.
    Downgrade,
    /// At the limit under the block policy.
    Block,
}

fn decide(spent: u64, limit: u64, warn_pct: u64, on_exceeded: OnExceeded) -> BudgetDecision {
    if spent >= limit {
        return match on_exceeded {
            OnExceeded::Block => BudgetDecision::Block,
            OnExceeded::Downgrade => BudgetDecision::Downgrade,
            OnExceeded::Warn => BudgetDecision::Warn,
        };
    }
    if spent >= limit.saturating_mul(warn_pct) / 100 {
        return BudgetDecision::Warn;
    }
    BudgetDecision::Allow
}

/// Pre/post call budget enforcement for one logical invocation.
///
/// Deduplicates post-call recording by interaction id so a long-running
/// task billed per-task is never charged twice when multiple polls
/// return the completed object.
#[derive(Debug)]
pub struct BudgetEnforcer {
    enabled: bool,
    ledger_path: PathBuf,
    config: HounfourConfig,
    trace_id: String,
    agent: String,
    daily_limit: u64,
    warn_pct: u64,
    on_exceeded: OnExceeded,
    attempt: u32,
    seen_interactions: HashSet<String>,
}

impl BudgetEnforcer {
    /// Create an enforcer bound to one invocation's identity.
    #[must_use]
    pub fn new(config: &HounfourConfig, ledger_path: &Path, trace_id: &str, agent: &str) -> Self {
        let metering = &config.metering;
        Self {
            enabled: metering.enabled,
            ledger_path: ledger_path.to_path_buf(),
            config: config.clone(),
            trace_id: trace_id.to_owned(),
            agent: agent.to_owned(),
            daily_limit: metering.budget.daily_micro_usd,
            warn_pct: metering.budget.warn_at_percent,
            on_exceeded: metering.budget.on_exceeded,
            attempt: 0,
            seen_interactions: HashSet::new(),
        }
    }

    /// Attempts consumed so far, including pre-call checks.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Pre-call budget check against the O(1) daily counter.
    pub fn pre_call(&mut self) -> BudgetDecision {
        if !self.enabled {
            return BudgetDecision::Allow;
        }

        self.attempt += 1;
        let spent = read_daily_spend(&self.ledger_path);
        let decision = decide(spent, self.daily_limit, self.warn_pct, self.on_exceeded);
        match decision {
            BudgetDecision::Allow => {},
            BudgetDecision::Warn => {
                info!(spent, limit = self.daily_limit, "budget warn threshold reached");
            },
            BudgetDecision::Downgrade => {
                warn!(spent, limit = self.daily_limit, "budget exceeded, downgrading");
            },
            BudgetDecision::Block => {
                warn!(spent, limit = self.daily_limit, "budget exceeded, blocking");
            },
        }
        decision
    }

    /// Atomic check-and-reserve: the daily summary file is locked while
    /// reading, checking, and (when `reservation_micro > 0` and not
    /// blocked) incrementing by the reservation.
    ///
    /// # Errors
    ///
    /// I/O failures on the summary file.
    pub fn pre_call_atomic(&mut self, reservation_micro: u64) -> ChevalResult<BudgetDecision> {
        if !self.enabled {
            return Ok(BudgetDecision::Allow);
        }
        self.attempt += 1;

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let path = daily_spend_path(&self.ledger_path, &today);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ChevalError::invalid_config(format!(
                    "cannot create spend dir {}: {e}",
                    parent.display()
                ))
            })?;
        }

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

        let outcome = (|| -> std::io::Result<BudgetDecision> {
            let mut raw = String::new();
            file.read_to_string(&mut raw)?;

            let mut summary: serde_json::Value =
                serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({}));
            let stored_date = summary["date"].as_str().unwrap_or_default().to_owned();
            let mut spent = summary["total_micro_usd"].as_u64().unwrap_or(0);
            if stored_date != today {
                spent = 0;
            }

            let decision = decide(spent, self.daily_limit, self.warn_pct, self.on_exceeded);
            if decision == BudgetDecision::Block || decision == BudgetDecision::Downgrade {
                return Ok(decision);
            }

            if reservation_micro > 0 {
                let entry_count = if stored_date == today {
                    summary["entry_count"].as_u64().unwrap_or(0)
                } else {
                    0
                };
                summary = serde_json::json!({
                    "date": today,
                    "total_micro_usd": spent + reservation_micro,
                    "entry_count": entry_count + 1,
                });
                file.seek(SeekFrom::Start(0))?;
                file.set_len(0)?;
                file.write_all(summary.to_string().as_bytes())?;
            }

            Ok(decision)
        })();

        let _ = fs2::FileExt::unlock(&file);
        outcome.map_err(|e| {
            ChevalError::invalid_config(format!("cannot update {}: {e}", path.display()))
        })
    }

    /// Post-call cost reconciliation: write the ledger entry and bump
    /// the daily counter. Best-effort: a recording failure is logged
    /// and never fails the completed invocation.
    pub fn post_call(&mut self, result: &CompletionResult) {
        if !self.enabled {
            return;
        }

        if let Some(interaction_id) = &result.interaction_id {
            if !self.seen_interactions.insert(interaction_id.clone()) {
                info!(interaction_id, "skipping duplicate cost for interaction");
                return;
            }
        }

        let entry = match LedgerEntry::create(
            &self.trace_id,
            &self.agent,
            &result.provider,
            &result.model,
            &result.usage,
            result.latency_ms,
            &self.config,
            self.attempt.max(1),
            result.interaction_id.as_deref(),
        ) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "ledger entry construction failed, cost not recorded");
                return;
            },
        };

        if let Err(e) = record_cost(&entry, &self.ledger_path) {
            warn!(error = %e, "cost recording failed after successful completion");
        }
    }
}

/// Standalone budget check not tied to a request.
#[must_use]
pub fn check_budget(config: &HounfourConfig, ledger_path: &Path) -> BudgetDecision {
    if !config.metering.enabled {
        return BudgetDecision::Allow;
    }
    let budget = &config.metering.budget;
    decide(
        read_daily_spend(ledger_path),
        budget.daily_micro_usd,
        budget.warn_at_percent,
        budget.on_exceeded,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::update_daily_spend;
    use cheval_core::{Usage, UsageSource};

    fn config(limit: u64, on_exceeded: OnExceeded) -> HounfourConfig {
        let mut config = HounfourConfig::default();
        config.metering.budget.daily_micro_usd = limit;
        config.metering.budget.on_exceeded = on_exceeded;
        config
    }

    fn result_with_interaction(id: Option<&str>) -> CompletionResult {
        CompletionResult {
            content: "done".to_owned(),
            tool_calls: None,
            thinking: None,
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
                reasoning_tokens: 0,
                source: UsageSource::Actual,
            },
            model: "gpt-5.2".to_owned(),
            latency_ms: 10,
            provider: "openai".to_owned(),
            interaction_id: id.map(ToOwned::to_owned),
        }
    }

    #[test]
    fn test_decide_matrix() {
        assert_eq!(decide(0, 100, 80, OnExceeded::Block), BudgetDecision::Allow);
        assert_eq!(decide(80, 100, 80, OnExceeded::Block), BudgetDecision::Warn);
        assert_eq!(decide(100, 100, 80, OnExceeded::Block), BudgetDecision::Block);
        assert_eq!(
            decide(100, 100, 80, OnExceeded::Downgrade),
            BudgetDecision::Downgrade
        );
        assert_eq!(decide(100, 100, 80, OnExceeded::Warn), BudgetDecision::Warn);
    }

    #[test]
    fn test_pre_call_downgrade_when_over() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.jsonl");
        update_daily_spend(100_000_001, &ledger).unwrap();

        let config = config(100_000_000, OnExceeded::Downgrade);
        let mut enforcer = BudgetEnforcer::new(&config, &ledger, "tr", "reviewer");
        assert_eq!(enforcer.pre_call(), BudgetDecision::Downgrade);
        assert_eq!(enforcer.attempts(), 1);
    }

    #[test]
    fn test_pre_call_disabled_always_allows() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.jsonl");
        update_daily_spend(u64::MAX / 2, &ledger).unwrap();

        let mut config = config(1, OnExceeded::Block);
        config.metering.enabled = false;
        let mut enforcer = BudgetEnforcer::new(&config, &ledger, "tr", "reviewer");
        assert_eq!(enforcer.pre_call(), BudgetDecision::Allow);
        assert_eq!(enforcer.attempts(), 0);
    }

    #[test]
    fn test_atomic_reserves_under_lock() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.jsonl");
        let config = config(1_000_000, OnExceeded::Block);
        let mut enforcer = BudgetEnforcer::new(&config, &ledger, "tr", "reviewer");

        assert_eq!(
            enforcer.pre_call_atomic(400_000).unwrap(),
            BudgetDecision::Allow
        );
        assert_eq!(read_daily_spend(&ledger), 400_000);

        // Second reservation passes the warn threshold.
        assert_eq!(
            enforcer.pre_call_atomic(400_000).unwrap(),
            BudgetDecision::Warn
        );
        assert_eq!(read_daily_spend(&ledger), 800_000);

        // Third check finds the limit crossed after another reservation.
        assert_eq!(
            enforcer.pre_call_atomic(400_000).unwrap(),
            BudgetDecision::Warn
        );
        assert_eq!(
            enforcer.pre_call_atomic(1).unwrap(),
            BudgetDecision::Block
        );
        // Blocked call reserves nothing.
        assert_eq!(read_daily_spend(&ledger), 1_200_000);
    }

    #[test]
    fn test_atomic_check_only_when_zero_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.jsonl");
        let config = config(1_000_000, OnExceeded::Block);
        let mut enforcer = BudgetEnforcer::new(&config, &ledger, "tr", "reviewer");

        assert_eq!(enforcer.pre_call_atomic(0).unwrap(), BudgetDecision::Allow);
        assert_eq!(read_daily_spend(&ledger), 0);
    }

    #[test]
    fn test_post_call_dedup_by_interaction_id() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.jsonl");
        let mut config = config(u64::MAX, OnExceeded::Warn);

        // Task-priced deep-research model.
        use cheval_config::{
            ModelConfig, PricingConfig, PricingMode, ProviderConfig, ProviderKind, SecretString,
        };
        let mut models = std::collections::BTreeMap::new();
        models.insert(
            "gpt-5.2".to_owned(),
            ModelConfig {
                pricing: Some(PricingConfig {
                    per_task_micro_usd: 2_000_000,
                    pricing_mode: PricingMode::Task,
                    ..PricingConfig::default()
                }),
                ..ModelConfig::default()
            },
        );
        config.providers.insert(
            "openai".to_owned(),
            ProviderConfig {
                kind: ProviderKind::Openai,
                endpoint: "https://api.openai.com/v1".to_owned(),
                auth: SecretString::new("sk-test"),
                models,
                connect_timeout: 10.0,
                read_timeout: 120.0,
                write_timeout: 30.0,
            },
        );

        let mut enforcer = BudgetEnforcer::new(&config, &ledger, "tr", "researcher");
        enforcer.post_call(&result_with_interaction(Some("dr-123")));
        enforcer.post_call(&result_with_interaction(Some("dr-123")));

        let entries = crate::ledger::read_ledger(&ledger).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(read_daily_spend(&ledger), 2_000_000);
    }

    #[test]
    fn test_post_call_distinct_interactions_both_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.jsonl");
        let config = config(u64::MAX, OnExceeded::Warn);

        let mut enforcer = BudgetEnforcer::new(&config, &ledger, "tr", "researcher");
        enforcer.post_call(&result_with_interaction(Some("dr-1")));
        enforcer.post_call(&result_with_interaction(Some("dr-2")));
        enforcer.post_call(&result_with_interaction(None));

        let entries = crate::ledger::read_ledger(&ledger).unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_check_budget_standalone() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.jsonl");
        let config = config(100, OnExceeded::Block);
        assert_eq!(check_budget(&config, &ledger), BudgetDecision::Allow);

        update_daily_spend(100, &ledger).unwrap();
        assert_eq!(check_budget(&config, &ledger), BudgetDecision::Block);
    }
}
