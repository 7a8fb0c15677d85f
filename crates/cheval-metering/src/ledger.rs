//! Append-only JSONL cost ledger and the O(1) daily spend counter.
//!
//! The append path takes an exclusive advisory lock on the ledger file,
//! writes a single JSON line, and releases; that is the only supported
//! write path. Reads are lock-free (lines are atomically appended) and
//! skip corrupt lines, so mid-line truncation is survivable.
//!
//! The per-day summary `.daily-spend-YYYY-MM-DD.json` is maintained by
//! a flock-protected read-modify-write so that `pre_call` budget checks
//! never have to scan the ledger.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cheval_config::{HounfourConfig, PricingMode};
use cheval_core::{ChevalError, ChevalResult, Usage, UsageSource};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::pricing::{find_pricing, total_cost};

/// One immutable ledger record per successful completion.
///
/// The field set is a stable wire contract; readers tolerate additional
/// keys (captured in `extra`) without failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// ISO-8601 UTC timestamp with millisecond precision.
    pub ts: String,
    /// Caller-supplied trace id.
    pub trace_id: String,
    /// Unique request id.
    pub request_id: String,
    /// Agent name.
    pub agent: String,
    /// Provider that served the request.
    pub provider: String,
    /// Model actually used.
    pub model: String,
    /// Input token count.
    pub tokens_in: u64,
    /// Output token count.
    pub tokens_out: u64,
    /// Reasoning token count.
    pub tokens_reasoning: u64,
    /// Observed latency.
    pub latency_ms: u64,
    /// Computed cost in micro-USD.
    pub cost_micro_usd: u64,
    /// `actual` or `estimated`.
    pub usage_source: UsageSource,
    /// `config` when pricing was found, `unknown` otherwise.
    pub pricing_source: String,
    /// Pricing mode used for the cost.
    pub pricing_mode: PricingMode,
    /// Optional phase tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    /// Optional sprint tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprint_id: Option<String>,
    /// Attempt number within the invocation.
    pub attempt: u32,
    /// Long-running interaction id, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    /// Unknown keys from future writers, preserved on read.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl LedgerEntry {
    /// Build an entry, computing cost from config pricing. When no
    /// pricing is registered the cost is zero and `pricing_source` is
    /// `unknown`; token counts are retained for observability either
    /// way.
    ///
    /// # Errors
    ///
    /// `BUDGET_OVERFLOW` from the cost primitive.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        trace_id: &str,
        agent: &str,
        provider: &str,
        model: &str,
        usage: &Usage,
        latency_ms: u64,
        config: &HounfourConfig,
        attempt: u32,
        interaction_id: Option<&str>,
    ) -> ChevalResult<Self> {
        let (cost_micro_usd, pricing_source, pricing_mode) =
            match find_pricing(provider, model, config) {
                Some(pricing) => {
                    let breakdown = total_cost(
                        usage.input_tokens,
                        usage.output_tokens,
                        usage.reasoning_tokens,
                        pricing,
                    )?;
                    (
                        breakdown.total_cost_micro,
                        "config".to_owned(),
                        pricing.pricing_mode,
                    )
                },
                None => (0, "unknown".to_owned(), PricingMode::Token),
            };

        Ok(Self {
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            trace_id: trace_id.to_owned(),
            request_id: format!("req-{}", &Uuid::new_v4().simple().to_string()[..12]),
            agent: agent.to_owned(),
            provider: provider.to_owned(),
            model: model.to_owned(),
            tokens_in: usage.input_tokens,
            tokens_out: usage.output_tokens,
            tokens_reasoning: usage.reasoning_tokens,
            latency_ms,
            cost_micro_usd,
            usage_source: usage.source,
            pricing_source,
            pricing_mode,
            phase_id: None,
            sprint_id: None,
            attempt,
            interaction_id: interaction_id.map(ToOwned::to_owned),
            extra: BTreeMap::new(),
        })
    }
}

fn io_error(context: &str, path: &Path, e: &std::io::Error) -> ChevalError {
    ChevalError::invalid_config(format!("{context} {}: {e}", path.display()))
}

/// Append one JSONL line under an exclusive advisory lock.
///
/// # Errors
///
/// I/O failures opening, locking, or writing the ledger file.
pub fn append_ledger(entry: &LedgerEntry, ledger_path: &Path) -> ChevalResult<()> {
    if let Some(parent) = ledger_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| io_error("cannot create ledger dir", parent, &e))?;
    }

    let line = serde_json::to_string(entry)
        .map_err(|e| ChevalError::invalid_config(format!("ledger entry serialize failed: {e}")))?;
    debug_assert!(!line.contains('\n'));

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(ledger_path)
        .map_err(|e| io_error("cannot open ledger", ledger_path, &e))?;

    file.lock_exclusive()
        .map_err(|e| io_error("cannot lock ledger", ledger_path, &e))?;
    let result = writeln!(file, "{line}");
    let _ = fs2::FileExt::unlock(&file);
    result.map_err(|e| io_error("cannot append to ledger", ledger_path, &e))
}

/// Read the ledger, skipping lines that fail JSON decode.
///
/// # Errors
///
/// Only on I/O failure opening the file; a missing ledger is empty.
pub fn read_ledger(ledger_path: &Path) -> ChevalResult<Vec<LedgerEntry>> {
    let file = match std::fs::File::open(ledger_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error("cannot open ledger", ledger_path, &e)),
    };

    let mut entries = Vec::new();
    let mut corrupt = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| io_error("cannot read ledger", ledger_path, &e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(_) => corrupt += 1,
        }
    }

    if corrupt > 0 {
        warn!(
            path = %ledger_path.display(),
            skipped = corrupt,
            "ledger contained corrupted lines"
        );
    }
    Ok(entries)
}

/// Per-day summary stored beside the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct DailySummary {
    date: String,
    total_micro_usd: u64,
    entry_count: u64,
}

/// Path of the daily summary file for a given UTC date.
#[must_use]
pub fn daily_spend_path(ledger_path: &Path, date: &str) -> PathBuf {
    let dir = ledger_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".daily-spend-{date}.json"))
}

fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Today's spend in micro-USD, O(1). Returns 0 when the summary file is
/// missing, corrupt, or stamped with a different date.
#[must_use]
pub fn read_daily_spend(ledger_path: &Path) -> u64 {
    let today = today_utc();
    let path = daily_spend_path(ledger_path, &today);

    let Ok(content) = std::fs::read_to_string(&path) else {
        return 0;
    };
    match serde_json::from_str::<DailySummary>(&content) {
        Ok(summary) if summary.date == today => summary.total_micro_usd,
        _ => 0,
    }
}

/// Atomically add `delta_micro` to today's spend counter.
///
/// The summary file is held under an exclusive lock across the full
/// read-modify-write; a corrupt or missing file resets to zero before
/// the increment.
///
/// # Errors
///
/// I/O failures opening, locking, or rewriting the summary file.
pub fn update_daily_spend(delta_micro: u64, ledger_path: &Path) -> ChevalResult<()> {
    let today = today_utc();
    let path = daily_spend_path(ledger_path, &today);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| io_error("cannot create spend dir", parent, &e))?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| io_error("cannot open daily spend", &path, &e))?;

    file.lock_exclusive()
        .map_err(|e| io_error("cannot lock daily spend", &path, &e))?;

    let result = (|| -> std::io::Result<()> {
        let mut raw = String::new();
        file.read_to_string(&mut raw)?;

        let mut summary: DailySummary =
            serde_json::from_str(&raw).unwrap_or_default();
        if summary.date != today {
            summary = DailySummary::default();
        }
        summary.date = today.clone();
        summary.total_micro_usd = summary.total_micro_usd.saturating_add(delta_micro);
        summary.entry_count += 1;

        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(serde_json::to_string(&summary)?.as_bytes())?;
        Ok(())
    })();

    let _ = fs2::FileExt::unlock(&file);
    result.map_err(|e| io_error("cannot update daily spend", &path, &e))
}

/// Record a completed invocation: append the ledger entry, then bump
/// the daily spend counter.
///
/// # Errors
///
/// Propagates either write failure.
pub fn record_cost(entry: &LedgerEntry, ledger_path: &Path) -> ChevalResult<()> {
    append_ledger(entry, ledger_path)?;
    update_daily_spend(entry.cost_micro_usd, ledger_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cheval_config::{ModelConfig, PricingConfig, ProviderConfig, ProviderKind, SecretString};

    fn config_with_pricing() -> HounfourConfig {
        let mut config = HounfourConfig::default();
        let mut models = BTreeMap::new();
        models.insert(
            "gpt-5.2".to_owned(),
            ModelConfig {
                pricing: Some(PricingConfig {
                    input_per_mtok: 10_000_000,
                    output_per_mtok: 30_000_000,
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
        config
    }

    fn sample_entry(config: &HounfourConfig) -> LedgerEntry {
        LedgerEntry::create(
            "tr-test",
            "reviewer",
            "openai",
            "gpt-5.2",
            &Usage::actual(4200, 1800, 0),
            1234,
            config,
            1,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_entry_cost_from_config() {
        let config = config_with_pricing();
        let entry = sample_entry(&config);
        assert_eq!(entry.cost_micro_usd, 96_000);
        assert_eq!(entry.pricing_source, "config");
        assert!(entry.request_id.starts_with("req-"));
    }

    #[test]
    fn test_entry_unknown_pricing_costs_zero() {
        let config = HounfourConfig::default();
        let entry = LedgerEntry::create(
            "tr",
            "agent",
            "nowhere",
            "ghost",
            &Usage::actual(100, 100, 0),
            1,
            &config,
            1,
            None,
        )
        .unwrap();
        assert_eq!(entry.cost_micro_usd, 0);
        assert_eq!(entry.pricing_source, "unknown");
    }

    #[test]
    fn test_append_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("cost-ledger.jsonl");
        let config = config_with_pricing();

        let entry = sample_entry(&config);
        append_ledger(&entry, &ledger).unwrap();
        append_ledger(&entry, &ledger).unwrap();

        let entries = read_ledger(&ledger).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].cost_micro_usd, entry.cost_micro_usd);
        assert_eq!(entries[0].agent, "reviewer");
        assert_eq!(entries[0].usage_source, UsageSource::Actual);
    }

    #[test]
    fn test_read_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("cost-ledger.jsonl");
        let config = config_with_pricing();

        append_ledger(&sample_entry(&config), &ledger).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(&ledger).unwrap();
            writeln!(f, "{{truncated garbage").unwrap();
        }
        append_ledger(&sample_entry(&config), &ledger).unwrap();

        let entries = read_ledger(&ledger).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_read_tolerates_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("cost-ledger.jsonl");
        let config = config_with_pricing();

        let mut json = serde_json::to_value(sample_entry(&config)).unwrap();
        json["future_field"] = serde_json::json!("from a newer writer");
        std::fs::write(&ledger, format!("{json}\n")).unwrap();

        let entries = read_ledger(&ledger).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].extra.contains_key("future_field"));
    }

    #[test]
    fn test_missing_ledger_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries = read_ledger(&dir.path().join("absent.jsonl")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_daily_spend_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("cost-ledger.jsonl");

        assert_eq!(read_daily_spend(&ledger), 0);
        update_daily_spend(96_000, &ledger).unwrap();
        update_daily_spend(4_000, &ledger).unwrap();
        assert_eq!(read_daily_spend(&ledger), 100_000);
    }

    #[test]
    fn test_daily_spend_ignores_stale_date() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("cost-ledger.jsonl");
        let today = today_utc();
        let path = daily_spend_path(&ledger, &today);
        std::fs::write(
            &path,
            r#"{"date":"2001-01-01","total_micro_usd":999,"entry_count":1}"#,
        )
        .unwrap();
        assert_eq!(read_daily_spend(&ledger), 0);
    }

    #[test]
    fn test_daily_spend_recovers_from_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("cost-ledger.jsonl");
        let path = daily_spend_path(&ledger, &today_utc());
        std::fs::write(&path, "not json at all").unwrap();

        update_daily_spend(500, &ledger).unwrap();
        assert_eq!(read_daily_spend(&ledger), 500);
    }

    #[test]
    fn test_record_cost_matches_ledger_sum() {
        // Daily spend equals the sum of today's ledger entries.
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("cost-ledger.jsonl");
        let config = config_with_pricing();

        for _ in 0..3 {
            record_cost(&sample_entry(&config), &ledger).unwrap();
        }

        let total: u64 = read_ledger(&ledger)
            .unwrap()
            .iter()
            .map(|e| e.cost_micro_usd)
            .sum();
        assert_eq!(read_daily_spend(&ledger), total);
        assert_eq!(total, 3 * 96_000);
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = config_with_pricing();
        let entry = sample_entry(&config);
        let line = serde_json::to_string(&entry).unwrap();
        let parsed: LedgerEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.request_id, entry.request_id);
        assert_eq!(parsed.cost_micro_usd, entry.cost_micro_usd);
        assert_eq!(parsed.ts, entry.ts);
    }
}
