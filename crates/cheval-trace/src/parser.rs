//! Streaming JSONL trajectory parser with session filtering.
//!
//! Line-by-line parsing with the same corruption tolerance as the cost
//! ledger: lines that fail JSON decode are counted and skipped, so a
//! truncated trajectory still yields every intact entry.

use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Parsing safety guards.
const MAX_ENTRIES: usize = 10_000;
const MAX_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;

/// A skill invocation recorded in the trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInvocation {
    /// Skill name.
    #[serde(default)]
    pub name: Option<String>,
    /// Whether the invocation completed successfully.
    #[serde(default)]
    pub success: bool,
    /// Error message, when the invocation failed.
    #[serde(default)]
    pub error_message: Option<String>,
}

/// One trajectory event. Unknown fields are dropped on parse so
/// unexpected payloads cannot smuggle content into reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    /// Session the event belongs to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Event timestamp.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Event role (`user`, `assistant`, `tool`).
    #[serde(default)]
    pub role: Option<String>,
    /// Event text content.
    #[serde(default)]
    pub content: Option<String>,
    /// Tool name, for tool events.
    #[serde(default)]
    pub tool: Option<String>,
    /// Error message, when the event recorded one.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Error classification (`timeout`, `permission`, `network`, ...).
    #[serde(default)]
    pub error_type: Option<String>,
    /// Skill invocation attached to the event.
    #[serde(default)]
    pub skill: Option<SkillInvocation>,
}

/// How confidently the parsed entries correlate with the session the
/// caller asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionConfidence {
    /// Session id matched directly.
    High,
    /// Time-window correlation only.
    Medium,
    /// Nothing to correlate on.
    Low,
}

/// Outcome of parsing a trajectory file.
#[derive(Debug, Clone)]
pub struct ParseResult {
    /// Entries that survived filtering.
    pub entries: Vec<TrajectoryEntry>,
    /// Correlation confidence.
    pub session_confidence: SessionConfidence,
    /// Why the confidence is what it is.
    pub confidence_reason: String,
    /// Lines that failed JSON decode.
    pub corrupt_lines: usize,
    /// Total lines seen.
    pub total_lines: usize,
}

impl ParseResult {
    /// An empty result with low confidence and the given reason.
    #[must_use]
    pub fn empty(reason: &str) -> Self {
        Self {
            entries: Vec::new(),
            session_confidence: SessionConfidence::Low,
            confidence_reason: reason.to_owned(),
            corrupt_lines: 0,
            total_lines: 0,
        }
    }
}

/// Parse a trajectory file, filtering by session id (primary signal)
/// and a time window (secondary).
#[must_use]
pub fn parse_trajectory(
    path: &Path,
    session_id: Option<&str>,
    time_window_hours: i64,
) -> ParseResult {
    let Ok(metadata) = std::fs::metadata(path) else {
        return ParseResult::empty("file_not_found");
    };
    if metadata.len() > MAX_FILE_SIZE_BYTES {
        warn!(
            path = %path.display(),
            size = metadata.len(),
            "trajectory file exceeds size cap"
        );
        return ParseResult::empty("file_too_large");
    }

    let Ok(file) = std::fs::File::open(path) else {
        return ParseResult::empty("file_not_found");
    };

    let cutoff = Utc::now() - Duration::hours(time_window_hours);
    let mut entries = Vec::new();
    let mut corrupt_lines = 0usize;
    let mut total_lines = 0usize;
    let mut session_seen = false;

    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        total_lines += 1;

        let Ok(entry) = serde_json::from_str::<TrajectoryEntry>(line) else {
            corrupt_lines += 1;
            continue;
        };

        if let Some(wanted) = session_id {
            match &entry.session_id {
                Some(found) if found == wanted => session_seen = true,
                _ => continue,
            }
        }

        if let Some(ts) = entry.timestamp {
            if ts < cutoff {
                continue;
            }
        }

        entries.push(entry);
        if entries.len() >= MAX_ENTRIES {
            warn!(path = %path.display(), "trajectory entry cap reached");
            break;
        }
    }

    if corrupt_lines > 0 {
        warn!(
            path = %path.display(),
            skipped = corrupt_lines,
            "trajectory contained corrupted lines"
        );
    }

    let (confidence, reason) = if session_id.is_some() && session_seen {
        (SessionConfidence::High, "session_id matched".to_owned())
    } else if session_id.is_some() {
        (SessionConfidence::Low, "session_id not found".to_owned())
    } else if entries.is_empty() {
        (SessionConfidence::Low, "no entries in window".to_owned())
    } else {
        (SessionConfidence::Medium, "time-window correlation".to_owned())
    };

    ParseResult {
        entries,
        session_confidence: confidence,
        confidence_reason: reason,
        corrupt_lines,
        total_lines,
    }
}
