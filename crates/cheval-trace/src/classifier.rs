//! Fault classification with calibrated confidence.
//!
//! Categories in tie-break precedence order: skill bug, skill gap,
//! missing skill, runtime bug. Each category's score combines its
//! text-signal hits with its own trajectory and matcher evidence, so
//! matched skills can flip a "skill gap" over a "missing skill" before
//! the precedence tie-break runs. The winner's score, scaled to 0-100
//! and adjusted by session confidence, becomes the confidence.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::matcher::MatcherOutput;
use crate::parser::{ParseResult, SessionConfidence, TrajectoryEntry};

/// Actionable fault categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCategory {
    /// Direct evidence of a skill malfunction.
    SkillBug,
    /// Missing capability in an existing skill.
    SkillGap,
    /// Need for an entirely new skill.
    MissingSkill,
    /// Environment or infrastructure issue.
    RuntimeBug,
    /// Nothing scored above zero.
    Unknown,
}

/// Classification outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    /// Winning category.
    pub category: FaultCategory,
    /// Calibrated confidence, 0–100.
    pub confidence: u8,
}

fn patterns(raw: &[&str]) -> Vec<Regex> {
    raw.iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("valid regex"))
        .collect()
}

static SKILL_BUG_SIGNALS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    patterns(&[
        r"\b(error|failed|crash|exception|bug|broken|wrong)\b",
        r"\b(doesn't work|didn't work|not working|stopped working)\b",
        r"\b(skill|command).*(failed|error|broken)\b",
    ])
});

static SKILL_GAP_SIGNALS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    patterns(&[
        r"\b(should|could|would).*(also|additionally|better)\b",
        r"\b(missing|lacks|needs).*(feature|option|capability)\b",
        r"\b(enhance|improve|extend)\b",
        r"\b(doesn't support|can't handle|unable to)\b",
    ])
});

static MISSING_SKILL_SIGNALS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    patterns(&[
        r"\b(need|want|wish).*(new|different).*(skill|command|feature)\b",
        r"\b(no (skill|command) for)\b",
        r"\b(add|create|implement).*(skill|command)\b",
        r"\bnew (skill|command|feature)\b",
    ])
});

static RUNTIME_BUG_SIGNALS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    patterns(&[
        r"\b(timeout|slow|hang|freeze)\b",
        r"\b(permission|access).*(denied|error)\b",
        r"\b(network|connection|api).*(error|failed)\b",
        r"\b(environment|config|setup).*(issue|problem|error)\b",
        r"\b(memory|disk|resource)\b",
    ])
});

/// Error types counted as runtime evidence.
const RUNTIME_ERROR_TERMS: &[&str] = &["timeout", "permission", "network", "resource"];

fn signal_score(text: &str, signals: &[Regex], per_hit: f64) -> f64 {
    signals.iter().filter(|pattern| pattern.is_match(text)).count() as f64 * per_hit
}

fn has_error(entry: &TrajectoryEntry) -> bool {
    entry.error_message.is_some() || entry.error_type.is_some()
}

fn score_skill_bug(text: &str, parse_result: &ParseResult, matcher: &MatcherOutput) -> f64 {
    let mut score = signal_score(text, &SKILL_BUG_SIGNALS, 0.3);

    // Recent errors in the trajectory, saturating at five.
    let error_entries = parse_result.entries.iter().filter(|e| has_error(e)).count();
    if error_entries > 0 {
        score += 0.3 * (error_entries as f64 / 5.0).min(1.0);
    }

    // Skill invocations that themselves errored.
    if parse_result
        .entries
        .iter()
        .any(|e| e.skill.as_ref().is_some_and(|s| s.error_message.is_some()))
    {
        score += 0.4;
    }

    if !matcher.matched_skills.is_empty() {
        score += 0.2;
    }

    score.min(1.0)
}

fn score_skill_gap(text: &str, parse_result: &ParseResult, matcher: &MatcherOutput) -> f64 {
    let mut score = signal_score(text, &SKILL_GAP_SIGNALS, 0.3);

    // A skill ran successfully: it exists but lacks the feature.
    if parse_result
        .entries
        .iter()
        .any(|e| e.skill.as_ref().is_some_and(|s| s.success))
    {
        score += 0.2;
    }

    // Matched skills suggest enhancing something that exists.
    if !matcher.matched_skills.is_empty() {
        score += 0.3;
    }

    score.min(1.0)
}

fn score_missing_skill(text: &str, matcher: &MatcherOutput) -> f64 {
    let mut score = signal_score(text, &MISSING_SKILL_SIGNALS, 0.4);

    // No matched skills: a new capability may be needed.
    if matcher.matched_skills.is_empty() {
        score += 0.3;
    }

    // The domain is known but no skill serves it.
    if !matcher.matched_domains.is_empty() && matcher.matched_skills.is_empty() {
        score += 0.3;
    }

    score.min(1.0)
}

fn score_runtime_bug(text: &str, parse_result: &ParseResult) -> f64 {
    let mut score = signal_score(text, &RUNTIME_BUG_SIGNALS, 0.3);

    // Timeout/system errors recorded in the trajectory.
    if parse_result.entries.iter().any(|e| {
        e.error_type.as_ref().is_some_and(|t| {
            let lowered = t.to_lowercase();
            RUNTIME_ERROR_TERMS.iter().any(|term| lowered.contains(term))
        })
    }) {
        score += 0.4;
    }

    score.min(1.0)
}

fn session_adjustment(confidence: SessionConfidence) -> i32 {
    match confidence {
        SessionConfidence::High => 10,
        SessionConfidence::Medium => 0,
        SessionConfidence::Low => -15,
    }
}

/// Classify feedback into a fault category.
///
/// Deterministic tie-breaking follows the precedence order; a zero
/// maximum yields `Unknown` with zero confidence.
#[must_use]
pub fn classify(
    feedback: &str,
    parse_result: &ParseResult,
    matcher: &MatcherOutput,
) -> Classification {
    // Precedence order is encoded by position: earlier wins ties.
    let scores = [
        (
            FaultCategory::SkillBug,
            score_skill_bug(feedback, parse_result, matcher),
        ),
        (
            FaultCategory::SkillGap,
            score_skill_gap(feedback, parse_result, matcher),
        ),
        (
            FaultCategory::MissingSkill,
            score_missing_skill(feedback, matcher),
        ),
        (
            FaultCategory::RuntimeBug,
            score_runtime_bug(feedback, parse_result),
        ),
    ];

    let mut winner = scores[0];
    for candidate in &scores[1..] {
        if candidate.1 > winner.1 {
            winner = *candidate;
        }
    }
    let (category, best) = winner;

    if best <= 0.0 {
        return Classification {
            category: FaultCategory::Unknown,
            confidence: 0,
        };
    }

    let base = (best * 100.0).min(100.0) as i32;
    let adjusted = base + session_adjustment(parse_result.session_confidence);
    Classification {
        category,
        confidence: adjusted.clamp(0, 100) as u8,
    }
}
