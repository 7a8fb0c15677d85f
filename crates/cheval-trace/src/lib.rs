//! Feedback trace analysis.
//!
//! Parses trajectory JSONL, matches feedback text against the feedback
//! ontology, and classifies the fault into an actionable category. All
//! report text passes through the shared redaction primitives before
//! it leaves this crate.

pub mod classifier;
pub mod matcher;
pub mod parser;

pub use classifier::{classify, Classification, FaultCategory};
pub use matcher::{DomainEntry, KeywordMatch, MatcherOutput, Ontology};
pub use parser::{
    parse_trajectory, ParseResult, SessionConfidence, SkillInvocation, TrajectoryEntry,
};

use cheval_core::redaction::redact_str;
use serde::Serialize;

/// Final analyzer report, safe to emit.
#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    /// Classified fault category.
    pub category: FaultCategory,
    /// Calibrated confidence, 0–100.
    pub confidence: u8,
    /// Ontology keywords the feedback matched.
    pub matched_terms: Vec<String>,
    /// Skills the matched keywords map to.
    pub matched_skills: Vec<String>,
    /// Domains the matched keywords map to.
    pub matched_domains: Vec<String>,
    /// Trajectory entries considered.
    pub entries_analyzed: usize,
    /// Corrupt lines skipped during parsing.
    pub corrupt_lines: usize,
    /// Session correlation confidence.
    pub session_confidence: SessionConfidence,
    /// Redacted summary of the feedback.
    pub summary: String,
}

/// Analyze one piece of feedback against a parsed trajectory.
#[must_use]
pub fn analyze(feedback: &str, parse_result: &ParseResult, ontology: &Ontology) -> TraceReport {
    let matcher_output = ontology.match_text(feedback);
    let classification = classify(feedback, parse_result, &matcher_output);

    TraceReport {
        category: classification.category,
        confidence: classification.confidence,
        matched_terms: matcher_output
            .keyword_matches
            .iter()
            .map(|m| m.keyword.clone())
            .collect(),
        matched_skills: matcher_output.matched_skills,
        matched_domains: matcher_output.matched_domains,
        entries_analyzed: parse_result.entries.len(),
        corrupt_lines: parse_result.corrupt_lines,
        session_confidence: parse_result.session_confidence,
        summary: redact_str(feedback),
    }
}
