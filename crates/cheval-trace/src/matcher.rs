//! Matching against the feedback ontology.
//!
//! The ontology is a YAML document of domains, each carrying a keyword
//! list and the skills that serve the domain. Exact (case-insensitive)
//! keyword matching is always available; fuzzier strategies can layer
//! on behind the same [`MatcherOutput`] shape. The aggregated
//! `matched_skills` / `matched_domains` sets are what the classifier
//! uses to discriminate "existing skill needs work" from "no skill
//! covers this at all".

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One ontology domain: keywords that signal it and the skills that
/// serve it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainEntry {
    /// Free-form domain description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Keywords that indicate the domain.
    pub keywords: Vec<String>,
    /// Skills registered for the domain.
    pub skills: Vec<String>,
}

/// The feedback ontology: domain name → entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ontology {
    /// Domains with their keywords and skills.
    #[serde(default)]
    pub domains: BTreeMap<String, DomainEntry>,
}

/// One keyword hit against the ontology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordMatch {
    /// The matched keyword.
    pub keyword: String,
    /// Domain the keyword belongs to.
    pub domain: String,
    /// First skill registered for the domain, when any exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
}

/// Aggregated match evidence handed to the classifier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatcherOutput {
    /// Individual keyword hits.
    pub keyword_matches: Vec<KeywordMatch>,
    /// Distinct skills across all hits.
    pub matched_skills: Vec<String>,
    /// Distinct domains across all hits.
    pub matched_domains: Vec<String>,
}

impl Ontology {
    /// Load the ontology from a YAML file; a missing or malformed file
    /// degrades to an empty ontology with a warning.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(ontology) => ontology,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ontology parse failed");
                    Self::default()
                },
            },
            Err(_) => {
                warn!(path = %path.display(), "ontology file not found");
                Self::default()
            },
        }
    }

    /// Match feedback text against the ontology and aggregate the
    /// matched skills and domains.
    #[must_use]
    pub fn match_text(&self, text: &str) -> MatcherOutput {
        let lowered = text.to_lowercase();
        let mut keyword_matches = Vec::new();

        for (domain_name, entry) in &self.domains {
            for keyword in &entry.keywords {
                if lowered.contains(&keyword.to_lowercase()) {
                    keyword_matches.push(KeywordMatch {
                        keyword: keyword.clone(),
                        domain: domain_name.clone(),
                        skill: entry.skills.first().cloned(),
                    });
                }
            }
        }

        let matched_skills: BTreeSet<String> = keyword_matches
            .iter()
            .filter_map(|m| m.skill.clone())
            .collect();
        let matched_domains: BTreeSet<String> =
            keyword_matches.iter().map(|m| m.domain.clone()).collect();

        MatcherOutput {
            keyword_matches,
            matched_skills: matched_skills.into_iter().collect(),
            matched_domains: matched_domains.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ontology() -> Ontology {
        let yaml = r"
domains:
  deployment:
    description: Shipping code to environments
    keywords:
      - deploy
      - rollout
    skills:
      - deploying-releases
  testing:
    keywords:
      - flaky test
      - coverage
    skills: []
";
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_keyword_match_case_insensitive() {
        let output = ontology().match_text("the Deploy step and a FLAKY TEST");
        assert_eq!(output.keyword_matches.len(), 2);
        assert!(output
            .keyword_matches
            .iter()
            .any(|m| m.domain == "deployment"));
        assert!(output.keyword_matches.iter().any(|m| m.keyword == "flaky test"));
    }

    #[test]
    fn test_skills_and_domains_aggregated() {
        let output = ontology().match_text("deploy and rollout both broke coverage");
        // Two deployment keywords collapse to one skill and one domain
        // entry; testing has no skills.
        assert_eq!(output.matched_skills, vec!["deploying-releases".to_owned()]);
        assert_eq!(
            output.matched_domains,
            vec!["deployment".to_owned(), "testing".to_owned()]
        );
    }

    #[test]
    fn test_domain_without_skills_matches_skill_free() {
        let output = ontology().match_text("coverage dropped");
        assert_eq!(output.keyword_matches.len(), 1);
        assert!(output.matched_skills.is_empty());
        assert_eq!(output.matched_domains, vec!["testing".to_owned()]);
    }

    #[test]
    fn test_no_matches() {
        let output = ontology().match_text("nothing relevant here");
        assert!(output.keyword_matches.is_empty());
        assert!(output.matched_skills.is_empty());
        assert!(output.matched_domains.is_empty());
    }

    #[test]
    fn test_load_missing_file_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let ontology = Ontology::load(&dir.path().join("absent.yaml"));
        assert!(ontology.domains.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ontology.yaml");
        std::fs::write(
            &path,
            "domains:\n  ci:\n    keywords:\n      - pipeline\n    skills:\n      - running-ci\n",
        )
        .unwrap();

        let ontology = Ontology::load(&path);
        let output = ontology.match_text("the pipeline broke");
        assert_eq!(output.keyword_matches.len(), 1);
        assert_eq!(output.matched_skills, vec!["running-ci".to_owned()]);
    }
}
