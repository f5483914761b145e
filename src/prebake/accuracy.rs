use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Issues at which confidence reaches zero.
const ISSUE_BUDGET: f64 = 5.0;

static NUMBER_RE: OnceLock<Regex> = OnceLock::new();

fn number_re() -> &'static Regex {
    NUMBER_RE.get_or_init(|| Regex::new(r"\b\d+(\.\d+)?\b").expect("number regex is valid"))
}

pub fn numeric_token_count(text: &str) -> usize {
    number_re().find_iter(text).count()
}

/// The fields of a content block an oracle rewrite is checked against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondensedRecord {
    pub uuid: String,
    pub timestamp: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyReport {
    pub accepted: bool,
    pub confidence: f64,
    pub metadata_intact: bool,
    pub issues: Vec<String>,
}

/// Compares an oracle rewrite with its source and decides whether to keep it.
pub fn validate_accuracy(
    original: &CondensedRecord,
    candidate: &CondensedRecord,
    min_confidence: f64,
) -> AccuracyReport {
    let mut issues = Vec::new();
    let mut metadata_intact = true;

    if original.uuid != candidate.uuid {
        metadata_intact = false;
        issues.push(format!(
            "uuid changed: {} -> {}",
            original.uuid, candidate.uuid
        ));
    }
    if original.timestamp != candidate.timestamp {
        metadata_intact = false;
        issues.push(format!(
            "timestamp changed: {} -> {}",
            original.timestamp, candidate.timestamp
        ));
    }

    let before = numeric_token_count(&original.content);
    let after = numeric_token_count(&candidate.content);
    if before != after {
        issues.push(format!("numeric token count changed: {before} -> {after}"));
    }

    let original_len = original.content.chars().count();
    let candidate_len = candidate.content.chars().count();
    if candidate_len > original_len {
        issues.push(format!(
            "condensed content grew: {original_len} -> {candidate_len} chars"
        ));
    }
    if candidate.content.trim().is_empty() && !original.content.trim().is_empty() {
        issues.push("condensed content is empty".to_string());
    }

    let confidence = (1.0 - issues.len() as f64 / ISSUE_BUDGET).max(0.0);
    AccuracyReport {
        accepted: issues.is_empty() && confidence >= min_confidence,
        confidence,
        metadata_intact,
        issues,
    }
}
