use crate::prebake::config::PipelineConfig;
use crate::prebake::entry::ConversationEntry;
use crate::prebake::reader::{ReadSummary, ReaderOptions};
use crate::prebake::store::ArtifactStore;
use crate::prebake::util::now_epoch_millis;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

/// Post-stage audit of one artifact before it is handed on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationCheckpoint {
    pub checkpoint_id: String,
    pub stage: String,
    pub session_id: String,
    pub at_epoch_ms: u64,
    pub structural_integrity: bool,
    pub data_consistency: bool,
    pub quality_metrics: BTreeMap<String, f64>,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ValidationCheckpoint {
    /// Quality shortfalls are reported but never fail a checkpoint.
    pub fn passed(&self) -> bool {
        self.structural_integrity && self.data_consistency
    }

    pub fn overall_score(&self) -> f64 {
        self.quality_metrics
            .get("overall_score")
            .copied()
            .unwrap_or(0.0)
    }
}

fn structural_issues(entries: &[ConversationEntry], issues: &mut Vec<String>) -> bool {
    let before = issues.len();
    if entries.is_empty() {
        issues.push("artifact contains no entries".to_string());
    }
    let mut seen = HashSet::new();
    for (index, entry) in entries.iter().enumerate() {
        if let Some(parent) = entry.parent_uuid.as_deref()
            && !seen.contains(parent)
        {
            issues.push(format!(
                "entry {index} ({}) references parent {parent} that is not an earlier entry",
                entry.uuid
            ));
        }
        if !seen.insert(entry.uuid.as_str()) {
            issues.push(format!("duplicate uuid {} at entry {index}", entry.uuid));
        }
    }
    issues.len() == before
}

fn consistency_issues(
    entries: &[ConversationEntry],
    tolerance_secs: u64,
    issues: &mut Vec<String>,
) -> bool {
    let before = issues.len();
    let mut sessions: HashSet<&str> = HashSet::new();
    let mut latest: Option<DateTime<FixedOffset>> = None;
    let tolerance = i64::try_from(tolerance_secs).unwrap_or(i64::MAX);

    for (index, entry) in entries.iter().enumerate() {
        if entry.uuid.trim().is_empty()
            || entry.timestamp.trim().is_empty()
            || entry.session_id.trim().is_empty()
        {
            issues.push(format!("entry {index} is missing uuid, timestamp or sessionId"));
            continue;
        }
        sessions.insert(entry.session_id.as_str());

        let parsed = match DateTime::parse_from_rfc3339(entry.timestamp.trim()) {
            Ok(ts) => ts,
            Err(err) => {
                issues.push(format!(
                    "entry {index} has unparseable timestamp {:?}: {err}",
                    entry.timestamp
                ));
                continue;
            }
        };
        if let Some(prev) = latest {
            if prev.timestamp().saturating_sub(parsed.timestamp()) > tolerance {
                issues.push(format!(
                    "entry {index} timestamp {} regresses beyond {tolerance_secs}s",
                    entry.timestamp
                ));
            }
            if parsed > prev {
                latest = Some(parsed);
            }
        } else {
            latest = Some(parsed);
        }
    }

    if sessions.len() > 1 {
        issues.push(format!(
            "artifact mixes {} session ids",
            sessions.len()
        ));
    }
    issues.len() == before
}

/// Audits entries already loaded from an artifact.
pub fn assess(
    stage: &str,
    session_id: &str,
    entries: &[ConversationEntry],
    summary: &ReadSummary,
    stage_metrics: &BTreeMap<String, f64>,
    cfg: &PipelineConfig,
) -> ValidationCheckpoint {
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();

    let structural_integrity = structural_issues(entries, &mut issues);
    if !structural_integrity {
        recommendations.push("Review entry relationships and uuid chains".to_string());
    }
    let data_consistency = consistency_issues(entries, cfg.timestamp_tolerance_secs, &mut issues);
    if !data_consistency {
        recommendations.push("Verify required fields and timestamp ordering".to_string());
    }

    let total = summary.total_lines;
    let valid = summary.valid;
    let completeness = if total > 0 {
        valid as f64 / total as f64
    } else {
        0.0
    };
    let mut quality_metrics = BTreeMap::new();
    quality_metrics.insert("total_entries".to_string(), total as f64);
    quality_metrics.insert("valid_entries".to_string(), valid as f64);
    quality_metrics.insert("completeness_score".to_string(), completeness);
    quality_metrics.insert("overall_score".to_string(), completeness);
    for (key, value) in stage_metrics {
        quality_metrics.entry(key.clone()).or_insert(*value);
    }

    if completeness < cfg.min_overall_quality {
        issues.push(format!(
            "quality score below threshold: {:.1}%",
            completeness * 100.0
        ));
        recommendations.push("Consider adjusting processing parameters".to_string());
    }

    ValidationCheckpoint {
        checkpoint_id: uuid::Uuid::new_v4().to_string(),
        stage: stage.to_string(),
        session_id: session_id.to_string(),
        at_epoch_ms: now_epoch_millis(),
        structural_integrity,
        data_consistency,
        quality_metrics,
        issues,
        recommendations,
    }
}

fn unreadable(stage: &str, session_id: &str, reason: String) -> ValidationCheckpoint {
    let mut quality_metrics = BTreeMap::new();
    quality_metrics.insert("overall_score".to_string(), 0.0);
    ValidationCheckpoint {
        checkpoint_id: uuid::Uuid::new_v4().to_string(),
        stage: stage.to_string(),
        session_id: session_id.to_string(),
        at_epoch_ms: now_epoch_millis(),
        structural_integrity: false,
        data_consistency: false,
        quality_metrics,
        issues: vec![reason],
        recommendations: vec!["Manual review required".to_string()],
    }
}

/// Re-reads a written artifact and audits it. Never fails: problems land in
/// the checkpoint's issues.
pub fn run_checkpoint(
    store: &ArtifactStore,
    stage: &str,
    session_id: &str,
    expected_sha256: Option<&str>,
    stage_metrics: &BTreeMap<String, f64>,
    cfg: &PipelineConfig,
) -> ValidationCheckpoint {
    let mut reader = match store.open_reader(session_id, ReaderOptions::artifact()) {
        Ok(reader) => reader,
        Err(err) => return unreadable(stage, session_id, format!("artifact unreadable: {err:#}")),
    };
    let entries: Vec<ConversationEntry> = reader.by_ref().collect();
    let summary = reader.summary().clone();

    let mut checkpoint = assess(stage, session_id, &entries, &summary, stage_metrics, cfg);
    if let Some(err) = &summary.io_error {
        checkpoint.structural_integrity = false;
        checkpoint.issues.push(format!("read error: {err}"));
    }
    if let Some(expected) = expected_sha256 {
        match store.digest(session_id) {
            Ok(actual) if actual == expected => {}
            Ok(actual) => {
                checkpoint.structural_integrity = false;
                checkpoint
                    .issues
                    .push(format!("artifact digest changed: expected {expected}, found {actual}"));
            }
            Err(err) => {
                checkpoint.structural_integrity = false;
                checkpoint.issues.push(format!("artifact digest unavailable: {err:#}"));
            }
        }
    }

    if checkpoint.passed() {
        info!(
            stage,
            session = session_id,
            issues = checkpoint.issues.len(),
            overall = checkpoint.overall_score(),
            "checkpoint passed"
        );
    } else {
        warn!(stage, session = session_id, issues = ?checkpoint.issues, "checkpoint failed");
    }
    checkpoint
}
