use anyhow::{Result, bail};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::commands::CommandReport;
use crate::prebake::checkpoint::{ValidationCheckpoint, assess};
use crate::prebake::classify::{ContentKind, classify};
use crate::prebake::config::{PrebakeConfig, load_config};
use crate::prebake::entry::{ConversationEntry, EntryKind};
use crate::prebake::integrity::dangling_parents;
use crate::prebake::reader::{LogReader, ReadSummary, ReaderOptions};

#[derive(Debug, Clone, Default)]
pub struct InspectOptions {
    pub log: PathBuf,
    pub lenient: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub path: PathBuf,
    pub session_id: Option<String>,
    pub summary: ReadSummary,
    pub entry_kinds: BTreeMap<EntryKind, usize>,
    /// Text payloads per content kind.
    pub content_kinds: BTreeMap<ContentKind, usize>,
    /// Payloads large enough to be condensed.
    pub condensable_blocks: usize,
    pub dangling_parents: usize,
    pub checkpoint: ValidationCheckpoint,
}

pub fn inspect_entries(
    path: PathBuf,
    entries: &[ConversationEntry],
    summary: ReadSummary,
    cfg: &PrebakeConfig,
) -> InspectReport {
    let mut entry_kinds = BTreeMap::new();
    let mut content_kinds = BTreeMap::new();
    let mut condensable_blocks = 0;
    for entry in entries {
        *entry_kinds.entry(entry.kind).or_insert(0) += 1;
        for text in entry.content().iter().filter_map(|b| b.text_payload()) {
            let classification = classify(&text, &cfg.condense);
            if classification.is_condensable(text.chars().count()) {
                condensable_blocks += 1;
            }
            *content_kinds.entry(classification.kind).or_insert(0) += 1;
        }
    }

    let session_id = entries.first().map(|e| e.session_id.clone());
    let checkpoint = assess(
        "inspect",
        session_id.as_deref().unwrap_or_default(),
        entries,
        &summary,
        &BTreeMap::new(),
        &cfg.pipeline,
    );
    InspectReport {
        path,
        session_id,
        dangling_parents: dangling_parents(entries).len(),
        summary,
        entry_kinds,
        content_kinds,
        condensable_blocks,
        checkpoint,
    }
}

pub fn to_command_report(inspect: &InspectReport) -> CommandReport {
    let mut report = CommandReport::new("inspect");
    let s = &inspect.summary;
    report.detail(format!("path={}", inspect.path.display()));
    if let Some(session) = &inspect.session_id {
        report.detail(format!("session_id={session}"));
    }
    report.detail(format!(
        "lines={} valid={} malformed={} blank={} success_rate={:.1}%",
        s.total_lines,
        s.valid,
        s.malformed,
        s.blank_lines,
        s.success_rate() * 100.0
    ));
    report.detail(format!(
        "repairs: uuids={} parents={} incomplete_tool_results={}",
        s.repaired_uuids, s.cleared_parents, s.incomplete_tool_results
    ));
    let kinds: Vec<String> = inspect
        .entry_kinds
        .iter()
        .map(|(k, n)| format!("{}={n}", k.label()))
        .collect();
    report.detail(format!("entries: {}", kinds.join(" ")));
    let content: Vec<String> = inspect
        .content_kinds
        .iter()
        .map(|(k, n)| format!("{}={n}", k.label()))
        .collect();
    report.detail(format!(
        "content: {} (condensable={})",
        content.join(" "),
        inspect.condensable_blocks
    ));
    report.detail(format!(
        "checkpoint: structural={} consistency={} score={:.1}%",
        inspect.checkpoint.structural_integrity,
        inspect.checkpoint.data_consistency,
        inspect.checkpoint.overall_score() * 100.0
    ));

    if let Some(err) = &s.io_error {
        report.issue(format!("read stopped early: {err}"));
    }
    if inspect.dangling_parents > 0 {
        report.detail(format!(
            "{} entries reference a parent missing from the log",
            inspect.dangling_parents
        ));
    }
    if inspect.checkpoint.passed() {
        for issue in &inspect.checkpoint.issues {
            report.detail(format!("note: {issue}"));
        }
    } else {
        for issue in &inspect.checkpoint.issues {
            report.issue(issue.clone());
        }
    }
    report
}

pub fn run(opts: &InspectOptions) -> Result<InspectReport> {
    if !opts.log.is_file() {
        bail!("log file not found: {}", opts.log.display());
    }
    let cfg = load_config()?;
    let options = ReaderOptions {
        strict: !opts.lenient,
        max_line_bytes: cfg.reader.max_line_bytes,
    };
    let mut reader = LogReader::open(&opts.log, options)?;
    let entries: Vec<ConversationEntry> = reader.by_ref().collect();
    let summary = reader.finish();
    Ok(inspect_entries(opts.log.clone(), &entries, summary, &cfg))
}

#[cfg(test)]
mod tests {
    use super::{inspect_entries, to_command_report};
    use crate::prebake::config::PrebakeConfig;
    use crate::prebake::entry::{ContentBlock, ConversationEntry, EntryKind};
    use crate::prebake::reader::ReadSummary;
    use std::path::PathBuf;

    fn entry(n: u32, parent: Option<u32>, kind: EntryKind, text: String) -> ConversationEntry {
        let parent = parent.map(|p| format!("00000000-0000-4000-8000-{p:012}"));
        ConversationEntry::new(
            format!("00000000-0000-4000-8000-{n:012}"),
            parent.as_deref(),
            kind,
            vec![ContentBlock::text(text)],
            format!("2025-01-01T00:00:{n:02}Z"),
            "s1",
        )
    }

    #[test]
    fn histograms_and_checkpoint_are_filled() {
        let entries = vec![
            entry(1, None, EntryKind::User, "Why does the build fail?".into()),
            entry(
                2,
                Some(1),
                EntryKind::Assistant,
                "2025-01-01 10:00:00 ERROR linker failed\n".repeat(30),
            ),
        ];
        let summary = ReadSummary {
            total_lines: 2,
            valid: 2,
            ..ReadSummary::default()
        };
        let inspect = inspect_entries(
            PathBuf::from("s1.jsonl"),
            &entries,
            summary,
            &PrebakeConfig::default(),
        );
        assert_eq!(inspect.session_id.as_deref(), Some("s1"));
        assert_eq!(inspect.entry_kinds.values().sum::<usize>(), 2);
        assert_eq!(inspect.content_kinds.values().sum::<usize>(), 2);
        assert_eq!(inspect.condensable_blocks, 1);
        assert!(inspect.checkpoint.passed());

        let report = to_command_report(&inspect);
        assert!(report.ok, "issues: {:?}", report.issues);
        assert!(report.details.iter().any(|d| d.starts_with("lines=2 valid=2")));
    }

    #[test]
    fn forward_parent_reference_fails_the_report() {
        let entries = vec![
            entry(1, Some(2), EntryKind::User, "first".into()),
            entry(2, None, EntryKind::Assistant, "second".into()),
        ];
        let summary = ReadSummary {
            total_lines: 2,
            valid: 2,
            ..ReadSummary::default()
        };
        let inspect = inspect_entries(
            PathBuf::from("s1.jsonl"),
            &entries,
            summary,
            &PrebakeConfig::default(),
        );
        let report = to_command_report(&inspect);
        assert!(!report.ok);
    }
}
