use crate::error::PrebakeError;
use crate::prebake::condense::{CondensePath, Condenser};
use crate::prebake::config::PrebakeConfig;
use crate::prebake::entry::ConversationEntry;
use crate::prebake::evaluator::{EvaluationSource, Evaluator};
use crate::prebake::integrity::{LinkRepair, enforce_retention};
use crate::prebake::oracle::Oracle;
use crate::prebake::progress::ProgressMonitor;
use crate::prebake::ratio::CondensationMetrics;
use crate::prebake::reader::{LogReader, ReaderOptions};
use crate::prebake::store::{ArtifactInfo, ArtifactStore};
use crate::prebake::util::reduction_ratio;
use anyhow::{Result, bail};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Entries between two progress notifications.
const PROGRESS_EVERY: usize = 25;

pub const INGEST_RECOVERY_INSTRUCTION: &str =
    "Provide a basic ingest focusing on well-formed records only";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Ingest,
    Retention,
    Condensation,
}

impl StageId {
    pub const ALL: [StageId; 3] = [StageId::Ingest, StageId::Retention, StageId::Condensation];

    pub fn label(self) -> &'static str {
        match self {
            StageId::Ingest => "stage-a",
            StageId::Retention => "stage-b",
            StageId::Condensation => "stage-c",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StageId::Ingest => "ingest",
            StageId::Retention => "retention",
            StageId::Condensation => "condensation",
        }
    }

    pub fn index(self) -> usize {
        match self {
            StageId::Ingest => 0,
            StageId::Retention => 1,
            StageId::Condensation => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSource {
    LogFile(PathBuf),
    Session(String),
}

impl StageSource {
    pub fn describe(&self) -> String {
        match self {
            StageSource::LogFile(path) => path.display().to_string(),
            StageSource::Session(id) => id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInput {
    pub source: StageSource,
    pub instruction: Option<String>,
}

/// Shared cancellation signal; clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a stage attempt needs, passed explicitly per run.
#[derive(Clone)]
pub struct StageContext {
    pub store: ArtifactStore,
    pub config: Arc<PrebakeConfig>,
    pub oracle: Arc<dyn Oracle>,
    pub monitor: Option<Arc<ProgressMonitor>>,
    pub operation_id: String,
    pub operation_cancel: CancelFlag,
    pub attempt_cancel: CancelFlag,
}

impl StageContext {
    /// Stops a stage at the next record once the run or this attempt is cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.operation_cancel.is_cancelled() || self.attempt_cancel.is_cancelled() {
            return Err(PrebakeError::Cancelled.into());
        }
        Ok(())
    }

    pub fn progress(&self, stage: StageId, current: usize, total: Option<usize>) {
        if let Some(monitor) = &self.monitor {
            monitor.update_stage_progress(&self.operation_id, stage.label(), current, total);
        }
    }

    pub fn throughput(&self, entries: usize, chars: usize) {
        if let Some(monitor) = &self.monitor
            && entries > 0
        {
            monitor.record_throughput(&self.operation_id, entries, chars);
        }
    }

    pub fn warn(&self, stage: StageId, message: &str) {
        if let Some(monitor) = &self.monitor {
            monitor.add_stage_warning(&self.operation_id, stage.label(), message);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageOutput {
    pub artifact: ArtifactInfo,
    pub entries_processed: usize,
    pub entries_output: usize,
    pub reduction_ratio: f64,
    pub metadata: Map<String, Value>,
    /// Stage-specific figures merged into the checkpoint's quality metrics.
    pub quality_metrics: BTreeMap<String, f64>,
}

/// One step of the pipeline. `recover` is the degraded variant used once
/// retries are exhausted.
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;
    fn run(&self, ctx: &StageContext, input: &StageInput) -> Result<StageOutput>;
    fn recover(&self, ctx: &StageContext, input: &StageInput) -> Result<StageOutput>;
}

fn expect_session<'a>(stage: StageId, input: &'a StageInput) -> Result<&'a str> {
    match &input.source {
        StageSource::Session(id) => Ok(id),
        StageSource::LogFile(path) => bail!(
            "{} reads a session artifact, got log file {}",
            stage.label(),
            path.display()
        ),
    }
}

/// Batches progress and throughput notifications.
struct Ticker<'a> {
    ctx: &'a StageContext,
    stage: StageId,
    total: Option<usize>,
    done: usize,
    pending_entries: usize,
    pending_chars: usize,
}

impl<'a> Ticker<'a> {
    fn new(ctx: &'a StageContext, stage: StageId, total: Option<usize>) -> Self {
        Self {
            ctx,
            stage,
            total,
            done: 0,
            pending_entries: 0,
            pending_chars: 0,
        }
    }

    fn tick(&mut self, chars: usize) {
        self.done += 1;
        self.pending_entries += 1;
        self.pending_chars += chars;
        if self.done % PROGRESS_EVERY == 0 {
            self.flush();
        }
    }

    fn flush(&mut self) {
        self.ctx.progress(self.stage, self.done, self.total);
        self.ctx.throughput(self.pending_entries, self.pending_chars);
        self.pending_entries = 0;
        self.pending_chars = 0;
    }
}

/// Writes the retained subset of `entries` with hand-off repair applied.
fn write_retained(
    ctx: &StageContext,
    entries: Vec<ConversationEntry>,
    keep: &[bool],
) -> Result<(ArtifactInfo, LinkRepair)> {
    let mut writer = ctx.store.writer()?;
    let mut repair = LinkRepair::default();
    for (mut entry, kept) in entries.into_iter().zip(keep.iter().copied()) {
        if !kept {
            continue;
        }
        repair.admit(&mut entry);
        writer.push(entry)?;
    }
    ctx.check_cancelled()?;
    Ok((writer.commit()?, repair))
}

fn load_session(ctx: &StageContext, stage: StageId, session_id: &str) -> Result<Vec<ConversationEntry>> {
    let (entries, summary) = ctx.store.read_all(session_id)?;
    if summary.malformed > 0 {
        ctx.warn(
            stage,
            &format!("{} malformed lines skipped in {session_id}", summary.malformed),
        );
    }
    if entries.is_empty() {
        return Err(PrebakeError::EmptyArtifact(session_id.to_string()).into());
    }
    Ok(entries)
}

// ---- stage A ----

/// Streams the source log into a fresh artifact, repairing entries on the way.
pub struct IngestStage;

impl IngestStage {
    fn ingest(
        &self,
        ctx: &StageContext,
        input: &StageInput,
        options: ReaderOptions,
        instruction: Option<&str>,
    ) -> Result<StageOutput> {
        let path = match &input.source {
            StageSource::LogFile(path) => path,
            StageSource::Session(id) => bail!("stage-a reads a log file, got session {id}"),
        };
        let strict = options.strict;
        let mut reader = LogReader::open(path, options)?;
        let mut writer = ctx.store.writer()?;
        let mut repair = LinkRepair::default();
        let mut ticker = Ticker::new(ctx, StageId::Ingest, None);
        let mut source_session: Option<String> = None;

        for mut entry in reader.by_ref() {
            ctx.check_cancelled()?;
            if source_session.is_none() {
                source_session = Some(entry.session_id.clone());
            }
            repair.admit(&mut entry);
            let chars = entry.content_chars();
            writer.push(entry)?;
            ticker.tick(chars);
        }
        ticker.flush();

        let summary = reader.summary().clone();
        if let Some(err) = &summary.io_error {
            bail!("failed reading {}: {err}", path.display());
        }
        if summary.malformed > 0 {
            ctx.warn(
                StageId::Ingest,
                &format!("{} malformed lines skipped", summary.malformed),
            );
        }
        if writer.entries() == 0 {
            return Err(PrebakeError::EmptyArtifact(path.display().to_string()).into());
        }
        ctx.check_cancelled()?;
        let artifact = writer.commit()?;
        info!(
            session = %artifact.session_id,
            lines = summary.total_lines,
            valid = summary.valid,
            malformed = summary.malformed,
            "stage-a wrote artifact"
        );

        let mut metadata = Map::new();
        metadata.insert("source_path".into(), json!(path.display().to_string()));
        metadata.insert("source_session_id".into(), json!(source_session));
        metadata.insert("lines_read".into(), json!(summary.total_lines));
        metadata.insert("malformed_lines".into(), json!(summary.malformed));
        metadata.insert("repaired_uuids".into(), json!(summary.repaired_uuids));
        metadata.insert("cleared_invalid_parents".into(), json!(summary.cleared_parents));
        metadata.insert(
            "incomplete_tool_results".into(),
            json!(summary.incomplete_tool_results),
        );
        metadata.insert("cleared_dangling_parents".into(), json!(repair.cleared_parents));
        metadata.insert("rekeyed_uuids".into(), json!(repair.rekeyed));
        metadata.insert("strict_parsing".into(), json!(strict));
        if let Some(instruction) = instruction {
            metadata.insert("instruction".into(), json!(instruction));
        }

        let mut quality_metrics = BTreeMap::new();
        quality_metrics.insert("ingest_success_rate".to_string(), summary.success_rate());

        Ok(StageOutput {
            entries_processed: summary.total_lines,
            entries_output: artifact.entries,
            reduction_ratio: reduction_ratio(summary.total_lines, artifact.entries),
            artifact,
            metadata,
            quality_metrics,
        })
    }
}

impl Stage for IngestStage {
    fn id(&self) -> StageId {
        StageId::Ingest
    }

    fn run(&self, ctx: &StageContext, input: &StageInput) -> Result<StageOutput> {
        let options = ReaderOptions {
            strict: true,
            max_line_bytes: ctx.config.reader.max_line_bytes,
        };
        self.ingest(ctx, input, options, input.instruction.as_deref())
    }

    fn recover(&self, ctx: &StageContext, input: &StageInput) -> Result<StageOutput> {
        let options = ReaderOptions {
            max_line_bytes: ctx.config.reader.max_line_bytes,
            ..ReaderOptions::lenient()
        };
        let mut out = self.ingest(ctx, input, options, Some(INGEST_RECOVERY_INSTRUCTION))?;
        out.metadata.insert("recovery_strategy".into(), json!("basic-ingest"));
        Ok(out)
    }
}

// ---- stage B ----

/// Keeps the entries worth carrying forward, with the integrity guard
/// settling any drop that would orphan a retained child.
pub struct RetentionStage;

impl Stage for RetentionStage {
    fn id(&self) -> StageId {
        StageId::Retention
    }

    fn run(&self, ctx: &StageContext, input: &StageInput) -> Result<StageOutput> {
        let session_id = expect_session(StageId::Retention, input)?;
        let entries = load_session(ctx, StageId::Retention, session_id)?;
        let total = entries.len();
        let evaluator = Evaluator::new(
            ctx.oracle.as_ref(),
            &ctx.config.evaluator,
            input.instruction.as_deref(),
        );

        let mut keep = Vec::with_capacity(total);
        let mut oracle_decisions = 0usize;
        let mut rule_decisions = 0usize;
        let mut ticker = Ticker::new(ctx, StageId::Retention, Some(total));
        for (index, entry) in entries.iter().enumerate() {
            ctx.check_cancelled()?;
            let evaluation = evaluator.evaluate(index, entry);
            match evaluation.source {
                EvaluationSource::Oracle => oracle_decisions += 1,
                EvaluationSource::Rules => rule_decisions += 1,
            }
            keep.push(evaluation.decision.is_keep());
            ticker.tick(entry.content_chars());
        }
        ticker.flush();

        let tentative = keep.iter().filter(|k| **k).count();
        let forced = enforce_retention(&entries, &mut keep);
        if tentative == 0 && !forced.is_empty() {
            debug!(forced = forced.len(), "integrity guard kept entries from an empty selection");
        }
        let (artifact, repair) = write_retained(ctx, entries, &keep)?;
        if artifact.entries == 0 {
            return Err(PrebakeError::EmptyArtifact(artifact.session_id).into());
        }
        info!(
            session = %artifact.session_id,
            input = total,
            kept = artifact.entries,
            forced = forced.len(),
            "stage-b wrote artifact"
        );

        let mut metadata = Map::new();
        metadata.insert("input_session_id".into(), json!(session_id));
        metadata.insert("oracle".into(), json!(ctx.oracle.label()));
        metadata.insert("oracle_decisions".into(), json!(oracle_decisions));
        metadata.insert("rule_decisions".into(), json!(rule_decisions));
        metadata.insert("removed".into(), json!(total - artifact.entries));
        metadata.insert(
            "forced_keeps".into(),
            Value::Array(
                forced
                    .iter()
                    .map(|f| json!({"uuid": f.uuid, "reason": f.reason}))
                    .collect(),
            ),
        );
        metadata.insert("cleared_dangling_parents".into(), json!(repair.cleared_parents));
        metadata.insert("rekeyed_uuids".into(), json!(repair.rekeyed));
        if let Some(instruction) = &input.instruction {
            metadata.insert("instruction".into(), json!(instruction));
        }

        let mut quality_metrics = BTreeMap::new();
        quality_metrics.insert(
            "retention_rate".to_string(),
            artifact.entries as f64 / total as f64,
        );

        Ok(StageOutput {
            entries_processed: total,
            entries_output: artifact.entries,
            reduction_ratio: reduction_ratio(total, artifact.entries),
            artifact,
            metadata,
            quality_metrics,
        })
    }

    fn recover(&self, ctx: &StageContext, input: &StageInput) -> Result<StageOutput> {
        let session_id = expect_session(StageId::Retention, input)?;
        let entries = load_session(ctx, StageId::Retention, session_id)?;
        let total = entries.len();
        let keep: Vec<bool> = (0..total).map(|i| i % 2 == 0).collect();
        let (artifact, repair) = write_retained(ctx, entries, &keep)?;

        let mut metadata = Map::new();
        metadata.insert("input_session_id".into(), json!(session_id));
        metadata.insert("recovery_strategy".into(), json!("simple-filtering"));
        metadata.insert("removed".into(), json!(total - artifact.entries));
        metadata.insert("cleared_dangling_parents".into(), json!(repair.cleared_parents));
        metadata.insert("rekeyed_uuids".into(), json!(repair.rekeyed));

        Ok(StageOutput {
            entries_processed: total,
            entries_output: artifact.entries,
            reduction_ratio: reduction_ratio(total, artifact.entries),
            artifact,
            metadata,
            quality_metrics: BTreeMap::new(),
        })
    }
}

// ---- stage C ----

/// Condenses the text of every block, rolling back any rewrite that fails
/// its quality or accuracy checks.
pub struct CondensationStage;

impl Stage for CondensationStage {
    fn id(&self) -> StageId {
        StageId::Condensation
    }

    fn run(&self, ctx: &StageContext, input: &StageInput) -> Result<StageOutput> {
        let session_id = expect_session(StageId::Condensation, input)?;
        let mut reader = ctx.store.open_reader(session_id, ReaderOptions::artifact())?;
        let mut writer = ctx.store.writer()?;
        let condenser = Condenser::new(
            &ctx.config.condense,
            ctx.oracle.as_ref(),
            input.instruction.as_deref(),
        );
        let mut metrics = CondensationMetrics::default();
        let mut ticker = Ticker::new(ctx, StageId::Condensation, None);

        for mut entry in reader.by_ref() {
            ctx.check_cancelled()?;
            let uuid = entry.uuid.clone();
            let timestamp = entry.timestamp.clone();
            let mut entry_chars = 0;
            for block in entry.content_mut() {
                let Some(text) = block.text_payload() else {
                    continue;
                };
                let outcome = condenser.condense_block(&uuid, &timestamp, &text);
                entry_chars += outcome.original_chars;
                match outcome.path {
                    CondensePath::Skipped => {
                        metrics.record_skipped(outcome.kind, outcome.original_chars);
                    }
                    CondensePath::Strategy | CondensePath::Oracle => {
                        metrics.record_success(
                            outcome.kind,
                            outcome.target_ratio,
                            outcome.original_chars,
                            outcome.output_chars,
                            outcome.quality,
                        );
                        block.replace_text_payload(outcome.text);
                    }
                    CondensePath::RolledBack => {
                        let reason = outcome.failure.as_deref().unwrap_or("unknown");
                        metrics.record_failure(
                            outcome.kind,
                            outcome.target_ratio,
                            outcome.original_chars,
                            reason,
                        );
                    }
                }
            }
            writer.push(entry)?;
            ticker.tick(entry_chars);
        }
        ticker.flush();

        let summary = reader.summary().clone();
        if let Some(err) = &summary.io_error {
            bail!("failed reading session {session_id}: {err}");
        }
        if writer.entries() == 0 {
            return Err(PrebakeError::EmptyArtifact(session_id.to_string()).into());
        }
        ctx.check_cancelled()?;
        let artifact = writer.commit()?;
        debug!("{}", metrics.report());
        info!(
            session = %artifact.session_id,
            blocks = metrics.total_blocks,
            condensed = metrics.successes,
            rolled_back = metrics.rollbacks,
            chars_before = metrics.original_chars,
            chars_after = metrics.output_chars,
            "stage-c wrote artifact"
        );
        if metrics.rollbacks > 0 {
            ctx.warn(
                StageId::Condensation,
                &format!("{} blocks rolled back to their original text", metrics.rollbacks),
            );
        }

        let mut metadata = Map::new();
        metadata.insert("input_session_id".into(), json!(session_id));
        metadata.insert("oracle".into(), json!(ctx.oracle.label()));
        metadata.insert("chars_before".into(), json!(metrics.original_chars));
        metadata.insert("chars_after".into(), json!(metrics.output_chars));
        metadata.insert("condensation".into(), serde_json::to_value(&metrics)?);
        if let Some(instruction) = &input.instruction {
            metadata.insert("instruction".into(), json!(instruction));
        }

        let mut quality_metrics = BTreeMap::new();
        quality_metrics.insert(
            "condensation_success_rate".to_string(),
            metrics.success_rate(),
        );
        quality_metrics.insert("ratio_achievement".to_string(), metrics.ratio_achievement());

        Ok(StageOutput {
            entries_processed: summary.valid,
            entries_output: artifact.entries,
            reduction_ratio: metrics.overall_actual_ratio(),
            artifact,
            metadata,
            quality_metrics,
        })
    }

    fn recover(&self, ctx: &StageContext, input: &StageInput) -> Result<StageOutput> {
        let session_id = expect_session(StageId::Condensation, input)?;
        let mut reader = ctx.store.open_reader(session_id, ReaderOptions::artifact())?;
        let mut writer = ctx.store.writer()?;
        for entry in reader.by_ref() {
            ctx.check_cancelled()?;
            writer.push(entry)?;
        }
        if let Some(err) = &reader.summary().io_error {
            bail!("failed reading session {session_id}: {err}");
        }
        if writer.entries() == 0 {
            return Err(PrebakeError::EmptyArtifact(session_id.to_string()).into());
        }
        ctx.check_cancelled()?;
        let artifact = writer.commit()?;

        let mut metadata = Map::new();
        metadata.insert("input_session_id".into(), json!(session_id));
        metadata.insert("recovery_strategy".into(), json!("pass-through"));

        Ok(StageOutput {
            entries_processed: artifact.entries,
            entries_output: artifact.entries,
            reduction_ratio: 0.0,
            artifact,
            metadata,
            quality_metrics: BTreeMap::new(),
        })
    }
}

pub fn default_stages() -> [Arc<dyn Stage>; 3] {
    [
        Arc::new(IngestStage),
        Arc::new(RetentionStage),
        Arc::new(CondensationStage),
    ]
}

#[cfg(test)]
mod tests {
    use super::{
        CancelFlag, CondensationStage, IngestStage, RetentionStage, Stage, StageContext,
        StageInput, StageSource,
    };
    use crate::error::{PrebakeError, find_prebake_error};
    use crate::prebake::config::PrebakeConfig;
    use crate::prebake::entry::{ContentBlock, ConversationEntry, EntryKind};
    use crate::prebake::integrity::dangling_parents;
    use crate::prebake::oracle::RuleOnlyOracle;
    use crate::prebake::store::ArtifactStore;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    fn uuid(n: u32) -> String {
        format!("00000000-0000-4000-8000-{n:012}")
    }

    fn entry(n: u32, parent: Option<u32>, kind: EntryKind, content: Vec<ContentBlock>) -> ConversationEntry {
        let parent = parent.map(uuid);
        ConversationEntry::new(
            uuid(n),
            parent.as_deref(),
            kind,
            content,
            format!("2025-01-01T00:00:{:02}Z", n % 60),
            "source-session",
        )
    }

    fn context(root: &Path) -> StageContext {
        StageContext {
            store: ArtifactStore::new(root.join("sessions")),
            config: Arc::new(PrebakeConfig::default()),
            oracle: Arc::new(RuleOnlyOracle),
            monitor: None,
            operation_id: "op".into(),
            operation_cancel: CancelFlag::default(),
            attempt_cancel: CancelFlag::default(),
        }
    }

    fn write_log(path: &Path, entries: &[ConversationEntry]) {
        let body: Vec<String> = entries
            .iter()
            .map(|e| serde_json::to_string(e).expect("serialize"))
            .collect();
        fs::write(path, body.join("\n") + "\n").expect("write log");
    }

    fn conversation() -> Vec<ConversationEntry> {
        vec![
            entry(1, None, EntryKind::User, vec![ContentBlock::text("Please fix the parser bug")]),
            entry(2, Some(1), EntryKind::Assistant, vec![ContentBlock::tool_use("t1", "Read", json!({"file_path": "src/parser.rs"}))]),
            entry(3, Some(2), EntryKind::User, vec![ContentBlock::tool_result("t1", "ok")]),
            entry(4, Some(3), EntryKind::Assistant, vec![ContentBlock::text("Done.")]),
            entry(5, Some(3), EntryKind::Assistant, vec![ContentBlock::text("The parser now rejects trailing commas.")]),
        ]
    }

    #[test]
    fn ingest_restamps_session_and_counts_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let log = dir.path().join("source.jsonl");
        write_log(&log, &conversation());
        let mut raw = fs::read_to_string(&log).expect("read");
        raw.push_str("{broken\n");
        fs::write(&log, raw).expect("append");

        let input = StageInput {
            source: StageSource::LogFile(log),
            instruction: None,
        };
        let out = IngestStage.run(&ctx, &input).expect("ingest");
        assert_eq!(out.entries_processed, 6);
        assert_eq!(out.entries_output, 5);
        assert_eq!(out.metadata["malformed_lines"], 1);
        assert_eq!(out.metadata["source_session_id"], "source-session");

        let (entries, _) = ctx.store.read_all(&out.artifact.session_id).expect("read back");
        assert!(entries.iter().all(|e| e.session_id == out.artifact.session_id));
        assert_ne!(out.artifact.session_id, "source-session");
    }

    #[test]
    fn retention_drops_noise_but_keeps_parent_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let log = dir.path().join("source.jsonl");
        write_log(&log, &conversation());
        let ingest = IngestStage
            .run(&ctx, &StageInput { source: StageSource::LogFile(log), instruction: None })
            .expect("ingest");

        let input = StageInput {
            source: StageSource::Session(ingest.artifact.session_id.clone()),
            instruction: None,
        };
        let out = RetentionStage.run(&ctx, &input).expect("retention");
        let (entries, _) = ctx.store.read_all(&out.artifact.session_id).expect("read back");
        let kept: Vec<&str> = entries.iter().map(|e| e.uuid.as_str()).collect();

        // 3 is a confirmation but 5 needs it as parent; 4 is terse and childless.
        assert_eq!(kept, vec![uuid(1), uuid(2), uuid(3), uuid(5)]);
        assert!(dangling_parents(&entries).is_empty());
        assert_eq!(out.metadata["forced_keeps"].as_array().map(Vec::len), Some(1));
        assert_eq!(out.metadata["rule_decisions"], 5);
    }

    #[test]
    fn leniently_ingested_entries_survive_into_retention() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let log = dir.path().join("source.jsonl");
        write_log(
            &log,
            &[
                entry(1, None, EntryKind::User, vec![ContentBlock::text("Explain the syntax `fn main() {` please")]),
                entry(2, Some(1), EntryKind::Assistant, vec![ContentBlock::text("The brace opens the body of main; it closes at the end of the file.")]),
            ],
        );
        let input = StageInput {
            source: StageSource::LogFile(log),
            instruction: None,
        };
        assert_eq!(IngestStage.run(&ctx, &input).expect("strict ingest").entries_output, 1);

        let recovered = IngestStage.recover(&ctx, &input).expect("recover");
        assert_eq!(recovered.entries_output, 2);
        let (entries, summary) = ctx.store.read_all(&recovered.artifact.session_id).expect("read back");
        assert_eq!(entries.len(), 2);
        assert_eq!(summary.malformed, 0);

        let retention = RetentionStage
            .run(
                &ctx,
                &StageInput {
                    source: StageSource::Session(recovered.artifact.session_id.clone()),
                    instruction: None,
                },
            )
            .expect("retention");
        assert_eq!(retention.entries_processed, 2);
        assert_eq!(retention.entries_output, 2);
    }

    #[test]
    fn retention_recovery_keeps_even_positions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let mut writer = ctx.store.writer().expect("writer");
        for e in conversation() {
            writer.push(e).expect("push");
        }
        let info = writer.commit().expect("commit");

        let input = StageInput {
            source: StageSource::Session(info.session_id),
            instruction: None,
        };
        let out = RetentionStage.recover(&ctx, &input).expect("recover");
        assert_eq!(out.entries_output, 3);
        assert_eq!(out.metadata["recovery_strategy"], "simple-filtering");
        let (entries, _) = ctx.store.read_all(&out.artifact.session_id).expect("read back");
        assert!(dangling_parents(&entries).is_empty());
    }

    #[test]
    fn condensation_shrinks_large_logs_and_passes_small_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let noisy = "2025-01-01 10:00:00 INFO heartbeat ok\n".repeat(40)
            + "2025-01-01 10:00:41 ERROR disk full on /var\n";
        let mut writer = ctx.store.writer().expect("writer");
        writer
            .push(entry(1, None, EntryKind::User, vec![ContentBlock::text("short note")]))
            .expect("push");
        writer
            .push(entry(2, Some(1), EntryKind::User, vec![ContentBlock::tool_result("t1", noisy.clone())]))
            .expect("push");
        let info = writer.commit().expect("commit");

        let input = StageInput {
            source: StageSource::Session(info.session_id),
            instruction: None,
        };
        let out = CondensationStage.run(&ctx, &input).expect("condense");
        assert_eq!(out.entries_output, 2);
        assert!(out.reduction_ratio > 0.0);

        let (entries, _) = ctx.store.read_all(&out.artifact.session_id).expect("read back");
        assert_eq!(entries[0].text(), "short note");
        let condensed = entries[1].text();
        assert!(condensed.len() < noisy.len());
        assert!(condensed.contains("ERROR disk full on /var"));
    }

    #[test]
    fn condensation_recovery_is_pass_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let mut writer = ctx.store.writer().expect("writer");
        for e in conversation() {
            writer.push(e).expect("push");
        }
        let info = writer.commit().expect("commit");
        let input = StageInput {
            source: StageSource::Session(info.session_id.clone()),
            instruction: None,
        };
        let out = CondensationStage.recover(&ctx, &input).expect("recover");
        let (before, _) = ctx.store.read_all(&info.session_id).expect("before");
        let (after, _) = ctx.store.read_all(&out.artifact.session_id).expect("after");
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.content(), b.content());
            assert_eq!(a.uuid, b.uuid);
        }
    }

    #[test]
    fn cancelled_context_stops_stage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let log = dir.path().join("source.jsonl");
        write_log(&log, &conversation());
        ctx.operation_cancel.cancel();
        let err = IngestStage
            .run(&ctx, &StageInput { source: StageSource::LogFile(log), instruction: None })
            .expect_err("cancelled");
        assert!(matches!(find_prebake_error(&err), Some(PrebakeError::Cancelled)));
    }
}
