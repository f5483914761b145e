use crate::error::{PrebakeError, find_prebake_error};
use crate::prebake::audit;
use crate::prebake::checkpoint::{ValidationCheckpoint, run_checkpoint};
use crate::prebake::config::{PipelineConfig, PrebakeConfig};
use crate::prebake::oracle::{Oracle, RuleOnlyOracle};
use crate::prebake::paths::PrebakePaths;
use crate::prebake::progress::ProgressMonitor;
use crate::prebake::stages::{
    CancelFlag, Stage, StageContext, StageId, StageInput, StageOutput, StageSource, default_stages,
};
use crate::prebake::store::ArtifactStore;
use crate::prebake::util::{duration_millis, now_epoch_millis};
use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const MAX_BACKOFF_MS: u64 = 60_000;
const CANCEL_POLL: Duration = Duration::from_millis(25);
/// How long a timed-out worker gets to notice its cancel flag.
const WORKER_GRACE: Duration = Duration::from_secs(5);

/// Delay before retry `retry` (0-based): `base * 2^retry`, capped.
pub fn backoff_delay_ms(retry: u32, base_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    RunningStageA,
    CheckpointA,
    RunningStageB,
    CheckpointB,
    RunningStageC,
    CheckpointC,
    Done,
    Failed,
}

impl PipelineState {
    pub fn running(stage: StageId) -> Self {
        match stage {
            StageId::Ingest => PipelineState::RunningStageA,
            StageId::Retention => PipelineState::RunningStageB,
            StageId::Condensation => PipelineState::RunningStageC,
        }
    }

    pub fn checkpoint(stage: StageId) -> Self {
        match stage {
            StageId::Ingest => PipelineState::CheckpointA,
            StageId::Retention => PipelineState::CheckpointB,
            StageId::Condensation => PipelineState::CheckpointC,
        }
    }

    fn rank(self) -> usize {
        match self {
            PipelineState::Idle => 0,
            PipelineState::RunningStageA => 1,
            PipelineState::CheckpointA => 2,
            PipelineState::RunningStageB => 3,
            PipelineState::CheckpointB => 4,
            PipelineState::RunningStageC => 5,
            PipelineState::CheckpointC => 6,
            PipelineState::Done => 7,
            PipelineState::Failed => 8,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Forward moves only, plus a failed checkpoint handing back to its own
    /// stage for another attempt. `Failed` is reachable from any live state.
    pub fn allows(self, next: PipelineState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, PipelineState::Failed) => true,
            (PipelineState::CheckpointA, PipelineState::RunningStageA)
            | (PipelineState::CheckpointB, PipelineState::RunningStageB)
            | (PipelineState::CheckpointC, PipelineState::RunningStageC) => true,
            (PipelineState::Idle, PipelineState::Done) => false,
            _ => next.rank() > self.rank(),
        }
    }
}

/// Knobs for one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub enable_stage_a: bool,
    pub enable_stage_b: bool,
    pub enable_stage_c: bool,
    /// Input for the first enabled stage after A when A is skipped.
    pub input_session: Option<String>,
    pub instruction_a: Option<String>,
    pub instruction_b: Option<String>,
    pub instruction_c: Option<String>,
    pub validate_between_stages: bool,
    pub enable_progress_reporting: bool,
    pub enable_error_recovery: bool,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub stage_timeouts: [Duration; 3],
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl PipelineOptions {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            enable_stage_a: true,
            enable_stage_b: true,
            enable_stage_c: true,
            input_session: None,
            instruction_a: None,
            instruction_b: None,
            instruction_c: None,
            validate_between_stages: cfg.validate_between_stages,
            enable_progress_reporting: cfg.progress_reporting,
            enable_error_recovery: cfg.error_recovery,
            max_retries: cfg.max_retries,
            retry_base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            stage_timeouts: cfg.stage_timeouts(),
        }
    }

    /// Applies one timeout to every stage.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeouts = [timeout; 3];
        self
    }

    pub fn enabled(&self, stage: StageId) -> bool {
        match stage {
            StageId::Ingest => self.enable_stage_a,
            StageId::Retention => self.enable_stage_b,
            StageId::Condensation => self.enable_stage_c,
        }
    }

    pub fn instruction(&self, stage: StageId) -> Option<&str> {
        let raw = match stage {
            StageId::Ingest => self.instruction_a.as_deref(),
            StageId::Retention => self.instruction_b.as_deref(),
            StageId::Condensation => self.instruction_c.as_deref(),
        };
        raw.map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub stage: StageId,
    pub label: String,
    pub input: Option<String>,
    pub output_session_id: Option<String>,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub duration_ms: u64,
    pub entries_processed: usize,
    pub entries_output: usize,
    pub reduction_ratio: f64,
    pub success: bool,
    pub error: Option<String>,
    pub attempts: u32,
    pub retry_attempts: u32,
    pub recovery_used: bool,
    pub backoff_ms: Vec<u64>,
    pub metadata: Map<String, Value>,
}

impl StageResult {
    fn begin(stage: StageId, input: Option<String>) -> Self {
        let now = now_epoch_millis();
        Self {
            stage,
            label: stage.label().to_string(),
            input,
            output_session_id: None,
            started_at_ms: now,
            finished_at_ms: now,
            duration_ms: 0,
            entries_processed: 0,
            entries_output: 0,
            reduction_ratio: 0.0,
            success: false,
            error: None,
            attempts: 0,
            retry_attempts: 0,
            recovery_used: false,
            backoff_ms: Vec::new(),
            metadata: Map::new(),
        }
    }

    fn finish(&mut self) {
        self.finished_at_ms = now_epoch_millis();
        self.duration_ms = self.finished_at_ms.saturating_sub(self.started_at_ms);
        self.metadata
            .insert("recovery_used".into(), json!(self.recovery_used));
        self.metadata
            .insert("retry_attempts".into(), json!(self.retry_attempts));
        self.metadata.insert("attempts".into(), json!(self.attempts));
        self.metadata.insert("backoff_ms".into(), json!(self.backoff_ms));
    }

    fn absorb(&mut self, output: StageOutput) {
        self.output_session_id = Some(output.artifact.session_id.clone());
        self.entries_processed = output.entries_processed;
        self.entries_output = output.entries_output;
        self.reduction_ratio = output.reduction_ratio;
        self.metadata.extend(output.metadata);
        self.metadata
            .insert("artifact_sha256".into(), json!(output.artifact.sha256));
        self.metadata
            .insert("artifact_path".into(), json!(output.artifact.path.display().to_string()));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityScores {
    pub overall_quality: f64,
    pub checkpoint_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMetadata {
    pub lines_ingested: usize,
    pub quality_scores: QualityScores,
    pub recovery_attempts: usize,
    pub retry_attempts: u32,
    pub stages_succeeded: Vec<String>,
    pub stages_failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrebakeResult {
    pub operation_id: String,
    pub success: bool,
    pub source_path: PathBuf,
    pub original_session_id: Option<String>,
    pub final_session_id: Option<String>,
    pub stage_results: Vec<StageResult>,
    pub checkpoints: Vec<ValidationCheckpoint>,
    pub states: Vec<PipelineState>,
    pub total_duration_ms: u64,
    pub overall_reduction_ratio: f64,
    pub metadata: ResultMetadata,
    pub error: Option<String>,
}

impl PrebakeResult {
    pub fn state(&self) -> PipelineState {
        self.states.last().copied().unwrap_or(PipelineState::Idle)
    }

    pub fn stage(&self, stage: StageId) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.stage == stage)
    }
}

/// `1 - last.entries_output / first.entries_processed` over successful stages.
pub fn overall_reduction(results: &[StageResult]) -> f64 {
    let succeeded: Vec<&StageResult> = results.iter().filter(|r| r.success).collect();
    let Some(first) = succeeded.iter().find(|r| r.entries_processed > 0) else {
        return 0.0;
    };
    let Some(last) = succeeded.last() else {
        return 0.0;
    };
    1.0 - last.entries_output as f64 / first.entries_processed as f64
}

fn aggregate_quality(checkpoints: &[ValidationCheckpoint]) -> QualityScores {
    if checkpoints.is_empty() {
        return QualityScores {
            overall_quality: 1.0,
            checkpoint_count: 0,
        };
    }
    let total: f64 = checkpoints.iter().map(ValidationCheckpoint::overall_score).sum();
    QualityScores {
        overall_quality: total / checkpoints.len() as f64,
        checkpoint_count: checkpoints.len(),
    }
}

/// Bookkeeping for one `execute` call.
struct Run {
    operation_id: String,
    started: Instant,
    source_path: PathBuf,
    states: Vec<PipelineState>,
    stage_results: Vec<StageResult>,
    checkpoints: Vec<ValidationCheckpoint>,
    original_session_id: Option<String>,
}

impl Run {
    fn transition(&mut self, next: PipelineState) {
        let current = self.states.last().copied().unwrap_or(PipelineState::Idle);
        if current == next {
            return;
        }
        if !current.allows(next) {
            warn!(?current, ?next, "unexpected pipeline state transition");
        }
        self.states.push(next);
    }

    fn into_result(mut self, error: Option<String>) -> PrebakeResult {
        let success = error.is_none();
        let terminal = if success {
            PipelineState::Done
        } else {
            PipelineState::Failed
        };
        self.transition(terminal);

        let final_session_id = if success {
            self.stage_results
                .iter()
                .rev()
                .find_map(|r| r.output_session_id.clone())
        } else {
            None
        };
        let lines_ingested = self
            .stage_results
            .iter()
            .find(|r| r.stage == StageId::Ingest && r.success)
            .map(|r| r.entries_processed)
            .unwrap_or(0);
        let metadata = ResultMetadata {
            lines_ingested,
            quality_scores: aggregate_quality(&self.checkpoints),
            recovery_attempts: self.stage_results.iter().filter(|r| r.recovery_used).count(),
            retry_attempts: self.stage_results.iter().map(|r| r.retry_attempts).sum(),
            stages_succeeded: self
                .stage_results
                .iter()
                .filter(|r| r.success)
                .map(|r| r.label.clone())
                .collect(),
            stages_failed: self
                .stage_results
                .iter()
                .filter(|r| !r.success)
                .map(|r| r.label.clone())
                .collect(),
        };

        PrebakeResult {
            operation_id: self.operation_id,
            success,
            source_path: self.source_path,
            original_session_id: self.original_session_id,
            final_session_id,
            overall_reduction_ratio: overall_reduction(&self.stage_results),
            stage_results: self.stage_results,
            checkpoints: self.checkpoints,
            states: self.states,
            total_duration_ms: duration_millis(self.started.elapsed()),
            metadata,
            error,
        }
    }
}

enum AttemptFailure {
    /// Worth another attempt or a recovery pass.
    Retryable(anyhow::Error),
    /// Ends the stage immediately.
    Fatal(anyhow::Error),
}

/// Sequences the three stages with checkpoints, retries and recovery.
pub struct Orchestrator {
    store: ArtifactStore,
    config: Arc<PrebakeConfig>,
    oracle: Arc<dyn Oracle>,
    monitor: Option<Arc<ProgressMonitor>>,
    stages: [Arc<dyn Stage>; 3],
    audit_paths: Option<PrebakePaths>,
    cancel: CancelFlag,
}

impl Orchestrator {
    pub fn new(store: ArtifactStore, config: PrebakeConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            oracle: Arc::new(RuleOnlyOracle),
            monitor: None,
            stages: default_stages(),
            audit_paths: None,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn Oracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<ProgressMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Replaces the implementation of the stage with the same id.
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        let index = stage.id().index();
        self.stages[index] = stage;
        self
    }

    pub fn with_audit_log(mut self, paths: PrebakePaths) -> Self {
        self.audit_paths = Some(paths);
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Handle that cancels the current and any later run of this orchestrator.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn audit(&self, operation_id: &str, phase: &str, status: &str, message: &str) {
        if let Some(paths) = &self.audit_paths
            && let Err(err) = audit::append_event(paths, operation_id, phase, status, message)
        {
            warn!(operation = operation_id, "audit append failed: {err:#}");
        }
    }

    fn monitor(&self, options: &PipelineOptions) -> Option<&Arc<ProgressMonitor>> {
        if options.enable_progress_reporting {
            self.monitor.as_ref()
        } else {
            None
        }
    }

    pub fn execute(&self, source: &Path, options: &PipelineOptions) -> PrebakeResult {
        let operation_id = uuid::Uuid::new_v4().to_string();
        let mut run = Run {
            operation_id: operation_id.clone(),
            started: Instant::now(),
            source_path: source.to_path_buf(),
            states: vec![PipelineState::Idle],
            stage_results: Vec::new(),
            checkpoints: Vec::new(),
            original_session_id: None,
        };

        let enabled: Vec<StageId> = StageId::ALL
            .into_iter()
            .filter(|s| options.enabled(*s))
            .collect();
        if enabled.is_empty() {
            return run.into_result(Some("no stages enabled".to_string()));
        }

        let _lock = match self.store.lock() {
            Ok(lock) => lock,
            Err(err) => {
                error!("pipeline not started: {err:#}");
                return run.into_result(Some(format!("{err:#}")));
            }
        };

        let monitor = self.monitor(options).cloned();
        if let Some(m) = &monitor {
            let labels: Vec<&str> = enabled.iter().map(|s| s.label()).collect();
            m.start_operation(&operation_id, &format!("prebake {}", source.display()), &labels);
        }
        self.audit(&operation_id, "pipeline", "started", &source.display().to_string());
        info!(operation = %operation_id, source = %source.display(), "pipeline started");

        let base_ctx = StageContext {
            store: self.store.clone(),
            config: Arc::clone(&self.config),
            oracle: Arc::clone(&self.oracle),
            monitor: monitor.clone(),
            operation_id: operation_id.clone(),
            operation_cancel: self.cancel.clone(),
            attempt_cancel: CancelFlag::default(),
        };

        let mut current_session = options.input_session.clone();
        if !options.enable_stage_a {
            run.original_session_id = current_session.clone();
        }
        let mut failure: Option<String> = None;
        let mut cancelled = false;

        for stage_id in enabled {
            run.transition(PipelineState::running(stage_id));
            let source_input = match stage_id {
                StageId::Ingest => Some(StageSource::LogFile(source.to_path_buf())),
                _ => current_session.clone().map(StageSource::Session),
            };
            let mut result = StageResult::begin(
                stage_id,
                source_input.as_ref().map(StageSource::describe),
            );
            if let Some(m) = &monitor {
                m.start_stage(&operation_id, stage_id.label(), None);
            }
            self.audit(&operation_id, stage_id.label(), "started", &result.input.clone().unwrap_or_default());

            let outcome = match source_input {
                None => Err(anyhow::Error::from(PrebakeError::MissingInputSession {
                    stage: stage_id.label(),
                })),
                Some(_) if self.cancel.is_cancelled() => Err(PrebakeError::Cancelled.into()),
                Some(source) => {
                    let input = StageInput {
                        source,
                        instruction: options.instruction(stage_id).map(str::to_owned),
                    };
                    self.run_stage(stage_id, &base_ctx, &input, options, &mut run, &mut result)
                }
            };
            result.finish();

            match outcome {
                Ok(output_session) => {
                    result.success = true;
                    if stage_id == StageId::Ingest {
                        run.original_session_id = result
                            .metadata
                            .get("source_session_id")
                            .and_then(Value::as_str)
                            .map(str::to_owned);
                    }
                    let message = format!(
                        "{} -> {} entries ({:.1}% reduction)",
                        result.entries_processed,
                        result.entries_output,
                        result.reduction_ratio * 100.0
                    );
                    if let Some(m) = &monitor {
                        m.complete_stage(&operation_id, stage_id.label(), &message);
                    }
                    self.audit(&operation_id, stage_id.label(), "completed", &message);
                    info!(operation = %operation_id, stage = stage_id.label(), session = %output_session, "{message}");
                    current_session = Some(output_session);
                    run.stage_results.push(result);
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    result.error = Some(message.clone());
                    if let Some(m) = &monitor {
                        m.fail_stage(&operation_id, stage_id.label(), &message);
                    }
                    self.audit(&operation_id, stage_id.label(), "failed", &message);
                    error!(operation = %operation_id, stage = stage_id.label(), "stage failed: {message}");
                    run.stage_results.push(result);
                    failure = Some(message);
                    cancelled = matches!(find_prebake_error(&err), Some(PrebakeError::Cancelled));
                    break;
                }
            }
        }

        match &failure {
            None => {
                if let Some(m) = &monitor {
                    m.complete_operation(&operation_id);
                }
                self.audit(&operation_id, "pipeline", "completed", "all enabled stages succeeded");
            }
            Some(message) => {
                if let Some(m) = &monitor {
                    if cancelled {
                        m.cancel_operation(&operation_id, message);
                    } else {
                        m.fail_operation(&operation_id, message);
                    }
                }
                self.audit(&operation_id, "pipeline", "failed", message);
            }
        }
        let result = run.into_result(failure);
        info!(
            operation = %result.operation_id,
            success = result.success,
            duration_ms = result.total_duration_ms,
            reduction = result.overall_reduction_ratio,
            "pipeline finished"
        );
        result
    }

    /// Runs one stage to completion. Returns the accepted output session id.
    fn run_stage(
        &self,
        stage_id: StageId,
        base_ctx: &StageContext,
        input: &StageInput,
        options: &PipelineOptions,
        run: &mut Run,
        result: &mut StageResult,
    ) -> Result<String> {
        let stage = Arc::clone(&self.stages[stage_id.index()]);
        let timeout = options.stage_timeouts[stage_id.index()];
        let base_delay_ms = duration_millis(options.retry_base_delay);
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=options.max_retries {
            if attempt > 0 {
                let delay = backoff_delay_ms(attempt - 1, base_delay_ms);
                result.backoff_ms.push(delay);
                result.retry_attempts += 1;
                let reason = last_error
                    .as_ref()
                    .map(|e| format!("{e:#}"))
                    .unwrap_or_default();
                warn!(stage = stage_id.label(), attempt, delay_ms = delay, "retrying after: {reason}");
                base_ctx.warn(stage_id, &format!("retry {attempt} in {delay}ms after: {reason}"));
                if !self.sleep_unless_cancelled(Duration::from_millis(delay)) {
                    return Err(PrebakeError::Cancelled.into());
                }
                run.transition(PipelineState::running(stage_id));
            }
            result.attempts += 1;
            match self.attempt(&stage, stage_id, base_ctx, input, timeout, false, options, run, result) {
                Ok(session) => return Ok(session),
                Err(AttemptFailure::Fatal(err)) => return Err(err),
                Err(AttemptFailure::Retryable(err)) => last_error = Some(err),
            }
        }

        let last_error = last_error.unwrap_or_else(|| anyhow!("{} made no attempts", stage_id.label()));
        if !options.enable_error_recovery {
            return Err(last_error);
        }

        warn!(stage = stage_id.label(), "retries exhausted; running recovery");
        base_ctx.warn(stage_id, "retries exhausted; running recovery");
        result.recovery_used = true;
        run.transition(PipelineState::running(stage_id));
        match self.attempt(&stage, stage_id, base_ctx, input, timeout, true, options, run, result) {
            Ok(session) => Ok(session),
            Err(AttemptFailure::Fatal(err)) | Err(AttemptFailure::Retryable(err)) => Err(err.context(
                format!("{} recovery failed after: {last_error:#}", stage_id.label()),
            )),
        }
    }

    /// One timed attempt plus its checkpoint.
    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        stage: &Arc<dyn Stage>,
        stage_id: StageId,
        base_ctx: &StageContext,
        input: &StageInput,
        timeout: Duration,
        recovery: bool,
        options: &PipelineOptions,
        run: &mut Run,
        result: &mut StageResult,
    ) -> std::result::Result<String, AttemptFailure> {
        let output = match self.run_with_timeout(stage, stage_id, base_ctx, input, timeout, recovery) {
            Ok(output) => output,
            Err(err) => {
                let retryable = find_prebake_error(&err).is_none_or(PrebakeError::is_retryable);
                return Err(if retryable {
                    AttemptFailure::Retryable(err)
                } else {
                    AttemptFailure::Fatal(err)
                });
            }
        };

        let session_id = output.artifact.session_id.clone();
        if options.validate_between_stages {
            run.transition(PipelineState::checkpoint(stage_id));
            let checkpoint = run_checkpoint(
                &self.store,
                stage_id.label(),
                &session_id,
                Some(output.artifact.sha256.as_str()),
                &output.quality_metrics,
                &self.config.pipeline,
            );
            let passed = checkpoint.passed();
            let issues = checkpoint.issues.clone();
            // Keep only the latest checkpoint per stage.
            run.checkpoints.retain(|c| c.stage != stage_id.label());
            run.checkpoints.push(checkpoint);
            if !passed {
                self.audit(&run.operation_id, stage_id.label(), "checkpoint-failed", &issues.join("; "));
                return Err(AttemptFailure::Retryable(
                    PrebakeError::CheckpointFailed {
                        stage: stage_id.label(),
                        issues,
                    }
                    .into(),
                ));
            }
            for issue in &issues {
                base_ctx.warn(stage_id, issue);
            }
        }
        result.absorb(output);
        Ok(session_id)
    }

    /// Runs the stage on a worker thread and gives up once `timeout` passes,
    /// raising the attempt's cancel flag so the worker stops at its next record
    /// and waiting briefly for it to wind down.
    fn run_with_timeout(
        &self,
        stage: &Arc<dyn Stage>,
        stage_id: StageId,
        base_ctx: &StageContext,
        input: &StageInput,
        timeout: Duration,
        recovery: bool,
    ) -> Result<StageOutput> {
        let mut ctx = base_ctx.clone();
        ctx.attempt_cancel = CancelFlag::default();
        let attempt_cancel = ctx.attempt_cancel.clone();
        let worker_stage = Arc::clone(stage);
        let worker_input = input.clone();
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(format!("prebake-{}", stage_id.label()))
            .spawn(move || {
                let outcome = if recovery {
                    worker_stage.recover(&ctx, &worker_input)
                } else {
                    worker_stage.run(&ctx, &worker_input)
                };
                let _ = tx.send(outcome);
            })
            .context("failed to spawn stage worker")?;

        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                attempt_cancel.cancel();
                self.drain_worker(stage_id, &rx, worker);
                Err(PrebakeError::StageTimeout {
                    stage: stage_id.label(),
                    timeout_ms: duration_millis(timeout),
                }
                .into())
            }
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!(
                "{} worker stopped without a result",
                stage_id.label()
            )),
        }
    }

    /// Waits for a cancelled worker so it cannot write once the run has moved
    /// on. Output it managed to commit anyway is discarded.
    fn drain_worker(
        &self,
        stage_id: StageId,
        rx: &mpsc::Receiver<Result<StageOutput>>,
        worker: thread::JoinHandle<()>,
    ) {
        match rx.recv_timeout(WORKER_GRACE) {
            Ok(Ok(late)) => {
                warn!(
                    stage = stage_id.label(),
                    session = %late.artifact.session_id,
                    "discarding output committed after timeout"
                );
                if let Err(err) = self.store.discard(&late.artifact.session_id) {
                    warn!(stage = stage_id.label(), "discard failed: {err:#}");
                }
            }
            Ok(Err(_)) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    stage = stage_id.label(),
                    grace_ms = duration_millis(WORKER_GRACE),
                    "stage worker still busy after cancel; detaching"
                );
                return;
            }
        }
        if worker.join().is_err() {
            warn!(stage = stage_id.label(), "stage worker panicked");
        }
    }

    /// Sleeps for `delay`; returns false if the run was cancelled meanwhile.
    fn sleep_unless_cancelled(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        MAX_BACKOFF_MS, Orchestrator, PipelineOptions, PipelineState, backoff_delay_ms,
        overall_reduction, StageResult,
    };
    use crate::prebake::config::PrebakeConfig;
    use crate::prebake::entry::{ContentBlock, ConversationEntry, EntryKind};
    use crate::prebake::oracle::{Oracle, OracleReply};
    use crate::prebake::stages::{
        RetentionStage, Stage, StageContext, StageId, StageInput, StageOutput,
    };
    use crate::prebake::store::ArtifactStore;
    use anyhow::{Result, bail};
    use serde_json::json;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn uuid(n: u32) -> String {
        format!("00000000-0000-4000-8000-{n:012}")
    }

    fn write_source(dir: &Path) -> PathBuf {
        let entries = vec![
            ConversationEntry::new(uuid(1), None, EntryKind::User, vec![ContentBlock::text("Add retries to the fetcher")], "2025-01-01T00:00:01Z", "src"),
            ConversationEntry::new(uuid(2), Some(&uuid(1)), EntryKind::Assistant, vec![ContentBlock::tool_use("t1", "Read", json!({"file_path": "fetch.rs"}))], "2025-01-01T00:00:02Z", "src"),
            ConversationEntry::new(uuid(3), Some(&uuid(2)), EntryKind::User, vec![ContentBlock::tool_result("t1", "fn fetch() {}")], "2025-01-01T00:00:03Z", "src"),
            ConversationEntry::new(uuid(4), Some(&uuid(3)), EntryKind::Assistant, vec![ContentBlock::text("Retries now back off exponentially.")], "2025-01-01T00:00:04Z", "src"),
        ];
        let body: Vec<String> = entries
            .iter()
            .map(|e| serde_json::to_string(e).expect("serialize"))
            .collect();
        let path = dir.join("source.jsonl");
        fs::write(&path, body.join("\n") + "\n").expect("write source");
        path
    }

    fn orchestrator(dir: &Path) -> Orchestrator {
        Orchestrator::new(ArtifactStore::new(dir.join("sessions")), PrebakeConfig::default())
    }

    fn fast_options() -> PipelineOptions {
        PipelineOptions {
            retry_base_delay: Duration::from_millis(5),
            enable_progress_reporting: false,
            ..PipelineOptions::default()
        }
    }

    struct Flaky {
        failures_left: AtomicUsize,
    }

    impl Stage for Flaky {
        fn id(&self) -> StageId {
            StageId::Retention
        }

        fn run(&self, ctx: &StageContext, input: &StageInput) -> Result<StageOutput> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("transient oracle outage");
            }
            RetentionStage.run(ctx, input)
        }

        fn recover(&self, ctx: &StageContext, input: &StageInput) -> Result<StageOutput> {
            RetentionStage.recover(ctx, input)
        }
    }

    struct Hanging;

    impl Stage for Hanging {
        fn id(&self) -> StageId {
            StageId::Retention
        }

        fn run(&self, ctx: &StageContext, _input: &StageInput) -> Result<StageOutput> {
            loop {
                ctx.check_cancelled()?;
                thread::sleep(Duration::from_millis(5));
            }
        }

        fn recover(&self, ctx: &StageContext, input: &StageInput) -> Result<StageOutput> {
            RetentionStage.recover(ctx, input)
        }
    }

    /// Answers KEEP, but only after a long pause on one entry.
    struct SlowOn {
        uuid: String,
        pause: Duration,
    }

    impl Oracle for SlowOn {
        fn label(&self) -> &str {
            "slow"
        }

        fn complete(&self, instruction: &str) -> OracleReply {
            if instruction.contains(&self.uuid) {
                thread::sleep(self.pause);
            }
            OracleReply::ok("KEEP")
        }
    }

    fn artifact_count(dir: &Path) -> usize {
        fs::read_dir(dir.join("sessions"))
            .expect("sessions dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
            .count()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay_ms(0, 500), 500);
        assert_eq!(backoff_delay_ms(1, 500), 1000);
        assert_eq!(backoff_delay_ms(3, 500), 4000);
        assert_eq!(backoff_delay_ms(20, 500), MAX_BACKOFF_MS);
        assert_eq!(backoff_delay_ms(200, 500), MAX_BACKOFF_MS);
    }

    #[test]
    fn state_machine_moves_forward_or_fails() {
        assert!(PipelineState::Idle.allows(PipelineState::RunningStageA));
        assert!(PipelineState::Idle.allows(PipelineState::RunningStageC));
        assert!(PipelineState::CheckpointB.allows(PipelineState::RunningStageB));
        assert!(PipelineState::RunningStageB.allows(PipelineState::Failed));
        assert!(!PipelineState::CheckpointB.allows(PipelineState::RunningStageA));
        assert!(!PipelineState::Done.allows(PipelineState::Failed));
        assert!(!PipelineState::Failed.allows(PipelineState::RunningStageA));
    }

    #[test]
    fn full_run_walks_every_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_source(dir.path());
        let result = orchestrator(dir.path()).execute(&source, &fast_options());

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(
            result.states,
            vec![
                PipelineState::Idle,
                PipelineState::RunningStageA,
                PipelineState::CheckpointA,
                PipelineState::RunningStageB,
                PipelineState::CheckpointB,
                PipelineState::RunningStageC,
                PipelineState::CheckpointC,
                PipelineState::Done,
            ]
        );
        assert_eq!(result.checkpoints.len(), 3);
        assert_eq!(result.original_session_id.as_deref(), Some("src"));
        assert_eq!(result.metadata.lines_ingested, 4);
        assert_eq!(result.metadata.stages_succeeded, vec!["stage-a", "stage-b", "stage-c"]);
        let final_id = result.final_session_id.expect("final session");
        assert!(ArtifactStore::new(dir.path().join("sessions")).exists(&final_id));
        // The short tool result stays as the parent of the closing reply.
        assert_eq!(result.overall_reduction_ratio, 0.0);
    }

    #[test]
    fn flaky_stage_succeeds_on_third_attempt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_source(dir.path());
        let orch = orchestrator(dir.path()).with_stage(Arc::new(Flaky {
            failures_left: AtomicUsize::new(2),
        }));
        let options = PipelineOptions {
            max_retries: 3,
            ..fast_options()
        };
        let result = orch.execute(&source, &options);

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.metadata.retry_attempts, 2);
        let b = result.stage(StageId::Retention).expect("stage b");
        assert_eq!(b.attempts, 3);
        assert_eq!(b.retry_attempts, 2);
        assert!(!b.recovery_used);
        assert_eq!(b.backoff_ms.len(), 2);
        assert!(b.backoff_ms[1] > b.backoff_ms[0]);
    }

    #[test]
    fn exhausted_retries_fall_back_to_recovery() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_source(dir.path());
        let orch = orchestrator(dir.path()).with_stage(Arc::new(Flaky {
            failures_left: AtomicUsize::new(10),
        }));
        let options = PipelineOptions {
            max_retries: 1,
            ..fast_options()
        };
        let result = orch.execute(&source, &options);

        assert!(result.success, "error: {:?}", result.error);
        let b = result.stage(StageId::Retention).expect("stage b");
        assert!(b.recovery_used);
        assert_eq!(b.metadata["recovery_strategy"], "simple-filtering");
        assert_eq!(result.metadata.recovery_attempts, 1);
    }

    #[test]
    fn failure_without_recovery_keeps_earlier_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_source(dir.path());
        let orch = orchestrator(dir.path()).with_stage(Arc::new(Flaky {
            failures_left: AtomicUsize::new(10),
        }));
        let options = PipelineOptions {
            max_retries: 0,
            enable_error_recovery: false,
            ..fast_options()
        };
        let result = orch.execute(&source, &options);

        assert!(!result.success);
        assert_eq!(result.state(), PipelineState::Failed);
        assert!(result.final_session_id.is_none());
        let a = result.stage(StageId::Ingest).expect("stage a");
        assert!(a.success);
        assert!(a.output_session_id.is_some());
        assert_eq!(result.metadata.stages_failed, vec!["stage-b"]);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("transient oracle outage")));
    }

    #[test]
    fn hanging_stage_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_source(dir.path());
        let orch = orchestrator(dir.path()).with_stage(Arc::new(Hanging));
        let options = PipelineOptions {
            max_retries: 0,
            enable_error_recovery: false,
            stage_timeouts: [Duration::from_secs(5), Duration::from_millis(100), Duration::from_secs(5)],
            ..fast_options()
        };
        let result = orch.execute(&source, &options);
        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("timed out")));

        let orch = orchestrator(dir.path()).with_stage(Arc::new(Hanging));
        let options = PipelineOptions {
            max_retries: 0,
            stage_timeouts: [Duration::from_secs(5), Duration::from_millis(100), Duration::from_secs(5)],
            ..fast_options()
        };
        let result = orch.execute(&source, &options);
        assert!(result.success, "error: {:?}", result.error);
        assert!(result.stage(StageId::Retention).is_some_and(|b| b.recovery_used));
    }

    #[test]
    fn timed_out_stage_leaves_no_artifact_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_source(dir.path());
        let orch = orchestrator(dir.path()).with_oracle(Arc::new(SlowOn {
            uuid: uuid(4),
            pause: Duration::from_millis(400),
        }));
        let options = PipelineOptions {
            max_retries: 0,
            enable_error_recovery: false,
            stage_timeouts: [Duration::from_secs(5), Duration::from_millis(150), Duration::from_secs(5)],
            ..fast_options()
        };
        let result = orch.execute(&source, &options);
        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("timed out")));

        // Only stage A's artifact, both now and once the slow call is long done.
        assert_eq!(artifact_count(dir.path()), 1);
        thread::sleep(Duration::from_millis(600));
        assert_eq!(artifact_count(dir.path()), 1);
    }

    #[test]
    fn stage_c_without_input_is_fatal_and_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_source(dir.path());
        let orch = orchestrator(dir.path());
        let options = PipelineOptions {
            enable_stage_a: false,
            enable_stage_b: false,
            ..fast_options()
        };
        let result = orch.execute(&source, &options);

        assert!(!result.success);
        let error = result.error.clone().unwrap_or_default();
        assert!(error.contains("stage-c has no input session"), "{error}");
        let c = result.stage(StageId::Condensation).expect("stage c");
        assert!(!c.success);
        assert_eq!(c.attempts, 0);
        assert!(c.output_session_id.is_none());
        let artifacts = fs::read_dir(dir.path().join("sessions"))
            .expect("sessions dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
            .count();
        assert_eq!(artifacts, 0);
    }

    #[test]
    fn explicit_input_session_feeds_later_stage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_source(dir.path());
        let first = orchestrator(dir.path()).execute(
            &source,
            &PipelineOptions {
                enable_stage_b: false,
                enable_stage_c: false,
                ..fast_options()
            },
        );
        let ingested = first.final_session_id.expect("stage a output");

        let second = orchestrator(dir.path()).execute(
            &source,
            &PipelineOptions {
                enable_stage_a: false,
                input_session: Some(ingested.clone()),
                ..fast_options()
            },
        );
        assert!(second.success, "error: {:?}", second.error);
        assert_eq!(second.original_session_id.as_deref(), Some(ingested.as_str()));
        assert_eq!(second.stage_results.len(), 2);
    }

    #[test]
    fn cancelled_orchestrator_stops_before_work() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_source(dir.path());
        let orch = orchestrator(dir.path());
        orch.cancel_handle().cancel();
        let result = orch.execute(&source, &fast_options());
        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("cancelled")));
        assert_eq!(result.stage_results.len(), 1);
    }

    #[test]
    fn held_lock_rejects_second_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_source(dir.path());
        let orch = orchestrator(dir.path());
        let _held = orch.store().lock().expect("lock");
        let result = orch.execute(&source, &fast_options());
        assert!(!result.success);
        assert!(result.stage_results.is_empty());
        assert!(result.error.as_deref().is_some_and(|e| e.contains("store lock")));
    }

    #[test]
    fn overall_reduction_uses_first_input_and_last_output() {
        let mut a = StageResult::begin(StageId::Ingest, None);
        a.success = true;
        a.entries_processed = 10;
        a.entries_output = 8;
        let mut b = StageResult::begin(StageId::Retention, None);
        b.success = true;
        b.entries_processed = 8;
        b.entries_output = 4;
        assert!((overall_reduction(&[a, b]) - 0.6).abs() < 1e-9);
        assert_eq!(overall_reduction(&[]), 0.0);
    }
}
