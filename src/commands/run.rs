use anyhow::{Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::commands::CommandReport;
use crate::prebake::config::load_config;
use crate::prebake::oracle::resolve_oracle;
use crate::prebake::orchestrator::{Orchestrator, PipelineOptions, PrebakeResult};
use crate::prebake::paths::resolve_paths;
use crate::prebake::progress::ProgressMonitor;
use crate::prebake::store::ArtifactStore;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub source: Option<PathBuf>,
    pub skip_ingest: bool,
    pub skip_retention: bool,
    pub skip_condense: bool,
    pub input_session: Option<String>,
    pub instruction_a: Option<String>,
    pub instruction_b: Option<String>,
    pub instruction_c: Option<String>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub no_validate: bool,
    pub no_recovery: bool,
    pub no_progress: bool,
}

/// Layers command-line flags over the configured pipeline defaults.
pub fn pipeline_options(opts: &RunOptions, base: PipelineOptions) -> PipelineOptions {
    let mut options = PipelineOptions {
        enable_stage_a: !opts.skip_ingest,
        enable_stage_b: !opts.skip_retention,
        enable_stage_c: !opts.skip_condense,
        input_session: opts.input_session.clone(),
        instruction_a: opts.instruction_a.clone(),
        instruction_b: opts.instruction_b.clone(),
        instruction_c: opts.instruction_c.clone(),
        ..base
    };
    if let Some(retries) = opts.max_retries {
        options.max_retries = retries;
    }
    if let Some(secs) = opts.timeout_secs {
        options = options.with_timeout(Duration::from_secs(secs));
    }
    if opts.no_validate {
        options.validate_between_stages = false;
    }
    if opts.no_recovery {
        options.enable_error_recovery = false;
    }
    if opts.no_progress {
        options.enable_progress_reporting = false;
    }
    options
}

pub fn to_command_report(result: &PrebakeResult) -> CommandReport {
    let mut report = CommandReport::new("run");
    report.detail(format!("operation_id={}", result.operation_id));
    if let Some(original) = &result.original_session_id {
        report.detail(format!("original_session_id={original}"));
    }
    for stage in &result.stage_results {
        let outcome = if stage.success { "ok" } else { "failed" };
        report.detail(format!(
            "{}: {outcome} {} -> {} ({:.1}% reduction, attempts={}, recovery={}) {}ms",
            stage.label,
            stage.entries_processed,
            stage.entries_output,
            stage.reduction_ratio * 100.0,
            stage.attempts,
            if stage.recovery_used { "yes" } else { "no" },
            stage.duration_ms
        ));
    }
    for checkpoint in &result.checkpoints {
        for issue in &checkpoint.issues {
            report.detail(format!("{} checkpoint: {issue}", checkpoint.stage));
        }
    }
    report.detail(format!(
        "overall_reduction={:.1}% quality={:.1}% duration={}ms",
        result.overall_reduction_ratio * 100.0,
        result.metadata.quality_scores.overall_quality * 100.0,
        result.total_duration_ms
    ));
    if let Some(final_id) = &result.final_session_id {
        report.detail(format!("final_session_id={final_id}"));
    }
    if let Some(err) = &result.error {
        report.issue(err.clone());
    }
    report
}

pub fn run(opts: &RunOptions) -> Result<PrebakeResult> {
    let source = opts.source.clone().unwrap_or_default();
    if !opts.skip_ingest && !source.is_file() {
        bail!("source log not found: {}", source.display());
    }
    if opts.skip_ingest && opts.input_session.is_none() && !(opts.skip_retention && opts.skip_condense) {
        warn!("stage-a skipped without --input-session; later stages have no input");
    }

    let paths = resolve_paths()?;
    let config = load_config()?;
    let options = pipeline_options(opts, PipelineOptions::from_config(&config.pipeline));
    let monitor = Arc::new(ProgressMonitor::new(config.monitor.clone()));
    if options.enable_progress_reporting
        && let Err(err) = monitor.start_sampler()
    {
        warn!("progress sampler unavailable: {err:#}");
    }

    let orchestrator = Orchestrator::new(ArtifactStore::from_paths(&paths), config)
        .with_oracle(resolve_oracle())
        .with_monitor(Arc::clone(&monitor))
        .with_audit_log(paths);
    let result = orchestrator.execute(&source, &options);

    if options.enable_progress_reporting
        && let Some(progress) = monitor.report(&result.operation_id)
    {
        info!("\n{progress}");
    }
    monitor.shutdown();
    Ok(result)
}
