use anyhow::Result;
use std::fs;
use std::path::Path;

use crate::commands::CommandReport;
use crate::prebake::config::{self, PrebakeConfig};
use crate::prebake::oracle::resolve_remote_config;
use crate::prebake::paths::resolve_paths;

fn count_artifacts(dir: &Path) -> usize {
    let Ok(read) = fs::read_dir(dir) else {
        return 0;
    };
    read.filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
        .count()
}

fn describe_config(cfg: &PrebakeConfig, report: &mut CommandReport) {
    let p = &cfg.pipeline;
    report.detail(format!(
        "pipeline: max_retries={} retry_base_delay_ms={} timeouts_secs={}/{}/{}",
        p.max_retries,
        p.retry_base_delay_ms,
        p.stage_a_timeout_secs,
        p.stage_b_timeout_secs,
        p.stage_c_timeout_secs
    ));
    report.detail(format!(
        "pipeline: validate_between_stages={} error_recovery={} progress_reporting={}",
        p.validate_between_stages, p.error_recovery, p.progress_reporting
    ));
    report.detail(format!(
        "condense: default_ratio={} quality_threshold={} adaptive_ratios={}",
        cfg.condense.default_ratio, cfg.condense.quality_threshold, cfg.condense.adaptive_ratios
    ));
}

pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("status");
    let paths = resolve_paths()?;
    report.detail(format!("prebake_home={}", paths.prebake_home.display()));
    report.detail(format!(
        "sessions_dir={} ({} artifacts)",
        paths.sessions_dir.display(),
        count_artifacts(&paths.sessions_dir)
    ));
    report.detail(format!("logs_dir={}", paths.logs_dir.display()));

    match config::resolve_config_path() {
        Some(path) if path.exists() => report.detail(format!("config={}", path.display())),
        Some(path) => report.detail(format!("config={} (absent, using defaults)", path.display())),
        None => report.detail("config=defaults"),
    }
    match config::load_config() {
        Ok(cfg) => describe_config(&cfg, &mut report),
        Err(err) => report.issue(format!("config invalid: {err:#}")),
    }

    match resolve_remote_config() {
        Some(remote) => report.detail(format!(
            "oracle={} model={}",
            remote.provider.label(),
            remote.model
        )),
        None => report.detail("oracle=local (rule fallbacks only)"),
    }

    for key in config::unknown_env_keys() {
        report.issue(format!("unknown environment variable {key}"));
    }

    Ok(report)
}
