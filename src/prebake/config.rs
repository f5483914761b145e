use crate::prebake::classify::ContentKind;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

include!(concat!(env!("OUT_DIR"), "/prebake_env_allowlist.rs"));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub stage_a_timeout_secs: u64,
    pub stage_b_timeout_secs: u64,
    pub stage_c_timeout_secs: u64,
    pub validate_between_stages: bool,
    pub error_recovery: bool,
    pub progress_reporting: bool,
    pub timestamp_tolerance_secs: u64,
    pub min_overall_quality: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay_ms: 500,
            stage_a_timeout_secs: 300,
            stage_b_timeout_secs: 600,
            stage_c_timeout_secs: 300,
            validate_between_stages: true,
            error_recovery: true,
            progress_reporting: true,
            timestamp_tolerance_secs: 300,
            min_overall_quality: 0.8,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeouts(&self) -> [Duration; 3] {
        [
            Duration::from_secs(self.stage_a_timeout_secs),
            Duration::from_secs(self.stage_b_timeout_secs),
            Duration::from_secs(self.stage_c_timeout_secs),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub max_line_bytes: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: crate::prebake::reader::DEFAULT_MAX_LINE_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub min_text_chars: usize,
    pub confirmation_max_chars: usize,
    pub significant_tools: Vec<String>,
    pub confirmation_phrases: Vec<String>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            min_text_chars: 10,
            confirmation_max_chars: 200,
            significant_tools: ["Read", "Glob", "Grep", "Write", "Edit", "WebSearch"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            confirmation_phrases: ["modified successfully", "proceed with", "continue to use"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeRatios {
    pub code: f64,
    pub logs: f64,
    pub documents: f64,
    pub transcripts: f64,
}

impl Default for TypeRatios {
    fn default() -> Self {
        Self {
            code: 0.2,
            logs: 0.1,
            documents: 0.3,
            transcripts: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeThresholds {
    pub code: usize,
    pub logs: usize,
    pub documents: usize,
    pub transcripts: usize,
    pub data: usize,
    pub unknown: usize,
}

impl Default for SizeThresholds {
    fn default() -> Self {
        Self {
            code: 800,
            logs: 400,
            documents: 1000,
            transcripts: 600,
            data: 300,
            unknown: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CondenseConfig {
    pub default_ratio: f64,
    pub max_content_size: usize,
    pub quality_threshold: f64,
    pub adaptive_ratios: bool,
    pub min_accuracy_confidence: f64,
    pub ratios: TypeRatios,
    pub thresholds: SizeThresholds,
}

impl Default for CondenseConfig {
    fn default() -> Self {
        Self {
            default_ratio: 0.3,
            max_content_size: 10_000,
            quality_threshold: 0.8,
            adaptive_ratios: true,
            min_accuracy_confidence: 0.8,
            ratios: TypeRatios::default(),
            thresholds: SizeThresholds::default(),
        }
    }
}

impl CondenseConfig {
    pub fn base_ratio(&self, kind: ContentKind) -> f64 {
        match kind {
            ContentKind::Code => self.ratios.code,
            ContentKind::Logs => self.ratios.logs,
            ContentKind::Documents => self.ratios.documents,
            ContentKind::Transcripts => self.ratios.transcripts,
            ContentKind::Data | ContentKind::Unknown => self.default_ratio,
        }
    }

    pub fn size_threshold(&self, kind: ContentKind) -> usize {
        match kind {
            ContentKind::Code => self.thresholds.code,
            ContentKind::Logs => self.thresholds.logs,
            ContentKind::Documents => self.thresholds.documents,
            ContentKind::Transcripts => self.thresholds.transcripts,
            ContentKind::Data => self.thresholds.data,
            ContentKind::Unknown => self.thresholds.unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub update_interval_ms: u64,
    pub max_event_history: usize,
    pub retention_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 1000,
            max_event_history: 1000,
            retention_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrebakeConfig {
    pub pipeline: PipelineConfig,
    pub reader: ReaderConfig,
    pub evaluator: EvaluatorConfig,
    pub condense: CondenseConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPrebakeConfig {
    pipeline: Option<PipelineConfig>,
    reader: Option<ReaderConfig>,
    evaluator: Option<EvaluatorConfig>,
    condense: Option<CondenseConfig>,
    monitor: Option<MonitorConfig>,
}

fn env_or_f64(var: &str, fallback: f64) -> f64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env::var(var) {
        Ok(v) => v.trim().parse::<usize>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

fn check_ratio(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(anyhow!("invalid {name}: require 0 < value <= 1.0"));
    }
    Ok(())
}

pub fn validate(cfg: &PrebakeConfig) -> Result<()> {
    if cfg.pipeline.stage_a_timeout_secs == 0
        || cfg.pipeline.stage_b_timeout_secs == 0
        || cfg.pipeline.stage_c_timeout_secs == 0
    {
        return Err(anyhow!("invalid stage timeout: must be >= 1 second"));
    }
    check_ratio("min overall quality", cfg.pipeline.min_overall_quality)?;
    if cfg.reader.max_line_bytes == 0 {
        return Err(anyhow!("invalid reader max line bytes: must be >= 1"));
    }
    if cfg.evaluator.significant_tools.is_empty() {
        return Err(anyhow!("invalid evaluator significant tools: cannot be empty"));
    }
    let c = &cfg.condense;
    check_ratio("default condensation ratio", c.default_ratio)?;
    check_ratio("code ratio", c.ratios.code)?;
    check_ratio("logs ratio", c.ratios.logs)?;
    check_ratio("documents ratio", c.ratios.documents)?;
    check_ratio("transcripts ratio", c.ratios.transcripts)?;
    check_ratio("quality threshold", c.quality_threshold)?;
    check_ratio("min accuracy confidence", c.min_accuracy_confidence)?;
    if c.max_content_size == 0 {
        return Err(anyhow!("invalid max content size: must be >= 1"));
    }
    if cfg.monitor.update_interval_ms == 0 {
        return Err(anyhow!("invalid monitor update interval: must be >= 1ms"));
    }
    if cfg.monitor.max_event_history == 0 {
        return Err(anyhow!("invalid monitor event history: must be >= 1"));
    }
    Ok(())
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("PREBAKE_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".prebake").join("prebake.toml"))
}

fn merge_toml(base: &mut PrebakeConfig, raw: &str, origin: &Path) -> Result<()> {
    let parsed: PartialPrebakeConfig = toml::from_str(raw)
        .map_err(|err| anyhow!("failed to parse prebake config {}: {err}", origin.display()))?;
    if let Some(pipeline) = parsed.pipeline {
        base.pipeline = pipeline;
    }
    if let Some(reader) = parsed.reader {
        base.reader = reader;
    }
    if let Some(evaluator) = parsed.evaluator {
        base.evaluator = evaluator;
    }
    if let Some(condense) = parsed.condense {
        base.condense = condense;
    }
    if let Some(monitor) = parsed.monitor {
        base.monitor = monitor;
    }
    Ok(())
}

fn merge_file_config(base: &mut PrebakeConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(&path)?;
    merge_toml(base, &raw, &path)
}

fn apply_env_overrides(cfg: &mut PrebakeConfig) {
    let p = &mut cfg.pipeline;
    p.max_retries = env_or_u64("PREBAKE_MAX_RETRIES", u64::from(p.max_retries))
        .try_into()
        .unwrap_or(p.max_retries);
    p.retry_base_delay_ms = env_or_u64("PREBAKE_RETRY_BASE_DELAY_MS", p.retry_base_delay_ms);
    p.stage_a_timeout_secs = env_or_u64("PREBAKE_STAGE_A_TIMEOUT_SECS", p.stage_a_timeout_secs);
    p.stage_b_timeout_secs = env_or_u64("PREBAKE_STAGE_B_TIMEOUT_SECS", p.stage_b_timeout_secs);
    p.stage_c_timeout_secs = env_or_u64("PREBAKE_STAGE_C_TIMEOUT_SECS", p.stage_c_timeout_secs);
    p.validate_between_stages =
        env_or_bool("PREBAKE_VALIDATE_BETWEEN_STAGES", p.validate_between_stages);
    p.error_recovery = env_or_bool("PREBAKE_ERROR_RECOVERY", p.error_recovery);
    p.progress_reporting = env_or_bool("PREBAKE_PROGRESS_REPORTING", p.progress_reporting);
    p.timestamp_tolerance_secs =
        env_or_u64("PREBAKE_TIMESTAMP_TOLERANCE_SECS", p.timestamp_tolerance_secs);
    p.min_overall_quality = env_or_f64("PREBAKE_MIN_OVERALL_QUALITY", p.min_overall_quality);

    cfg.reader.max_line_bytes = env_or_usize("PREBAKE_MAX_LINE_BYTES", cfg.reader.max_line_bytes);

    let e = &mut cfg.evaluator;
    e.min_text_chars = env_or_usize("PREBAKE_MIN_TEXT_CHARS", e.min_text_chars);
    e.confirmation_max_chars =
        env_or_usize("PREBAKE_CONFIRMATION_MAX_CHARS", e.confirmation_max_chars);
    e.significant_tools = env_or_csv("PREBAKE_SIGNIFICANT_TOOLS", &e.significant_tools);

    let c = &mut cfg.condense;
    c.default_ratio = env_or_f64("PREBAKE_DEFAULT_RATIO", c.default_ratio);
    c.max_content_size = env_or_usize("PREBAKE_MAX_CONTENT_SIZE", c.max_content_size);
    c.quality_threshold = env_or_f64("PREBAKE_QUALITY_THRESHOLD", c.quality_threshold);
    c.adaptive_ratios = env_or_bool("PREBAKE_ADAPTIVE_RATIOS", c.adaptive_ratios);
    c.min_accuracy_confidence =
        env_or_f64("PREBAKE_MIN_ACCURACY_CONFIDENCE", c.min_accuracy_confidence);

    let m = &mut cfg.monitor;
    m.update_interval_ms = env_or_u64("PREBAKE_UPDATE_INTERVAL_MS", m.update_interval_ms);
    m.max_event_history = env_or_usize("PREBAKE_MAX_EVENT_HISTORY", m.max_event_history);
    m.retention_secs = env_or_u64("PREBAKE_RETENTION_SECS", m.retention_secs);
}

/// `PREBAKE_*` variables in the environment that nothing reads.
pub fn unknown_env_keys() -> Vec<String> {
    env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("PREBAKE_"))
        .filter(|key| !GENERATED_PREBAKE_ENV_ALLOWLIST.contains(&key.as_str()))
        .collect()
}

pub fn load_config() -> Result<PrebakeConfig> {
    let mut cfg = PrebakeConfig::default();
    merge_file_config(&mut cfg)?;
    apply_env_overrides(&mut cfg);
    for key in unknown_env_keys() {
        warn!(key = %key, "ignoring unknown PREBAKE variable");
    }
    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::{GENERATED_PREBAKE_ENV_ALLOWLIST, PrebakeConfig, merge_toml, validate};
    use crate::prebake::classify::ContentKind;
    use std::path::Path;

    #[test]
    fn defaults_validate() {
        validate(&PrebakeConfig::default()).expect("defaults are valid");
    }

    #[test]
    fn toml_sections_replace_defaults_field_by_field() {
        let mut cfg = PrebakeConfig::default();
        let raw = "[pipeline]\nmax_retries = 5\n\n[condense.ratios]\ncode = 0.5\n";
        merge_toml(&mut cfg, raw, Path::new("inline.toml")).expect("merge");
        assert_eq!(cfg.pipeline.max_retries, 5);
        assert_eq!(cfg.pipeline.stage_b_timeout_secs, 600);
        assert_eq!(cfg.condense.base_ratio(ContentKind::Code), 0.5);
        assert_eq!(cfg.condense.base_ratio(ContentKind::Logs), 0.1);
    }

    #[test]
    fn out_of_range_ratio_is_rejected() {
        let mut cfg = PrebakeConfig::default();
        cfg.condense.quality_threshold = 1.5;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn generated_allowlist_knows_documented_keys() {
        assert!(GENERATED_PREBAKE_ENV_ALLOWLIST.contains(&"PREBAKE_MAX_RETRIES"));
        assert!(GENERATED_PREBAKE_ENV_ALLOWLIST.contains(&"PREBAKE_HOME"));
    }
}
