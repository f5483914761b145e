use crate::prebake::classify::ContentKind;
use crate::prebake::config::CondenseConfig;
use crate::prebake::util::reduction_ratio;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const MIN_RATIO: f64 = 0.05;
pub const MAX_RATIO: f64 = 0.8;
const LARGE_CONTENT_BOOST: f64 = 0.1;
const SMALL_CONTENT_EASE: f64 = 0.05;

/// Picks the reduction target for a block from its kind and size.
#[derive(Debug, Clone)]
pub struct RatioController {
    cfg: CondenseConfig,
}

impl RatioController {
    pub fn new(cfg: CondenseConfig) -> Self {
        Self { cfg }
    }

    pub fn target_ratio(&self, kind: ContentKind, size: usize) -> f64 {
        let mut ratio = self.cfg.base_ratio(kind);
        if self.cfg.adaptive_ratios {
            let max = self.cfg.max_content_size as f64;
            let size = size as f64;
            if size > max * 2.0 {
                ratio += LARGE_CONTENT_BOOST;
            } else if size < max * 0.5 {
                ratio -= SMALL_CONTENT_EASE;
            }
        }
        ratio.clamp(MIN_RATIO, MAX_RATIO)
    }
}

fn running_avg(avg: f64, value: f64, n: usize) -> f64 {
    if n == 0 {
        return value;
    }
    avg + (value - avg) / n as f64
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindStats {
    pub processed: usize,
    pub attempted: usize,
    pub condensed: usize,
    pub target_ratio: f64,
    pub actual_ratio: f64,
    pub average_quality: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CondensationMetrics {
    pub total_blocks: usize,
    pub skipped: usize,
    pub attempts: usize,
    pub successes: usize,
    pub rollbacks: usize,
    pub original_chars: usize,
    pub output_chars: usize,
    pub target_ratio_sum: f64,
    pub by_kind: BTreeMap<ContentKind, KindStats>,
    pub failure_reasons: BTreeMap<String, usize>,
}

impl CondensationMetrics {
    pub fn record_skipped(&mut self, kind: ContentKind, chars: usize) {
        self.total_blocks += 1;
        self.skipped += 1;
        self.original_chars += chars;
        self.output_chars += chars;
        self.by_kind.entry(kind).or_default().processed += 1;
    }

    fn record_attempt(&mut self, kind: ContentKind, target: f64, original: usize) -> &mut KindStats {
        self.total_blocks += 1;
        self.attempts += 1;
        self.original_chars += original;
        self.target_ratio_sum += target;
        let stats = self.by_kind.entry(kind).or_default();
        stats.processed += 1;
        stats.attempted += 1;
        stats.target_ratio = running_avg(stats.target_ratio, target, stats.attempted);
        stats
    }

    pub fn record_success(
        &mut self,
        kind: ContentKind,
        target: f64,
        original: usize,
        condensed: usize,
        quality: f64,
    ) {
        let stats = self.record_attempt(kind, target, original);
        stats.condensed += 1;
        let n = stats.condensed;
        stats.actual_ratio = running_avg(stats.actual_ratio, reduction_ratio(original, condensed), n);
        stats.average_quality = running_avg(stats.average_quality, quality, n);
        self.successes += 1;
        self.output_chars += condensed;
    }

    pub fn record_failure(&mut self, kind: ContentKind, target: f64, original: usize, reason: &str) {
        self.record_attempt(kind, target, original);
        self.rollbacks += 1;
        self.output_chars += original;
        *self.failure_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }

    pub fn overall_target_ratio(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.target_ratio_sum / self.attempts as f64
    }

    pub fn overall_actual_ratio(&self) -> f64 {
        reduction_ratio(self.original_chars, self.output_chars)
    }

    /// Achieved reduction as a fraction of the targeted reduction.
    pub fn ratio_achievement(&self) -> f64 {
        let target = self.overall_target_ratio();
        if target <= 0.0 {
            return 0.0;
        }
        self.overall_actual_ratio() / target
    }

    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== CONDENSATION METRICS REPORT ===");
        let _ = writeln!(out, "Total blocks: {}", self.total_blocks);
        let _ = writeln!(out, "Skipped (below threshold): {}", self.skipped);
        let _ = writeln!(
            out,
            "Condensation attempts: {} (succeeded {}, rolled back {})",
            self.attempts, self.successes, self.rollbacks
        );
        let _ = writeln!(out, "Success rate: {:.1}%", self.success_rate() * 100.0);
        let _ = writeln!(
            out,
            "Characters: {} -> {}",
            self.original_chars, self.output_chars
        );
        let _ = writeln!(
            out,
            "Target ratio: {:.1}% | Actual ratio: {:.1}% | Achievement: {:.1}%",
            self.overall_target_ratio() * 100.0,
            self.overall_actual_ratio() * 100.0,
            self.ratio_achievement() * 100.0
        );
        if !self.by_kind.is_empty() {
            let _ = writeln!(out, "\nBy content type:");
            for (kind, s) in &self.by_kind {
                let _ = writeln!(
                    out,
                    "  {}: processed={} condensed={} target={:.1}% actual={:.1}% quality={:.2}",
                    kind.label(),
                    s.processed,
                    s.condensed,
                    s.target_ratio * 100.0,
                    s.actual_ratio * 100.0,
                    s.average_quality
                );
            }
        }
        if !self.failure_reasons.is_empty() {
            let _ = writeln!(out, "\nFailure reasons:");
            for (reason, count) in &self.failure_reasons {
                let _ = writeln!(out, "  {reason}: {count}");
            }
        }
        out
    }
}
