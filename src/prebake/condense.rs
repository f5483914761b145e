use crate::prebake::accuracy::{AccuracyReport, CondensedRecord, validate_accuracy};
use crate::prebake::classify::{ContentKind, classify};
use crate::prebake::config::CondenseConfig;
use crate::prebake::oracle::{Oracle, strip_code_fence};
use crate::prebake::ratio::RatioController;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub is_valid: bool,
    pub quality_score: f64,
    pub preserved: Vec<String>,
    pub lost: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Condensation behaviour for one content kind.
pub struct Strategy {
    pub kind: ContentKind,
    pub condense: fn(&str, f64) -> String,
    pub validate: fn(&str, &str) -> QualityReport,
    /// Scores at or below this are rejected by `validate`.
    pub min_quality: f64,
}

const CODE_MIN_QUALITY: f64 = 0.8;
const LOGS_MIN_QUALITY: f64 = 0.9;
const DOCUMENTS_MIN_QUALITY: f64 = 0.85;
const TRANSCRIPTS_MIN_QUALITY: f64 = 0.95;

static STRATEGIES: [Strategy; 4] = [
    Strategy {
        kind: ContentKind::Code,
        condense: condense_code,
        validate: validate_code,
        min_quality: CODE_MIN_QUALITY,
    },
    Strategy {
        kind: ContentKind::Logs,
        condense: condense_logs,
        validate: validate_logs,
        min_quality: LOGS_MIN_QUALITY,
    },
    Strategy {
        kind: ContentKind::Documents,
        condense: condense_documents,
        validate: validate_documents,
        min_quality: DOCUMENTS_MIN_QUALITY,
    },
    Strategy {
        kind: ContentKind::Transcripts,
        condense: condense_transcripts,
        validate: validate_transcripts,
        min_quality: TRANSCRIPTS_MIN_QUALITY,
    },
];

pub fn strategy_for(kind: ContentKind) -> Option<&'static Strategy> {
    STRATEGIES.iter().find(|s| s.kind == kind)
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

pub fn target_len(len: usize, ratio: f64) -> usize {
    (len as f64 * (1.0 - ratio)).floor() as usize
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("condense pattern is valid"))
}

fn score(preserved: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        preserved as f64 / total as f64
    }
}

fn report(score: f64, min_quality: f64, preserved: Vec<String>, lost: Vec<String>) -> QualityReport {
    let is_valid = score > min_quality;
    let mut recommendations = Vec::new();
    if !is_valid {
        recommendations.push(format!(
            "quality {score:.2} is at or below {min_quality:.2}; use oracle-assisted condensation"
        ));
    }
    if !lost.is_empty() {
        recommendations.push("review lost elements before reuse".to_string());
    }
    QualityReport {
        is_valid,
        quality_score: score,
        preserved,
        lost,
        recommendations,
    }
}

fn join_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> String {
    lines.into_iter().collect::<Vec<_>>().join("\n")
}

// ---- code ----

const CODE_KEYWORDS: [&str; 10] = [
    "function", "class", "import", "export", "const", "let", "var", "def", "fn", "struct",
];

static BLOCK_COMMENT: OnceLock<Regex> = OnceLock::new();
static LINE_COMMENT: OnceLock<Regex> = OnceLock::new();
static HASH_COMMENT: OnceLock<Regex> = OnceLock::new();
static DEBUG_PRINT: OnceLock<Regex> = OnceLock::new();
static INNER_SPACES: OnceLock<Regex> = OnceLock::new();

fn keyword_counts(text: &str) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if let Some(kw) = CODE_KEYWORDS.iter().find(|kw| **kw == word) {
            *counts.entry(*kw).or_insert(0) += 1;
        }
    }
    counts
}

fn condense_code(content: &str, ratio: f64) -> String {
    let target = target_len(char_len(content), ratio);
    let no_blocks = regex(&BLOCK_COMMENT, r"/\*[\s\S]*?\*/").replace_all(content, "");
    let no_lines = regex(&LINE_COMMENT, r#"(?m)(^|[^:"'\\])//.*$"#).replace_all(&no_blocks, "$1");
    let no_hash = regex(&HASH_COMMENT, r"(?m)^[ \t]*# .*$").replace_all(&no_lines, "");

    let mut lines: Vec<&str> = no_hash
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();
    if char_len(&join_lines(lines.iter().copied())) <= target {
        return join_lines(lines);
    }

    let debug_print = regex(
        &DEBUG_PRINT,
        r"^\s*(console\.(log|debug|info)\(.*\)|println!\(.*\)|eprintln!\(.*\)|dbg!\(.*\)|print\(.*\));?\s*$",
    );
    lines.retain(|l| !debug_print.is_match(l));
    let condensed = join_lines(lines.iter().copied());
    if char_len(&condensed) <= target {
        return condensed;
    }

    let spaces = regex(&INNER_SPACES, r"[ \t]{2,}");
    lines
        .iter()
        .map(|l| spaces.replace_all(l.trim_start(), " ").into_owned())
        .collect::<Vec<_>>()
        .join("\n")
}

fn validate_code(original: &str, condensed: &str) -> QualityReport {
    let before = keyword_counts(original);
    let after = keyword_counts(condensed);
    let mut preserved = Vec::new();
    let mut lost = Vec::new();
    let mut kept_total = 0usize;
    let mut total = 0usize;
    for (kw, count) in &before {
        let now = after.get(kw).copied().unwrap_or(0);
        total += count;
        kept_total += now.min(*count);
        if now >= *count {
            preserved.push(format!("{kw} x{count}"));
        } else {
            lost.push(format!("{kw}: {count} -> {now}"));
        }
    }
    report(score(kept_total, total), CODE_MIN_QUALITY, preserved, lost)
}

// ---- logs ----

static SEVERITY: OnceLock<Regex> = OnceLock::new();
static LOG_TIMESTAMP: OnceLock<Regex> = OnceLock::new();
static DIGITS: OnceLock<Regex> = OnceLock::new();

fn is_severity_line(line: &str) -> bool {
    regex(&SEVERITY, r"(?i)\b(error|warn|warning|critical|fatal)\b").is_match(line)
}

fn normalize_log_line(line: &str) -> String {
    let ts = regex(
        &LOG_TIMESTAMP,
        r"\d{4}-\d{2}-\d{2}[T\s]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?",
    );
    let stamped = ts.replace_all(line.trim(), "TIMESTAMP");
    regex(&DIGITS, r"\d+")
        .replace_all(&stamped, "NUM")
        .into_owned()
}

fn condense_logs(content: &str, ratio: f64) -> String {
    let target = target_len(char_len(content), ratio);
    let mut seen = HashSet::new();
    let mut kept: Vec<(&str, bool)> = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if is_severity_line(line) {
            kept.push((line, true));
        } else if seen.insert(normalize_log_line(line)) {
            kept.push((line, false));
        }
    }

    let mut len = char_len(&join_lines(kept.iter().map(|(l, _)| *l)));
    while len > target {
        let Some(pos) = kept.iter().rposition(|(_, severe)| !severe) else {
            break;
        };
        let (removed, _) = kept.remove(pos);
        len = len.saturating_sub(char_len(removed) + 1);
    }
    join_lines(kept.into_iter().map(|(l, _)| l))
}

fn validate_logs(original: &str, condensed: &str) -> QualityReport {
    let mut remaining: BTreeMap<&str, usize> = BTreeMap::new();
    for line in condensed.lines().filter(|l| is_severity_line(l)) {
        *remaining.entry(line.trim()).or_insert(0) += 1;
    }
    let mut total = 0usize;
    let mut kept = 0usize;
    let mut lost = Vec::new();
    for line in original.lines().filter(|l| is_severity_line(l)) {
        total += 1;
        match remaining.get_mut(line.trim()) {
            Some(n) if *n > 0 => {
                *n -= 1;
                kept += 1;
            }
            _ => lost.push(line.trim().to_string()),
        }
    }
    let preserved = vec![format!("{kept}/{total} error and warning lines")];
    report(score(kept, total), LOGS_MIN_QUALITY, preserved, lost)
}

// ---- documents ----

static BLANK_RUNS: OnceLock<Regex> = OnceLock::new();
static HSPACE: OnceLock<Regex> = OnceLock::new();
static FENCED: OnceLock<Regex> = OnceLock::new();
static FOR_EXAMPLE: OnceLock<Regex> = OnceLock::new();
static HEADING: OnceLock<Regex> = OnceLock::new();

const CODE_PLACEHOLDER: &str = "```[code example removed]```";
const EXAMPLE_PLACEHOLDER: &str = "[example omitted].";

fn drop_repeated_words(line: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for word in line.split(' ') {
        let repeated = out.last().is_some_and(|prev| {
            !word.is_empty() && word.chars().any(char::is_alphabetic) && prev.eq_ignore_ascii_case(word)
        });
        if !repeated {
            out.push(word);
        }
    }
    out.join(" ")
}

fn shrink_matches(text: &str, re: &Regex, placeholder: &str) -> String {
    re.replace_all(text, |caps: &regex::Captures<'_>| {
        let matched = &caps[0];
        if char_len(matched) > char_len(placeholder) {
            placeholder.to_string()
        } else {
            matched.to_string()
        }
    })
    .into_owned()
}

fn condense_documents(content: &str, ratio: f64) -> String {
    let target = target_len(char_len(content), ratio);
    let collapsed = regex(&BLANK_RUNS, r"\n[ \t]*\n(?:[ \t]*\n)+").replace_all(content, "\n\n");
    let hspace = regex(&HSPACE, r"[ \t]{2,}");
    let tidy = collapsed
        .lines()
        .map(|l| drop_repeated_words(&hspace.replace_all(l.trim_end(), " ")))
        .collect::<Vec<_>>()
        .join("\n");
    if char_len(&tidy) <= target {
        return tidy;
    }

    let no_code = shrink_matches(&tidy, regex(&FENCED, r"```[\s\S]*?```"), CODE_PLACEHOLDER);
    shrink_matches(
        &no_code,
        regex(&FOR_EXAMPLE, r"(?i)\bfor example\b[^.\n]*\."),
        EXAMPLE_PLACEHOLDER,
    )
}

fn headings(text: &str) -> Vec<String> {
    let re = regex(&HEADING, r"(?m)^#{1,6}[ \t]+\S.*$");
    re.find_iter(text)
        .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
        .collect()
}

fn validate_documents(original: &str, condensed: &str) -> QualityReport {
    let before = headings(original);
    let after: HashSet<String> = headings(condensed).into_iter().collect();
    let (preserved, lost): (Vec<String>, Vec<String>) =
        before.into_iter().partition(|h| after.contains(h));
    let total = preserved.len() + lost.len();
    report(score(preserved.len(), total), DOCUMENTS_MIN_QUALITY, preserved, lost)
}

// ---- transcripts ----

static TOOL_MARKER: OnceLock<Regex> = OnceLock::new();
static ROLE_PREFIX: OnceLock<Regex> = OnceLock::new();
static DECISION: OnceLock<Regex> = OnceLock::new();
static ACTION: OnceLock<Regex> = OnceLock::new();

fn tool_marker_re() -> &'static Regex {
    regex(&TOOL_MARKER, r"\btool_use\b|\btool_result\b")
}

fn keep_transcript_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return false;
    }
    if tool_marker_re().is_match(line) {
        return true;
    }
    let role = regex(&ROLE_PREFIX, r"(?i)^(user|assistant|system|human)\s*:");
    let decision = regex(
        &DECISION,
        r"(?i)\b(decision|decided|important|error|success|successful|complete|completed)\b",
    );
    if role.is_match(trimmed) && decision.is_match(trimmed) {
        return true;
    }
    if ["> ", "Q:", "A:", "**", "#"]
        .iter()
        .any(|p| trimmed.starts_with(p))
    {
        return true;
    }
    regex(&ACTION, r"(?i)\b(implement|create|fix|update|change)\w*").is_match(trimmed)
}

fn condense_transcripts(content: &str, _ratio: f64) -> String {
    join_lines(content.lines().filter(|l| keep_transcript_line(l)))
}

fn validate_transcripts(original: &str, condensed: &str) -> QualityReport {
    let before = tool_marker_re().find_iter(original).count();
    let after = tool_marker_re().find_iter(condensed).count();
    let kept = after.min(before);
    let preserved = vec![format!("{kept}/{before} tool markers")];
    let lost = if kept < before {
        vec![format!("{} tool markers", before - kept)]
    } else {
        Vec::new()
    };
    report(score(kept, before), TRANSCRIPTS_MIN_QUALITY, preserved, lost)
}

// ---- pipeline over one block ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CondensePath {
    Skipped,
    Strategy,
    Oracle,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockOutcome {
    pub text: String,
    pub kind: ContentKind,
    pub path: CondensePath,
    pub original_chars: usize,
    pub output_chars: usize,
    pub target_ratio: f64,
    pub quality: f64,
    pub failure: Option<String>,
    pub accuracy: Option<AccuracyReport>,
}

pub fn oracle_condense_prompt(
    record: &CondensedRecord,
    kind: ContentKind,
    ratio: f64,
    instruction: Option<&str>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("CONTENT CONDENSATION WITH ABSOLUTE FACTUAL ACCURACY\n\n");
    prompt.push_str("Rules:\n");
    prompt.push_str("- Never add information that is not in the original.\n");
    prompt.push_str("- Copy every identifier, number, date, path and name verbatim.\n");
    prompt.push_str("- Remove only redundancy, filler and repetition.\n");
    prompt.push_str(&format!(
        "- Target roughly {:.0}% reduction in length; keep more if facts would be lost.\n",
        ratio * 100.0
    ));
    prompt.push_str("- Keep `uuid` and `timestamp` exactly as given.\n");
    if let Some(extra) = instruction.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("- Additional instruction: {extra}\n"));
    }
    prompt.push_str(&format!("\nContent type: {}\n", kind.label()));
    prompt.push_str(
        "Respond with only a JSON object of the form {\"uuid\": ..., \"timestamp\": ..., \"content\": ...}.\n\n",
    );
    prompt.push_str(&serde_json::to_string(record).unwrap_or_default());
    prompt
}

fn parse_oracle_record(reply: &str) -> Option<CondensedRecord> {
    serde_json::from_str(strip_code_fence(reply)).ok()
}

/// Runs classification, strategy and oracle fallback for single blocks.
pub struct Condenser<'a> {
    cfg: &'a CondenseConfig,
    ratios: RatioController,
    oracle: &'a dyn Oracle,
    instruction: Option<&'a str>,
}

impl<'a> Condenser<'a> {
    pub fn new(cfg: &'a CondenseConfig, oracle: &'a dyn Oracle, instruction: Option<&'a str>) -> Self {
        Self {
            cfg,
            ratios: RatioController::new(cfg.clone()),
            oracle,
            instruction,
        }
    }

    pub fn condense_block(&self, uuid: &str, timestamp: &str, text: &str) -> BlockOutcome {
        let original_chars = char_len(text);
        let classification = classify(text, self.cfg);
        let kind = classification.kind;
        let mut outcome = BlockOutcome {
            text: text.to_string(),
            kind,
            path: CondensePath::Skipped,
            original_chars,
            output_chars: original_chars,
            target_ratio: 0.0,
            quality: 1.0,
            failure: None,
            accuracy: None,
        };
        if !classification.is_condensable(original_chars) {
            return outcome;
        }

        let ratio = self.ratios.target_ratio(kind, original_chars);
        outcome.target_ratio = ratio;

        let fallback_reason = match strategy_for(kind) {
            Some(strategy) => {
                let candidate = (strategy.condense)(text, ratio);
                let quality = (strategy.validate)(text, &candidate);
                let candidate_chars = char_len(&candidate);
                let good_enough =
                    quality.is_valid && quality.quality_score >= self.cfg.quality_threshold;
                let short_enough = candidate_chars <= target_len(original_chars, ratio);
                if good_enough && short_enough {
                    debug!(uuid, kind = kind.label(), from = original_chars, to = candidate_chars, "strategy condensed block");
                    outcome.text = candidate;
                    outcome.output_chars = candidate_chars;
                    outcome.path = CondensePath::Strategy;
                    outcome.quality = quality.quality_score;
                    return outcome;
                }
                if good_enough {
                    format!(
                        "{} strategy missed target length ({candidate_chars} > {})",
                        kind.label(),
                        target_len(original_chars, ratio)
                    )
                } else {
                    format!("{} strategy quality below threshold", kind.label())
                }
            }
            None => format!("no strategy for {}", kind.label()),
        };
        debug!(uuid, reason = %fallback_reason, "falling back to oracle condensation");
        self.oracle_fallback(outcome, uuid, timestamp, text, &fallback_reason)
    }

    fn oracle_fallback(
        &self,
        mut outcome: BlockOutcome,
        uuid: &str,
        timestamp: &str,
        text: &str,
        reason: &str,
    ) -> BlockOutcome {
        let original = CondensedRecord {
            uuid: uuid.to_string(),
            timestamp: timestamp.to_string(),
            content: text.to_string(),
        };
        let prompt = oracle_condense_prompt(&original, outcome.kind, outcome.target_ratio, self.instruction);
        let reply = self.oracle.complete(&prompt);
        if !reply.success {
            outcome.path = CondensePath::RolledBack;
            outcome.failure = Some("oracle unavailable".to_string());
            debug!(uuid, after = %reason, "oracle declined; keeping original block");
            return outcome;
        }
        let Some(candidate) = parse_oracle_record(&reply.text) else {
            outcome.path = CondensePath::RolledBack;
            outcome.failure = Some("oracle reply was not a condensed record".to_string());
            warn!(uuid, "oracle reply could not be parsed; keeping original block");
            return outcome;
        };

        let accuracy = validate_accuracy(&original, &candidate, self.cfg.min_accuracy_confidence);
        if !accuracy.accepted {
            let why = if accuracy.metadata_intact {
                "accuracy validation failed"
            } else {
                "metadata mismatch"
            };
            warn!(uuid, issues = ?accuracy.issues, "rolled back oracle condensation");
            outcome.path = CondensePath::RolledBack;
            outcome.failure = Some(why.to_string());
            outcome.accuracy = Some(accuracy);
            return outcome;
        }

        outcome.output_chars = char_len(&candidate.content);
        outcome.text = candidate.content;
        outcome.path = CondensePath::Oracle;
        outcome.quality = accuracy.confidence;
        outcome.accuracy = Some(accuracy);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CODE_PLACEHOLDER, CondensePath, Condenser, condense_code, condense_documents,
        condense_logs, condense_transcripts, strategy_for, target_len, validate_code,
        validate_documents, validate_logs, validate_transcripts,
    };
    use crate::prebake::classify::ContentKind;
    use crate::prebake::config::CondenseConfig;
    use crate::prebake::oracle::{Oracle, OracleReply};
    use std::sync::Mutex;

    struct FixedOracle {
        reply: OracleReply,
        prompts: Mutex<Vec<String>>,
    }

    impl FixedOracle {
        fn new(reply: OracleReply) -> Self {
            Self {
                reply,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    impl Oracle for FixedOracle {
        fn label(&self) -> &str {
            "fixed"
        }

        fn complete(&self, instruction: &str) -> OracleReply {
            self.prompts
                .lock()
                .expect("prompt log")
                .push(instruction.to_string());
            self.reply.clone()
        }
    }

    /// Roughly 900 characters of code where comments carry most of the bulk.
    fn commented_code() -> String {
        let mut out = String::new();
        out.push_str("/* Module overview: this block explains the helper routines below in detail,\n");
        out.push_str("   covering inputs, outputs and the reasons behind each default value. */\n");
        for i in 0..6 {
            out.push_str(&format!("// helper number {i} adds two values and logs the outcome\n"));
            out.push_str(&format!("function add{i}(a, b) {{\n"));
            out.push_str("    console.log(a, b);\n");
            out.push_str("    return a + b;\n");
            out.push_str("}\n\n");
        }
        out
    }

    #[test]
    fn code_strategy_hits_target_and_keeps_declarations() {
        let code = commented_code();
        let len = code.chars().count();
        assert!((850..=1000).contains(&len), "fixture is {len} chars");
        let condensed = condense_code(&code, 0.2);
        assert!(condensed.chars().count() <= target_len(len, 0.2));
        let quality = validate_code(&code, &condensed);
        assert!(quality.is_valid);
        assert_eq!(quality.quality_score, 1.0);
        assert!(!condensed.contains("Module overview"));
    }

    /// Roughly 900 characters of code with nothing for the strategy to strip.
    fn dense_code() -> String {
        (0..20)
            .map(|i| format!("function add{i}(a, b) {{ return a + b + {i}; }}\n"))
            .collect()
    }

    #[test]
    fn dense_code_missing_target_is_not_accepted_from_strategy() {
        let code = dense_code();
        let len = code.chars().count();
        assert!((850..=1000).contains(&len), "fixture is {len} chars");
        let oracle = FixedOracle::new(OracleReply::failed("offline"));
        let cfg = CondenseConfig::default();
        let out = Condenser::new(&cfg, &oracle, None).condense_block("u1", "t", &code);

        assert_eq!(out.kind, ContentKind::Code);
        assert_eq!(out.path, CondensePath::RolledBack);
        assert_eq!(out.text, code);
        assert_eq!(out.failure.as_deref(), Some("oracle unavailable"));
        assert_eq!(oracle.prompts.lock().expect("prompts").len(), 1);
    }

    #[test]
    fn dense_code_is_condensed_to_target_by_faithful_oracle() {
        let code = dense_code();
        let content: Vec<String> = (0..20).map(|i| format!("add{i} = a + b + {i}")).collect();
        let reply = serde_json::json!({"uuid": "u1", "timestamp": "t", "content": content.join("\n")});
        let oracle = FixedOracle::new(OracleReply::ok(reply.to_string()));
        let cfg = CondenseConfig::default();
        let out = Condenser::new(&cfg, &oracle, None).condense_block("u1", "t", &code);

        assert_eq!(out.path, CondensePath::Oracle);
        assert!(out.output_chars <= target_len(out.original_chars, out.target_ratio));
        assert!(out.output_chars <= target_len(out.original_chars, 0.2));
        assert!(out.accuracy.as_ref().is_some_and(|a| a.accepted));
    }

    #[test]
    fn debug_prints_go_when_comments_are_not_enough() {
        let code = format!(
            "function f() {{\n{}    return 1;\n}}\n",
            "    console.log('value', 1);\n".repeat(20)
        );
        let condensed = condense_code(&code, 0.5);
        assert!(!condensed.contains("console.log"));
        assert!(condensed.contains("return 1;"));
        assert!(validate_code(&code, &condensed).is_valid);
    }

    #[test]
    fn code_quality_drops_when_declarations_vanish() {
        let quality = validate_code("function a() {}\nfunction b() {}\nclass C {}", "function a() {}");
        assert!(!quality.is_valid);
        assert!(!quality.lost.is_empty());
    }

    #[test]
    fn line_comment_removal_spares_urls() {
        let out = condense_code("let u = \"http://x.io\"; // trailing\n", 0.0);
        assert!(out.contains("http://x.io"));
        assert!(!out.contains("trailing"));
    }

    #[test]
    fn log_strategy_keeps_every_error_and_dedupes_noise() {
        let mut log = String::new();
        for i in 0..20 {
            log.push_str(&format!("2025-01-01 10:00:{i:02} INFO heartbeat {i}\n"));
        }
        log.push_str("2025-01-01 10:01:00 ERROR disk full on /dev/sda1\n");
        log.push_str("2025-01-01 10:01:01 WARN retrying write\n");
        let condensed = condense_logs(&log, 0.1);
        assert!(condensed.contains("ERROR disk full"));
        assert!(condensed.contains("WARN retrying"));
        assert_eq!(condensed.matches("heartbeat").count(), 1);
        let q = validate_logs(&log, &condensed);
        assert_eq!(q.quality_score, 1.0);
        assert!(q.is_valid);
    }

    #[test]
    fn document_strategy_keeps_headings_and_drops_examples_when_oversized() {
        let doc = format!(
            "# Guide\n\n\n\nIntro  text text here.\n\n## Setup\n```\n{}\n```\nFor example you could run the tool twice with different flags.\n",
            "step();\n".repeat(40)
        );
        let condensed = condense_documents(&doc, 0.3);
        assert!(condensed.contains(CODE_PLACEHOLDER));
        assert!(condensed.contains("[example omitted]."));
        assert!(condensed.contains("Intro text here."));
        let q = validate_documents(&doc, &condensed);
        assert!(q.is_valid);
        assert!(condensed.chars().count() < doc.chars().count());
    }

    #[test]
    fn transcript_strategy_keeps_tool_markers_and_decisions() {
        let t = "User: hi\nAssistant: hello there\nassistant: tool_use Read src/main.rs\nuser: tool_result ok\nUser: the decision is to ship\nAssistant: I will fix the parser\nrandom chatter\n";
        let condensed = condense_transcripts(t, 0.4);
        assert!(!condensed.contains("hello there"));
        assert!(!condensed.contains("random chatter"));
        assert!(condensed.contains("decision is to ship"));
        assert!(condensed.contains("fix the parser"));
        assert!(validate_transcripts(t, &condensed).is_valid);
    }

    #[test]
    fn registry_covers_four_kinds() {
        assert!(strategy_for(ContentKind::Code).is_some());
        assert!(strategy_for(ContentKind::Transcripts).is_some());
        assert!(strategy_for(ContentKind::Data).is_none());
        assert!(strategy_for(ContentKind::Unknown).is_none());
    }

    #[test]
    fn small_blocks_are_skipped() {
        let oracle = FixedOracle::new(OracleReply::failed("unused"));
        let cfg = CondenseConfig::default();
        let c = Condenser::new(&cfg, &oracle, None);
        let out = c.condense_block("u", "t", "tiny");
        assert_eq!(out.path, CondensePath::Skipped);
        assert!(oracle.prompts.lock().expect("prompts").is_empty());
    }

    #[test]
    fn low_quality_strategy_goes_to_oracle_and_rolls_back_lossy_reply() {
        // Every line is a comment holding a keyword, so stripping loses them all.
        let code = "// function one computes 1 + 2;\n".repeat(40);
        let reply = serde_json::json!({
            "uuid": "u1",
            "timestamp": "2025-01-01T00:00:00Z",
            "content": "// function one computes 1 + 2; (repeated) ".to_string()
        });
        let oracle = FixedOracle::new(OracleReply::ok(format!("```json\n{reply}\n```")));
        let cfg = CondenseConfig::default();
        let c = Condenser::new(&cfg, &oracle, Some("keep function names"));
        let out = c.condense_block("u1", "2025-01-01T00:00:00Z", &code);
        assert_eq!(out.kind, ContentKind::Code);
        // 80 numbers originally, two in the reply: rejected and rolled back.
        assert_eq!(out.path, CondensePath::RolledBack);
        assert_eq!(out.text, code);
        assert_eq!(out.failure.as_deref(), Some("accuracy validation failed"));
        let prompts = oracle.prompts.lock().expect("prompts");
        assert!(prompts[0].contains("ABSOLUTE FACTUAL ACCURACY"));
        assert!(prompts[0].contains("keep function names"));
    }

    #[test]
    fn oracle_reply_with_changed_uuid_is_rolled_back() {
        let text = "just prose without any structure at all. ".repeat(20);
        let reply = serde_json::json!({"uuid": "other", "timestamp": "t", "content": "prose"});
        let oracle = FixedOracle::new(OracleReply::ok(reply.to_string()));
        let cfg = CondenseConfig::default();
        let out = Condenser::new(&cfg, &oracle, None).condense_block("u1", "t", &text);
        assert_eq!(out.path, CondensePath::RolledBack);
        assert_eq!(out.failure.as_deref(), Some("metadata mismatch"));
        assert_eq!(out.text, text);
    }

    #[test]
    fn faithful_oracle_reply_is_accepted_for_unknown_content() {
        let text = "plain words about the release of version 3 today. ".repeat(12);
        let reply = serde_json::json!({
            "uuid": "u1",
            "timestamp": "t",
            "content": "Release of version 3 today (repeated)."
        });
        let oracle = FixedOracle::new(OracleReply::ok(reply.to_string()));
        let cfg = CondenseConfig::default();
        let out = Condenser::new(&cfg, &oracle, None).condense_block("u1", "t", &text);
        // 12 numbers in, 1 out: still rejected. Parity is strict.
        assert_eq!(out.path, CondensePath::RolledBack);

        let faithful = serde_json::json!({
            "uuid": "u1",
            "timestamp": "t",
            "content": "Release notes: version 3 3 3 3 3 3 3 3 3 3 3 3."
        });
        let oracle = FixedOracle::new(OracleReply::ok(faithful.to_string()));
        let out = Condenser::new(&cfg, &oracle, None).condense_block("u1", "t", &text);
        assert_eq!(out.path, CondensePath::Oracle);
        assert!(out.output_chars <= out.original_chars);
    }
}
