use crate::prebake::config::CondenseConfig;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Code,
    Logs,
    Documents,
    Transcripts,
    Data,
    Unknown,
}

impl ContentKind {
    /// Scored kinds in tie-break order.
    pub const SCORED: [ContentKind; 5] = [
        ContentKind::Code,
        ContentKind::Logs,
        ContentKind::Documents,
        ContentKind::Transcripts,
        ContentKind::Data,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ContentKind::Code => "code",
            ContentKind::Logs => "logs",
            ContentKind::Documents => "documents",
            ContentKind::Transcripts => "transcripts",
            ContentKind::Data => "data",
            ContentKind::Unknown => "unknown",
        }
    }

    fn characteristic(self) -> &'static str {
        match self {
            ContentKind::Code => "code-like syntax",
            ContentKind::Logs => "timestamp patterns",
            ContentKind::Documents => "markdown formatting",
            ContentKind::Transcripts => "conversation structure",
            ContentKind::Data => "structured data",
            ContentKind::Unknown => "unrecognised content",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub kind: ContentKind,
    pub confidence: f64,
    pub characteristics: Vec<String>,
    pub size_threshold: usize,
    pub priority: Priority,
    pub reasoning: String,
    pub scores: BTreeMap<ContentKind, usize>,
}

impl Classification {
    pub fn is_condensable(&self, len: usize) -> bool {
        len > self.size_threshold
    }
}

static PATTERNS: OnceLock<Vec<(ContentKind, Vec<Regex>)>> = OnceLock::new();

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("classifier pattern is valid"))
        .collect()
}

fn patterns() -> &'static [(ContentKind, Vec<Regex>)] {
    PATTERNS.get_or_init(|| {
        vec![
            (
                ContentKind::Code,
                compile(&[
                    r"\b(function|class|import|export|const|let|var)\b",
                    r"[{}();]",
                    r"(?m)//.*$",
                    r"/\*[\s\S]*?\*/",
                    r"<[^>]+>",
                    r"\b(def|if|for|while|return|print)\b",
                ]),
            ),
            (
                ContentKind::Logs,
                compile(&[
                    r"\d{4}-\d{2}-\d{2}[T\s]\d{2}:\d{2}:\d{2}",
                    r"\b(ERROR|WARN|INFO|DEBUG|TRACE)\b",
                    r"\b(Stack trace|Exception)\b|at\s+[\w.]+\(\w+\.java:\d+\)",
                    r"\[\d{4}-\d{2}-\d{2}\s\d{2}:\d{2}:\d{2}\]",
                ]),
            ),
            (
                ContentKind::Documents,
                compile(&[
                    r"(?m)^#+\s",
                    r"\*\*[^*]+\*\*",
                    r"\[[^\]]+\]\([^)]+\)",
                    r"```[\s\S]*?```",
                    r"(?m)^[-*+]\s",
                ]),
            ),
            (
                ContentKind::Transcripts,
                compile(&[
                    r"(?i)\b(user|assistant|system):\s",
                    r"Q:\s.*?\nA:\s",
                    r"(?m)^>\s",
                    r"\btool_use\b|\btool_result\b",
                ]),
            ),
            (
                ContentKind::Data,
                compile(&[
                    r"(?m)^\s*[{\[]",
                    r"(?m)[}\]]\s*$",
                    r#""[^"]*":\s*[^,}\]]+"#,
                    r"\b\d+\.\d+\b",
                    r"<\w+[^>]*>[\s\S]*?</\w+>",
                ]),
            ),
        ]
    })
}

fn size_characteristic(len: usize) -> Option<&'static str> {
    if len > 10_000 {
        Some("very large")
    } else if len > 5_000 {
        Some("large")
    } else if len > 2_000 {
        Some("medium")
    } else {
        None
    }
}

pub fn classify(text: &str, cfg: &CondenseConfig) -> Classification {
    let len = text.chars().count();
    let mut scores = BTreeMap::new();
    for (kind, regexes) in patterns() {
        let count: usize = regexes.iter().map(|re| re.find_iter(text).count()).sum();
        scores.insert(*kind, count);
    }

    let mut kind = ContentKind::Unknown;
    let mut best = 0usize;
    for candidate in ContentKind::SCORED {
        let score = scores.get(&candidate).copied().unwrap_or(0);
        if score > best {
            best = score;
            kind = candidate;
        }
    }

    let confidence = if len == 0 || best == 0 {
        0.0
    } else {
        (best as f64 / (len as f64 / 100.0)).min(1.0)
    };

    let mut characteristics: Vec<String> = ContentKind::SCORED
        .iter()
        .filter(|k| scores.get(k).copied().unwrap_or(0) > 0)
        .map(|k| k.characteristic().to_string())
        .collect();
    if let Some(size) = size_characteristic(len) {
        characteristics.push(size.to_string());
    }

    let size_threshold = cfg.size_threshold(kind);
    let priority = if len > size_threshold.saturating_mul(2) {
        Priority::High
    } else if len > size_threshold {
        Priority::Medium
    } else {
        Priority::Low
    };
    let reasoning = format!(
        "{} content ({:.0}% confidence, {} chars vs threshold {}): {}",
        kind.label(),
        confidence * 100.0,
        len,
        size_threshold,
        if characteristics.is_empty() {
            "no distinctive features".to_string()
        } else {
            characteristics.join(", ")
        }
    );

    Classification {
        kind,
        confidence,
        characteristics,
        size_threshold,
        priority,
        reasoning,
        scores,
    }
}
