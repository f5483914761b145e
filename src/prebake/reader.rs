use crate::prebake::entry::{ContentBlock, ConversationEntry};
use crate::prebake::util::truncate_with_ellipsis;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

pub const INCOMPLETE_NOTE: &str = "\n[NOTE: This tool result may be incomplete]";
const PREVIEW_CHARS: usize = 100;
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

static UUID_RE: OnceLock<Regex> = OnceLock::new();

fn uuid_re() -> &'static Regex {
    UUID_RE.get_or_init(|| {
        Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
            .expect("uuid regex is valid")
    })
}

pub fn is_valid_uuid(raw: &str) -> bool {
    uuid_re().is_match(raw)
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Run brace pre-validation before handing a line to the JSON parser.
    pub strict: bool,
    pub max_line_bytes: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            strict: true,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl ReaderOptions {
    pub fn lenient() -> Self {
        Self {
            strict: false,
            ..Self::default()
        }
    }

    /// For artifacts the store wrote itself. Every line was serialised by
    /// serde and already passed ingest limits, so neither screen applies.
    pub fn artifact() -> Self {
        Self {
            strict: false,
            max_line_bytes: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadSummary {
    pub total_lines: usize,
    pub blank_lines: usize,
    pub valid: usize,
    pub malformed: usize,
    pub repaired_uuids: usize,
    pub cleared_parents: usize,
    pub incomplete_tool_results: usize,
    pub io_error: Option<String>,
}

impl ReadSummary {
    pub fn success_rate(&self) -> f64 {
        if self.total_lines == 0 {
            return 0.0;
        }
        self.valid as f64 / self.total_lines as f64
    }
}

/// Repairs applied to a single parsed entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryRepairs {
    pub replaced_uuid: Option<String>,
    pub cleared_parent: Option<String>,
    pub incomplete_blocks: usize,
}

/// Cheap structural screen run before the JSON parser.
pub fn prevalidate_line(trimmed: &str) -> Result<(), &'static str> {
    if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
        return Err("line is not a single JSON object");
    }
    if trimmed.contains("}{") {
        return Err("line holds concatenated objects");
    }
    let opens = trimmed.matches('{').count();
    let closes = trimmed.matches('}').count();
    if opens != closes {
        return Err("unbalanced braces");
    }
    Ok(())
}

/// The brace test only sees a dangling `{` when the whole line still balances
/// or was read leniently; strict pre-validation rejects it otherwise.
fn looks_incomplete(text: &str) -> bool {
    let trimmed = text.trim_end();
    trimmed.ends_with("...")
        || trimmed.ends_with('…')
        || trimmed.contains("[truncated]")
        || trimmed.matches('{').count() > trimmed.matches('}').count()
}

fn annotate_incomplete(block: &mut ContentBlock) -> bool {
    let ContentBlock::ToolResult {
        content,
        is_incomplete,
        ..
    } = block
    else {
        return false;
    };
    if *is_incomplete {
        return false;
    }
    match content {
        Value::String(text) if looks_incomplete(text) => {
            text.push_str(INCOMPLETE_NOTE);
        }
        Value::Array(parts) => {
            let Some(last_text) = parts
                .iter_mut()
                .rev()
                .filter_map(|p| p.get_mut("text"))
                .find(|t| t.is_string())
            else {
                return false;
            };
            let Some(text) = last_text
                .as_str()
                .filter(|t| looks_incomplete(t))
                .map(str::to_owned)
            else {
                return false;
            };
            *last_text = Value::String(format!("{text}{INCOMPLETE_NOTE}"));
        }
        _ => return false,
    }
    *is_incomplete = true;
    true
}

/// Fixes known defects in a parsed entry: malformed ids and truncated tool payloads.
pub fn repair_entry(entry: &mut ConversationEntry) -> EntryRepairs {
    let mut repairs = EntryRepairs::default();
    if !is_valid_uuid(&entry.uuid) {
        let replacement = uuid::Uuid::new_v4().to_string();
        repairs.replaced_uuid = Some(std::mem::replace(&mut entry.uuid, replacement));
    }
    if let Some(parent) = entry.parent_uuid.as_deref()
        && !is_valid_uuid(parent)
    {
        repairs.cleared_parent = entry.parent_uuid.take();
    }
    for block in entry.content_mut() {
        if annotate_incomplete(block) {
            repairs.incomplete_blocks += 1;
        }
    }
    repairs
}

/// Forward-only reader over a session log. Holds one line at a time and
/// releases the file as soon as the stream ends.
pub struct LogReader {
    path: PathBuf,
    lines: Option<Lines<BufReader<File>>>,
    line_no: usize,
    options: ReaderOptions,
    summary: ReadSummary,
}

impl LogReader {
    pub fn open(path: &Path, options: ReaderOptions) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: Some(BufReader::new(file).lines()),
            line_no: 0,
            options,
            summary: ReadSummary::default(),
        })
    }

    pub fn summary(&self) -> &ReadSummary {
        &self.summary
    }

    pub fn is_finished(&self) -> bool {
        self.lines.is_none()
    }

    /// Drains the rest of the stream and returns the final summary.
    pub fn finish(mut self) -> ReadSummary {
        while self.next().is_some() {}
        self.summary
    }

    fn malformed(&mut self, reason: &str, line: &str) {
        self.summary.malformed += 1;
        warn!(
            path = %self.path.display(),
            line = self.line_no,
            reason,
            preview = %truncate_with_ellipsis(line, PREVIEW_CHARS),
            "skipping malformed log line"
        );
    }

    fn end_stream(&mut self) {
        self.lines = None;
        let s = &self.summary;
        info!(
            path = %self.path.display(),
            total = s.total_lines,
            valid = s.valid,
            malformed = s.malformed,
            success_rate = s.success_rate(),
            "log read complete"
        );
    }

    fn parse_line(&mut self, raw: &str) -> Option<ConversationEntry> {
        let trimmed = raw.trim();
        if trimmed.len() > self.options.max_line_bytes {
            self.malformed("line exceeds size limit", trimmed);
            return None;
        }
        if self.options.strict
            && let Err(reason) = prevalidate_line(trimmed)
        {
            self.malformed(reason, trimmed);
            return None;
        }
        let mut entry: ConversationEntry = match serde_json::from_str(trimmed) {
            Ok(entry) => entry,
            Err(err) => {
                self.malformed(&err.to_string(), trimmed);
                return None;
            }
        };

        let repairs = repair_entry(&mut entry);
        if let Some(old) = repairs.replaced_uuid {
            self.summary.repaired_uuids += 1;
            warn!(line = self.line_no, old = %old, new = %entry.uuid, "replaced invalid uuid");
        }
        if let Some(old) = repairs.cleared_parent {
            self.summary.cleared_parents += 1;
            warn!(line = self.line_no, parent = %old, "cleared invalid parentUuid");
        }
        if repairs.incomplete_blocks > 0 {
            self.summary.incomplete_tool_results += repairs.incomplete_blocks;
            debug!(line = self.line_no, uuid = %entry.uuid, "annotated incomplete tool result");
        }
        self.summary.valid += 1;
        Some(entry)
    }
}

impl Iterator for LogReader {
    type Item = ConversationEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next_line = self.lines.as_mut()?.next();
            let raw = match next_line {
                None => {
                    self.end_stream();
                    return None;
                }
                Some(Err(err)) => {
                    self.summary.io_error = Some(err.to_string());
                    warn!(path = %self.path.display(), line = self.line_no + 1, "read error: {err}");
                    self.end_stream();
                    return None;
                }
                Some(Ok(raw)) => raw,
            };
            self.line_no += 1;
            if raw.trim().is_empty() {
                self.summary.blank_lines += 1;
                continue;
            }
            self.summary.total_lines += 1;
            if let Some(entry) = self.parse_line(&raw) {
                return Some(entry);
            }
        }
    }
}
