use crate::prebake::config::EvaluatorConfig;
use crate::prebake::entry::{ContentBlock, ConversationEntry, EntryKind};
use crate::prebake::oracle::Oracle;
use crate::prebake::util::truncate_with_ellipsis;
use serde::Serialize;
use tracing::debug;

const PROMPT_PREVIEW_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Keep,
    Remove,
}

impl Decision {
    pub fn is_keep(self) -> bool {
        self == Decision::Keep
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationSource {
    Oracle,
    Rules,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub decision: Decision,
    pub source: EvaluationSource,
}

/// A tool result that only acknowledges the previous call.
pub fn is_tool_confirmation(entry: &ConversationEntry, cfg: &EvaluatorConfig) -> bool {
    entry.content().iter().any(|block| {
        let ContentBlock::ToolResult { .. } = block else {
            return false;
        };
        let Some(payload) = block.text_payload() else {
            return false;
        };
        payload.chars().count() < cfg.confirmation_max_chars
            || cfg
                .confirmation_phrases
                .iter()
                .any(|phrase| payload.contains(phrase.as_str()))
    })
}

fn has_substantive_text(entry: &ConversationEntry, min_chars: usize) -> bool {
    entry.content().iter().any(|block| match block {
        ContentBlock::Text { text, .. } => text.chars().count() > min_chars,
        _ => false,
    })
}

fn uses_significant_tool(entry: &ConversationEntry, cfg: &EvaluatorConfig) -> bool {
    entry
        .tool_names()
        .any(|name| cfg.significant_tools.iter().any(|tool| tool == name))
}

/// Deterministic keep/remove rules used whenever the oracle gives no usable answer.
pub fn rule_decision(entry: &ConversationEntry, cfg: &EvaluatorConfig) -> Decision {
    let keep = match entry.kind {
        EntryKind::System => true,
        EntryKind::User | EntryKind::ToolResult => !is_tool_confirmation(entry, cfg),
        EntryKind::Assistant => {
            has_substantive_text(entry, cfg.min_text_chars) || uses_significant_tool(entry, cfg)
        }
    };
    if keep { Decision::Keep } else { Decision::Remove }
}

pub fn evaluation_prompt(index: usize, entry: &ConversationEntry, instruction: Option<&str>) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Evaluate this conversation line and decide whether it should be kept or removed when condensing the session.\n\n",
    );
    prompt.push_str("KEEP: essential information, decisions, code changes, substantive analysis.\n");
    prompt.push_str("REMOVE: tool confirmations, redundant replies, empty messages, verbose logs.\n\n");
    if let Some(extra) = instruction.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("Additional instruction: {extra}\n\n"));
    }
    prompt.push_str(&format!("Line: {index}\n"));
    prompt.push_str(&format!("Type: {}\n", entry.kind.label()));
    prompt.push_str(&format!("UUID: {}\n", entry.uuid));
    prompt.push_str(&format!("Timestamp: {}\n", entry.timestamp));
    prompt.push_str(&format!(
        "Content: {}\n\n",
        truncate_with_ellipsis(&entry.text(), PROMPT_PREVIEW_CHARS)
    ));
    prompt.push_str("Respond with exactly \"KEEP\" or \"REMOVE\" and nothing else.");
    prompt
}

/// Accepts a bare `KEEP`/`REMOVE` token, ignoring case, quotes and trailing periods.
pub fn parse_decision(reply: &str) -> Option<Decision> {
    let token = reply
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.' || c.is_whitespace());
    if token.eq_ignore_ascii_case("keep") {
        Some(Decision::Keep)
    } else if token.eq_ignore_ascii_case("remove") {
        Some(Decision::Remove)
    } else {
        None
    }
}

pub struct Evaluator<'a> {
    oracle: &'a dyn Oracle,
    cfg: &'a EvaluatorConfig,
    instruction: Option<&'a str>,
}

impl<'a> Evaluator<'a> {
    pub fn new(oracle: &'a dyn Oracle, cfg: &'a EvaluatorConfig, instruction: Option<&'a str>) -> Self {
        Self {
            oracle,
            cfg,
            instruction,
        }
    }

    pub fn evaluate(&self, index: usize, entry: &ConversationEntry) -> Evaluation {
        let reply = self
            .oracle
            .complete(&evaluation_prompt(index, entry, self.instruction));
        if reply.success
            && let Some(decision) = parse_decision(&reply.text)
        {
            return Evaluation {
                decision,
                source: EvaluationSource::Oracle,
            };
        }
        debug!(
            index,
            uuid = %entry.uuid,
            oracle = self.oracle.label(),
            reply = %truncate_with_ellipsis(&reply.text, 80),
            "oracle gave no decision; using rules"
        );
        Evaluation {
            decision: rule_decision(entry, self.cfg),
            source: EvaluationSource::Rules,
        }
    }
}
