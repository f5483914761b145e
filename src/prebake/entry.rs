use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    User,
    Assistant,
    ToolResult,
    System,
}

impl EntryKind {
    pub fn label(self) -> &'static str {
        match self {
            EntryKind::User => "user",
            EntryKind::Assistant => "assistant",
            EntryKind::ToolResult => "tool_result",
            EntryKind::System => "system",
        }
    }
}

/// One block of an entry's message content. Unknown block types are kept
/// verbatim in `Other` so they survive every stage untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
        extra: Map<String, Value>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        extra: Map<String, Value>,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_incomplete: bool,
        extra: Map<String, Value>,
    },
    Other(Value),
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            map.insert(key.to_string(), other);
            None
        }
        None => None,
    }
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text {
            text: text.into(),
            extra: Map::new(),
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
            extra: Map::new(),
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: Value::String(content.into()),
            is_incomplete: false,
            extra: Map::new(),
        }
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Ok(ContentBlock::Other(value));
        };
        let kind = map.get("type").and_then(Value::as_str).map(str::to_owned);
        match kind.as_deref() {
            Some("text") => {
                map.remove("type");
                let text = take_string(&mut map, "text")
                    .ok_or_else(|| "text block without a string `text` field".to_string())?;
                Ok(ContentBlock::Text { text, extra: map })
            }
            Some("tool_use") => {
                map.remove("type");
                let name = take_string(&mut map, "name")
                    .ok_or_else(|| "tool_use block without a `name` field".to_string())?;
                let id = take_string(&mut map, "id").unwrap_or_default();
                let input = map.remove("input").unwrap_or(Value::Null);
                Ok(ContentBlock::ToolUse {
                    id,
                    name,
                    input,
                    extra: map,
                })
            }
            Some("tool_result") => {
                map.remove("type");
                let tool_use_id = take_string(&mut map, "tool_use_id").unwrap_or_default();
                let content = map.remove("content").unwrap_or(Value::Null);
                let is_incomplete = map
                    .remove("is_incomplete")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                Ok(ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_incomplete,
                    extra: map,
                })
            }
            _ => Ok(ContentBlock::Other(Value::Object(map))),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            ContentBlock::Text { text, extra } => {
                let mut map = Map::new();
                map.insert("type".into(), Value::String("text".into()));
                map.insert("text".into(), Value::String(text.clone()));
                map.extend(extra.clone());
                Value::Object(map)
            }
            ContentBlock::ToolUse {
                id,
                name,
                input,
                extra,
            } => {
                let mut map = Map::new();
                map.insert("type".into(), Value::String("tool_use".into()));
                map.insert("id".into(), Value::String(id.clone()));
                map.insert("name".into(), Value::String(name.clone()));
                map.insert("input".into(), input.clone());
                map.extend(extra.clone());
                Value::Object(map)
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_incomplete,
                extra,
            } => {
                let mut map = Map::new();
                map.insert("type".into(), Value::String("tool_result".into()));
                map.insert("tool_use_id".into(), Value::String(tool_use_id.clone()));
                map.insert("content".into(), content.clone());
                if *is_incomplete {
                    map.insert("is_incomplete".into(), Value::Bool(true));
                }
                map.extend(extra.clone());
                Value::Object(map)
            }
            ContentBlock::Other(value) => value.clone(),
        }
    }

    /// Textual payload of a text block or a textual tool result.
    pub fn text_payload(&self) -> Option<String> {
        match self {
            ContentBlock::Text { text, .. } => Some(text.clone()),
            ContentBlock::ToolResult { content, .. } => tool_result_text(content),
            _ => None,
        }
    }

    /// Replaces the textual payload in place, keeping the block's shape.
    /// Returns false for blocks that carry no text.
    pub fn replace_text_payload(&mut self, replacement: String) -> bool {
        match self {
            ContentBlock::Text { text, .. } => {
                *text = replacement;
                true
            }
            ContentBlock::ToolResult { content, .. } => match content {
                Value::String(s) => {
                    *s = replacement;
                    true
                }
                Value::Array(parts) => {
                    let Some(first) = parts.iter().position(is_text_part) else {
                        return false;
                    };
                    parts[first]["text"] = Value::String(replacement);
                    let mut index = 0;
                    parts.retain(|p| {
                        let keep = index <= first || !is_text_part(p);
                        index += 1;
                        keep
                    });
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }
}

fn is_text_part(part: &Value) -> bool {
    part.get("type").and_then(Value::as_str) == Some("text")
        && part.get("text").and_then(Value::as_str).is_some()
}

fn tool_result_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let chunks: Vec<&str> = parts
                .iter()
                .filter(|p| is_text_part(p))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if chunks.is_empty() {
                None
            } else {
                Some(chunks.join("\n"))
            }
        }
        _ => None,
    }
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ContentBlock::from_value(value).map_err(D::Error::custom)
    }
}

fn deserialize_blocks<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<ContentBlock>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(text) => Ok(vec![ContentBlock::text(text)]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| ContentBlock::from_value(item).map_err(D::Error::custom))
            .collect(),
        other => Err(D::Error::custom(format!(
            "message content must be a string or an array, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, deserialize_with = "deserialize_blocks")]
    pub content: Vec<ContentBlock>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One record of a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub uuid: String,
    #[serde(rename = "parentUuid", default)]
    pub parent_uuid: Option<String>,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub message: EntryMessage,
    pub timestamp: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConversationEntry {
    pub fn new(
        uuid: impl Into<String>,
        parent_uuid: Option<&str>,
        kind: EntryKind,
        content: Vec<ContentBlock>,
        timestamp: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            parent_uuid: parent_uuid.map(str::to_owned),
            kind,
            message: EntryMessage {
                role: Some(kind.label().to_string()),
                content,
                extra: Map::new(),
            },
            timestamp: timestamp.into(),
            session_id: session_id.into(),
            extra: Map::new(),
        }
    }

    pub fn content(&self) -> &[ContentBlock] {
        &self.message.content
    }

    pub fn content_mut(&mut self) -> &mut Vec<ContentBlock> {
        &mut self.message.content
    }

    /// Names of the tools this entry invokes, in block order.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.content().iter().filter_map(|block| match block {
            ContentBlock::ToolUse { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Flattened text used for previews, classification and prompts.
    pub fn text(&self) -> String {
        let mut parts = Vec::new();
        for block in self.content() {
            match block {
                ContentBlock::ToolUse { name, input, .. } => {
                    parts.push(format!("[tool_use: {name}] {input}"));
                }
                ContentBlock::Other(_) => {}
                other => {
                    if let Some(text) = other.text_payload() {
                        parts.push(text);
                    }
                }
            }
        }
        parts.join("\n")
    }

    pub fn content_chars(&self) -> usize {
        self.content()
            .iter()
            .filter_map(ContentBlock::text_payload)
            .map(|t| t.chars().count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::{ContentBlock, ConversationEntry, EntryKind};
    use serde_json::json;

    #[test]
    fn parses_string_content_as_single_text_block() {
        let raw = r#"{"uuid":"u1","parentUuid":null,"type":"user","message":{"role":"user","content":"hello"},"timestamp":"2025-01-01T00:00:00Z","sessionId":"s1"}"#;
        let entry: ConversationEntry = serde_json::from_str(raw).expect("parse");
        assert_eq!(entry.kind, EntryKind::User);
        assert_eq!(entry.content(), &[ContentBlock::text("hello")]);
        assert!(entry.parent_uuid.is_none());
    }

    #[test]
    fn keeps_unknown_fields_and_block_types() {
        let raw = json!({
            "uuid": "u1",
            "parentUuid": "p1",
            "type": "assistant",
            "message": {
                "role": "assistant",
                "model": "m-1",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "tool_use", "id": "t1", "name": "Read", "input": {"file_path": "/a"}}
                ]
            },
            "timestamp": "2025-01-01T00:00:00Z",
            "sessionId": "s1",
            "cwd": "/work"
        });
        let entry: ConversationEntry = serde_json::from_value(raw.clone()).expect("parse");
        assert_eq!(entry.tool_names().collect::<Vec<_>>(), vec!["Read"]);
        let back = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(back["cwd"], "/work");
        assert_eq!(back["message"]["model"], "m-1");
        assert_eq!(back["message"]["content"][0]["thinking"], "hmm");
        assert_eq!(back["message"]["content"][1]["input"]["file_path"], "/a");
    }

    #[test]
    fn unknown_entry_type_is_rejected() {
        let raw = r#"{"uuid":"u1","type":"summary","timestamp":"t","sessionId":"s"}"#;
        assert!(serde_json::from_str::<ConversationEntry>(raw).is_err());
    }

    #[test]
    fn replace_payload_keeps_tool_result_array_shape() {
        let mut block = ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: json!([{"type": "text", "text": "long output"}, {"type": "image", "source": "x"}]),
            is_incomplete: false,
            extra: Default::default(),
        };
        assert!(block.replace_text_payload("short".into()));
        assert_eq!(block.text_payload().as_deref(), Some("short"));
        let ContentBlock::ToolResult { content, .. } = &block else {
            panic!("still a tool result");
        };
        assert_eq!(content.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn replace_payload_rewrites_first_text_part_where_it_sits() {
        let mut block = ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: json!([
                {"type": "image", "source": "a"},
                {"type": "text", "text": "first half", "cache": true},
                {"type": "image", "source": "b"},
                {"type": "text", "text": "second half"}
            ]),
            is_incomplete: false,
            extra: Default::default(),
        };
        assert!(block.replace_text_payload("merged".into()));
        let ContentBlock::ToolResult { content, .. } = &block else {
            panic!("still a tool result");
        };
        assert_eq!(
            content,
            &json!([
                {"type": "image", "source": "a"},
                {"type": "text", "text": "merged", "cache": true},
                {"type": "image", "source": "b"}
            ])
        );
    }
}
