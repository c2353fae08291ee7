use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// API-level role. Tool exchanges ride inside user/assistant messages as
/// structured blocks, so there is no separate wire role for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiRole {
    User,
    Assistant,
}

impl fmt::Display for ApiRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiRole::User => f.write_str("user"),
            ApiRole::Assistant => f.write_str("assistant"),
        }
    }
}

/// Base64 image payload, Anthropic wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            source_type: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

/// One typed content block inside a structured message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Image {
        source: ImageSource,
    },
}

/// Message content: either a plain string or a list of typed blocks.
///
/// Serialises to exactly what the provider API expects — a JSON string for
/// `Text`, a JSON array for `Blocks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to a plain-text rendering for token counting and query
    /// derivation. Tool blocks get a compact bracketed summary.
    pub fn display_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => {
                let mut parts = Vec::with_capacity(blocks.len());
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => parts.push(text.clone()),
                        ContentBlock::ToolUse { name, input, .. } => {
                            parts.push(format!("[Tool use: {name}({input})]"));
                        }
                        ContentBlock::ToolResult { content, .. } => {
                            parts.push(format!("[Tool result: {content}]"));
                        }
                        ContentBlock::Image { source } => {
                            parts.push(format!("[Image: {}]", source.media_type));
                        }
                    }
                }
                parts.join("\n")
            }
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(s) => Some(s),
            MessageContent::Blocks(_) => None,
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// One entry in a session's rolling context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: ApiRole,
    pub content: MessageContent,
}

impl ContextMessage {
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: ApiRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: ApiRole::Assistant,
            content: content.into(),
        }
    }

    /// True when this message carries structured blocks (a tool exchange)
    /// rather than plain text.
    pub fn is_tool_exchange(&self) -> bool {
        matches!(self.content, MessageContent::Blocks(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_serialises_as_bare_string() {
        let msg = ContextMessage::user("hello");
        let json = serde_json::to_value(&msg).expect("serialise");
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
    }

    #[test]
    fn block_content_serialises_as_tagged_array() {
        let msg = ContextMessage::assistant(MessageContent::Blocks(vec![
            ContentBlock::Text {
                text: "checking".to_string(),
            },
            ContentBlock::ToolUse {
                id: "tu_1".to_string(),
                name: "web_search".to_string(),
                input: serde_json::json!({"query": "weather"}),
            },
        ]));
        let json = serde_json::to_value(&msg).expect("serialise");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "tool_use");
        assert_eq!(json["content"][1]["name"], "web_search");
    }

    #[test]
    fn content_roundtrips_through_json() {
        let original = MessageContent::Blocks(vec![ContentBlock::ToolResult {
            tool_use_id: "tu_9".to_string(),
            content: "42".to_string(),
            is_error: false,
        }]);
        let json = serde_json::to_string(&original).expect("serialise");
        let back: MessageContent = serde_json::from_str(&json).expect("deserialise");
        assert_eq!(back, original);
    }

    #[test]
    fn display_text_summarises_tool_blocks() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text {
                text: "let me look".to_string(),
            },
            ContentBlock::ToolUse {
                id: "tu_2".to_string(),
                name: "web_fetch".to_string(),
                input: serde_json::json!({"url": "https://example.com"}),
            },
        ]);
        let text = content.display_text();
        assert!(text.contains("let me look"));
        assert!(text.contains("[Tool use: web_fetch"));
    }
}
