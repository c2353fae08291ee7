use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message role as persisted. `ToolUse`/`ToolResult` rows carry structured
/// block content and only ever appear between a human turn and the
/// assistant turn that consumed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Human,
    Assistant,
    ToolUse,
    ToolResult,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageRole::Human => "human",
            MessageRole::Assistant => "assistant",
            MessageRole::ToolUse => "tool_use",
            MessageRole::ToolResult => "tool_result",
        };
        f.write_str(s)
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(MessageRole::Human),
            "assistant" => Ok(MessageRole::Assistant),
            "tool_use" => Ok(MessageRole::ToolUse),
            "tool_result" => Ok(MessageRole::ToolResult),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Normal,
    Reflection,
    MultiEntity,
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversationKind::Normal => "normal",
            ConversationKind::Reflection => "reflection",
            ConversationKind::MultiEntity => "multi_entity",
        };
        f.write_str(s)
    }
}

impl FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(ConversationKind::Normal),
            "reflection" => Ok(ConversationKind::Reflection),
            "multi_entity" => Ok(ConversationKind::MultiEntity),
            other => Err(format!("unknown conversation type: {other}")),
        }
    }
}

/// A conversation row. The session layer reads these to bootstrap; the
/// archive flag gates memory retrieval, not reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Owning entity, or the "multi-entity" sentinel, or `None` (legacy —
    /// owned by the default entity).
    pub entity_id: Option<String>,
    pub kind: ConversationKind,
    pub title: Option<String>,
    pub llm_model_used: Option<String>,
    /// Legacy single system prompt, superseded by `entity_system_prompts`
    /// when the per-entity map has an entry (even an empty one).
    pub system_prompt_used: Option<String>,
    pub entity_system_prompts: Option<HashMap<String, String>>,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted message. `times_retrieved` is monotonically non-decreasing;
/// it is bumped on the first surfacing per session, tracked via memory_links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    /// Plain text for human/assistant rows; JSON block array for tool rows.
    pub content: String,
    pub speaker_entity_id: Option<String>,
    pub token_count: usize,
    pub times_retrieved: u32,
    pub last_retrieved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Payload for inserting a message; the id and created_at are assigned by
/// the database layer.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub speaker_entity_id: Option<String>,
    pub token_count: usize,
}

impl NewMessage {
    pub fn human(content: impl Into<String>, token_count: usize) -> Self {
        Self {
            role: MessageRole::Human,
            content: content.into(),
            speaker_entity_id: None,
            token_count,
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        token_count: usize,
        speaker_entity_id: Option<String>,
    ) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            speaker_entity_id,
            token_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_roundtrips_through_strings() {
        for role in [
            MessageRole::Human,
            MessageRole::Assistant,
            MessageRole::ToolUse,
            MessageRole::ToolResult,
        ] {
            let parsed: MessageRole = role.to_string().parse().expect("parse");
            assert_eq!(parsed, role);
        }
        assert!("robot".parse::<MessageRole>().is_err());
    }

    #[test]
    fn kind_roundtrips_through_strings() {
        for kind in [
            ConversationKind::Normal,
            ConversationKind::Reflection,
            ConversationKind::MultiEntity,
        ] {
            let parsed: ConversationKind = kind.to_string().parse().expect("parse");
            assert_eq!(parsed, kind);
        }
    }
}
