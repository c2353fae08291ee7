use serde::Serialize;
use serde_json::Value;

use anima_memory::types::MemoryEntry;

use crate::provider::Usage;

const MEMORY_CONTENT_CAP: usize = 3000;
const MEMORY_PREVIEW_CAP: usize = 200;

/// Memory payload surfaced to consumers in `memories` events and /send
/// responses.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryInfo {
    pub id: String,
    pub content: String,
    pub content_preview: String,
    pub created_at: String,
    /// Includes the increment this retrieval just caused.
    pub times_retrieved: u32,
    pub score: f64,
    pub role: String,
}

impl MemoryInfo {
    pub fn from_entry(entry: &MemoryEntry) -> Self {
        Self {
            id: entry.id.clone(),
            content: truncate_chars(&entry.content, MEMORY_CONTENT_CAP),
            content_preview: truncate_chars(&entry.content, MEMORY_PREVIEW_CAP),
            created_at: entry.created_at.to_rfc3339(),
            times_retrieved: entry.times_retrieved + 1,
            score: entry.score,
            role: entry.role.clone(),
        }
    }
}

fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        s.to_string()
    } else {
        s.chars().take(cap).collect()
    }
}

/// One tool call and its result, as accumulated across the tool loop.
#[derive(Debug, Clone, Serialize)]
pub struct ToolUseRecord {
    pub call: ToolCallInfo,
    pub result: ToolResultInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallInfo {
    pub name: String,
    pub id: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResultInfo {
    pub content: String,
    pub is_error: bool,
}

/// Events of one streamed turn, in contract order:
/// `memories` → `start` → `token`* → (`tool_start` → `tool_result`)* → `done`.
/// A turn that fails mid-flight ends with `error` instead of `done`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Memories {
        entity_id: Option<String>,
        entity_label: Option<String>,
        new_memories: Vec<MemoryInfo>,
        total_in_context: usize,
        trimmed_memory_ids: Vec<String>,
        trimmed_context_messages: usize,
    },
    Start {
        model: String,
    },
    Token {
        content: String,
    },
    ToolStart {
        tool_name: String,
        tool_id: String,
        input: Value,
    },
    ToolResult {
        tool_name: String,
        tool_id: String,
        content: String,
        is_error: bool,
    },
    Done {
        content: String,
        model: String,
        usage: Usage,
        stop_reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_uses: Option<Vec<ToolUseRecord>>,
    },
    Error {
        error: String,
    },
}

impl TurnEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::Memories { .. } => "memories",
            TurnEvent::Start { .. } => "start",
            TurnEvent::Token { .. } => "token",
            TurnEvent::ToolStart { .. } => "tool_start",
            TurnEvent::ToolResult { .. } => "tool_result",
            TurnEvent::Done { .. } => "done",
            TurnEvent::Error { .. } => "error",
        }
    }

    /// Token events may be dropped under backpressure; everything else is
    /// delivered or the stream is broken.
    pub fn droppable(&self) -> bool {
        matches!(self, TurnEvent::Token { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_sse_contract() {
        let done = TurnEvent::Done {
            content: "hi".to_string(),
            model: "m".to_string(),
            usage: Usage::default(),
            stop_reason: "end_turn".to_string(),
            tool_uses: None,
        };
        assert_eq!(done.name(), "done");
        let json = serde_json::to_value(&done).expect("serialise");
        assert_eq!(json["type"], "done");
        assert!(json.get("tool_uses").is_none());
    }

    #[test]
    fn only_token_events_are_droppable() {
        assert!(TurnEvent::Token {
            content: "x".to_string()
        }
        .droppable());
        assert!(!TurnEvent::Error {
            error: "e".to_string()
        }
        .droppable());
    }
}
