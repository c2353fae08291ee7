//! Prompt assembly with a single conversation cache breakpoint.
//!
//! The message list is two partitions: the frozen conversation prefix
//! (cache marker on its last message) and everything that changes —
//! the uncached tail plus one composite final user message carrying the
//! memories block, date context, notes and the current turn. Memories sit
//! AFTER the breakpoint: new retrievals must never invalidate the
//! conversation cache.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;

use anima_core::content::{ApiRole, ContentBlock, ContextMessage, MessageContent};
use anima_session::Session;

/// Minimum rendered size of the cached prefix for the provider to accept
/// a cache block.
const MIN_CACHEABLE_TOKENS: usize = 1024;

const HISTORY_OPEN: &str = "[CONVERSATION HISTORY]";
const HISTORY_CLOSE: &str = "[/CONVERSATION HISTORY]";
const CURRENT_MESSAGE_HEADER: &str = "[CURRENT USER MESSAGE]";
const CONTINUATION_PROMPT: &str =
    "[CONTINUATION]\nPlease continue the conversation by responding to what was said above.";
const MULTI_ENTITY_HEADER: &str = "[THIS IS A CONVERSATION BETWEEN MULTIPLE AI AND ONE HUMAN]";

/// One block of an outgoing message, with its cache flag.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptBlock {
    pub block: ContentBlock,
    pub cache: bool,
}

impl PromptBlock {
    pub fn plain(block: ContentBlock) -> Self {
        Self {
            block,
            cache: false,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::plain(ContentBlock::Text { text: text.into() })
    }
}

/// One outgoing message. Serialises to the provider wire shape: a bare
/// string when it is a single uncached text block, a block array
/// otherwise (cache markers force the array form).
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: ApiRole,
    pub blocks: Vec<PromptBlock>,
}

impl PromptMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: ApiRole::User,
            blocks: vec![PromptBlock::text(text)],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: ApiRole::Assistant,
            blocks: vec![PromptBlock::text(text)],
        }
    }

    pub fn from_blocks(role: ApiRole, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            blocks: blocks.into_iter().map(PromptBlock::plain).collect(),
        }
    }

    /// Mark the last block as the cache breakpoint.
    pub fn mark_cache(&mut self) {
        if let Some(last) = self.blocks.last_mut() {
            last.cache = true;
        }
    }

    /// Remove any cache markers (tool-loop marker migration).
    pub fn clear_cache_marks(&mut self) {
        for block in &mut self.blocks {
            block.cache = false;
        }
    }

    pub fn has_cache_mark(&self) -> bool {
        self.blocks.iter().any(|b| b.cache)
    }

    /// Provider wire form.
    pub fn to_wire(&self) -> Value {
        let content: Value = if self.blocks.len() == 1 && !self.blocks[0].cache {
            if let ContentBlock::Text { text } = &self.blocks[0].block {
                Value::String(text.clone())
            } else {
                Value::Array(vec![block_to_wire(&self.blocks[0])])
            }
        } else {
            Value::Array(self.blocks.iter().map(block_to_wire).collect())
        };
        json!({ "role": self.role, "content": content })
    }
}

fn block_to_wire(block: &PromptBlock) -> Value {
    let mut value = serde_json::to_value(&block.block).unwrap_or(Value::Null);
    if block.cache {
        value["cache_control"] = json!({ "type": "ephemeral", "ttl": "1h" });
    }
    value
}

/// Everything the assembler needs for one turn.
pub struct AssembleInput<'a> {
    pub session: &'a Session,
    /// None on multi-entity continuations.
    pub current_message: Option<&'a str>,
    /// False on tool-loop iterations 2+, where the memories block is
    /// suppressed to keep prompts small and cache-stable.
    pub include_memories: bool,
    pub entity_notes: Option<&'a str>,
    pub shared_notes: Option<&'a str>,
    /// Ephemeral image blocks appended to the final user message.
    pub image_blocks: Vec<ContentBlock>,
    pub now: DateTime<Utc>,
    pub enable_caching: bool,
    pub count_tokens: &'a (dyn Fn(&str) -> usize + Send + Sync),
}

/// Build the full message sequence for one LLM call.
pub fn build_messages(input: AssembleInput<'_>) -> Vec<PromptMessage> {
    let session = input.session;
    let cached_context = session.cached_context();
    let new_context = session.new_context();
    let has_conversation = !cached_context.is_empty() || !new_context.is_empty();

    let multi_entity_header = multi_entity_header(session);
    let user_label = session.user_label();
    let assistant_label = session.assistant_label();

    // Whether the cached prefix is big enough to be worth a cache block.
    let will_cache_history = if input.enable_caching && !cached_context.is_empty() {
        let rendered = cached_context
            .iter()
            .map(|m| {
                let label = match m.role {
                    ApiRole::User => user_label,
                    ApiRole::Assistant => assistant_label,
                };
                format!("{label}: {}", m.content.display_text())
            })
            .collect::<Vec<_>>()
            .join("\n");
        let tokens = (input.count_tokens)(&rendered);
        debug!(
            cached_messages = cached_context.len(),
            cached_tokens = tokens,
            "cached prefix sized"
        );
        tokens >= MIN_CACHEABLE_TOKENS
    } else {
        false
    };

    let mut messages: Vec<PromptMessage> = Vec::with_capacity(
        cached_context.len() + new_context.len() + 1,
    );

    // 1. Cached conversation prefix; the last message carries the marker.
    for (i, msg) in cached_context.iter().enumerate() {
        let is_first = i == 0;
        let is_last = i == cached_context.len() - 1;
        let mut prompt_msg = context_to_prompt(msg, is_first, &multi_entity_header);
        if is_last && will_cache_history {
            prompt_msg.mark_cache();
        }
        messages.push(prompt_msg);
    }

    // 2. New (uncached) tail; gets the history header when nothing is cached.
    for (i, msg) in new_context.iter().enumerate() {
        let is_first_overall = cached_context.is_empty() && i == 0;
        messages.push(context_to_prompt(msg, is_first_overall, &multi_entity_header));
    }

    // 3. Composite final user message.
    let mut final_parts: Vec<String> = Vec::new();

    if has_conversation {
        final_parts.push(HISTORY_CLOSE.to_string());
    }

    if input.include_memories {
        let memory_block = session.render_memory_block();
        if !memory_block.is_empty() {
            final_parts.push(memory_block);
        }
    }

    final_parts.push(CURRENT_MESSAGE_HEADER.to_string());

    let mut date_block = String::from("[DATE CONTEXT]\n");
    if let Some(start) = session.conversation_start_date {
        date_block.push_str(&format!(
            "This conversation started: {}\n",
            start.format("%Y-%m-%d")
        ));
    }
    date_block.push_str(&format!("Current date: {}\n", input.now.format("%Y-%m-%d")));
    date_block.push_str("[/DATE CONTEXT]");
    final_parts.push(date_block);

    if let Some(notes) = input.entity_notes {
        final_parts.push(format!("[ENTITY NOTES]\n{notes}\n[/ENTITY NOTES]"));
    }
    if let Some(notes) = input.shared_notes {
        final_parts.push(format!("[SHARED NOTES]\n{notes}\n[/SHARED NOTES]"));
    }

    match input.current_message {
        Some(message) => {
            if session.is_multi_entity {
                final_parts.push(format!("[Human]: {message}"));
            } else {
                final_parts.push(message.to_string());
            }
        }
        None => final_parts.push(CONTINUATION_PROMPT.to_string()),
    }

    // Very first turn: the composite message opens the history itself.
    if !has_conversation {
        final_parts.insert(0, format!("{HISTORY_OPEN}\n{multi_entity_header}"));
    }

    let final_text = final_parts.join("\n\n");
    let mut final_blocks = vec![PromptBlock::text(final_text)];
    for image in input.image_blocks {
        final_blocks.push(PromptBlock::plain(image));
    }
    messages.push(PromptMessage {
        role: ApiRole::User,
        blocks: final_blocks,
    });

    messages
}

fn multi_entity_header(session: &Session) -> String {
    if !session.is_multi_entity
        || session.entity_labels.is_empty()
        || session.responding_entity_label.is_none()
    {
        return String::new();
    }
    let mut labels: Vec<&String> = session.entity_labels.values().collect();
    labels.sort();
    let quoted = labels
        .iter()
        .map(|l| format!("\"{l}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{MULTI_ENTITY_HEADER}\nParticipants: {quoted}\n")
}

fn context_to_prompt(
    msg: &ContextMessage,
    is_first: bool,
    multi_entity_header: &str,
) -> PromptMessage {
    match &msg.content {
        MessageContent::Blocks(blocks) => {
            // Tool exchanges pass their structured blocks through untouched.
            PromptMessage::from_blocks(msg.role, blocks.clone())
        }
        MessageContent::Text(text) => {
            let content = if is_first {
                format!("{HISTORY_OPEN}\n{multi_entity_header}\n{text}")
            } else {
                text.clone()
            };
            PromptMessage {
                role: msg.role,
                blocks: vec![PromptBlock::text(content)],
            }
        }
    }
}
