use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use anima_core::content::{ApiRole, ContentBlock, ContextMessage, MessageContent};
use anima_memory::types::MemoryEntry;

/// Below this rendered size the cached prefix is not worth caching — grow it.
const MIN_CACHEABLE_TOKENS: usize = 1024;
/// Once the uncached tail reaches this size, pay one miss to consolidate.
const CONSOLIDATE_AT_NEW_TOKENS: usize = 2048;

/// Runtime state for one active conversation.
///
/// Two separate structures carry the turn: `rolling_context` is the actual
/// message history, and the memory maps track what was retrieved from other
/// conversations. Memory tracking uses two sets:
/// - `retrieved_ids`: every id whose retrieval count was bumped this
///   session — never cleared, so a trimmed-then-resurfaced memory is not
///   double-counted.
/// - `in_context_ids`: ids currently rendered into the memories block —
///   trimmed under token pressure and restorable later.
///
/// Invariant: `in_context_ids ⊆ retrieved_ids ⊆ keys(memories)`.
#[derive(Debug)]
pub struct Session {
    pub conversation_id: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    /// Vector index name of the acting entity.
    pub entity_id: Option<String>,
    pub conversation_start_date: Option<DateTime<Utc>>,
    pub verbosity: Option<String>,

    pub is_multi_entity: bool,
    /// entity_id → display label, multi-entity only.
    pub entity_labels: HashMap<String, String>,
    pub responding_entity_label: Option<String>,
    pub user_display_name: Option<String>,

    pub rolling_context: Vec<ContextMessage>,

    memories: HashMap<String, MemoryEntry>,
    /// Insertion order into `memories` — the FIFO axis for trimming.
    retrieval_order: Vec<String>,
    pub retrieved_ids: HashSet<String>,
    pub in_context_ids: HashSet<String>,

    /// How many leading messages of `rolling_context` form the stable
    /// cached prefix. Everything beyond is "new".
    pub last_cached_context_length: usize,
}

impl Session {
    pub fn new(
        conversation_id: impl Into<String>,
        model: impl Into<String>,
        temperature: f64,
        max_tokens: u32,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            model: model.into(),
            temperature,
            max_tokens,
            system_prompt: None,
            entity_id: None,
            conversation_start_date: None,
            verbosity: None,
            is_multi_entity: false,
            entity_labels: HashMap::new(),
            responding_entity_label: None,
            user_display_name: None,
            rolling_context: Vec::new(),
            memories: HashMap::new(),
            retrieval_order: Vec::new(),
            retrieved_ids: HashSet::new(),
            in_context_ids: HashSet::new(),
            last_cached_context_length: 0,
        }
    }

    // ── display labels ───────────────────────────────────────────────────

    pub fn user_label(&self) -> &str {
        self.user_display_name.as_deref().unwrap_or("user")
    }

    pub fn assistant_label(&self) -> &str {
        self.responding_entity_label.as_deref().unwrap_or("assistant")
    }

    // ── memory tracking ──────────────────────────────────────────────────

    /// Add a memory to the session.
    ///
    /// Returns `(added_to_context, is_new_retrieval)`:
    /// - `(false, false)`: already in context, nothing to do.
    /// - `(true, false)`: previously trimmed, restored — the retrieval
    ///   count must NOT be bumped again.
    /// - `(true, true)`: first time this session — bump the count.
    pub fn add_memory(&mut self, memory: MemoryEntry) -> (bool, bool) {
        if self.in_context_ids.contains(&memory.id) {
            return (false, false);
        }

        if self.retrieved_ids.contains(&memory.id) {
            self.in_context_ids.insert(memory.id.clone());
            if let Some(existing) = self.memories.get_mut(&memory.id) {
                existing.score = memory.score;
            }
            return (true, false);
        }

        self.retrieved_ids.insert(memory.id.clone());
        self.in_context_ids.insert(memory.id.clone());
        self.retrieval_order.push(memory.id.clone());
        self.memories.insert(memory.id.clone(), memory);
        (true, true)
    }

    /// Seed a memory as already-retrieved and in-context (session reload
    /// from memory links). Does not report a new retrieval.
    pub fn seed_memory(&mut self, memory: MemoryEntry) {
        if self.memories.contains_key(&memory.id) {
            return;
        }
        self.retrieved_ids.insert(memory.id.clone());
        self.in_context_ids.insert(memory.id.clone());
        self.retrieval_order.push(memory.id.clone());
        self.memories.insert(memory.id.clone(), memory);
    }

    pub fn get_memory(&self, id: &str) -> Option<&MemoryEntry> {
        self.memories.get(id)
    }

    pub fn memory_count(&self) -> usize {
        self.memories.len()
    }

    /// Memories currently in context, sorted by id. Id order (not score
    /// order) keeps the rendered block byte-stable across turns, which the
    /// provider-side prompt cache rewards.
    pub fn memories_for_injection(&self) -> Vec<&MemoryEntry> {
        let mut memories: Vec<&MemoryEntry> = self
            .in_context_ids
            .iter()
            .filter_map(|id| self.memories.get(id))
            .collect();
        memories.sort_by(|a, b| a.id.cmp(&b.id));
        memories
    }

    /// Render the `[MEMORIES …]` block, or an empty string when nothing is
    /// in context. Shared between token budgeting and prompt assembly so
    /// the two can never disagree.
    pub fn render_memory_block(&self) -> String {
        let memories = self.memories_for_injection();
        if memories.is_empty() {
            return String::new();
        }

        let mut block = String::from("[MEMORIES FROM PREVIOUS CONVERSATIONS]\n\n");
        for memory in memories {
            let role_display = match memory.role.as_str() {
                "human" => self.user_label(),
                "assistant" => self.assistant_label(),
                other => other,
            };
            block.push_str(&format!(
                "Memory from {role_display} (from {}):\n\"{}\"\n\n",
                memory.created_at.to_rfc3339(),
                memory.content,
            ));
        }
        block.push_str("[/MEMORIES]");
        block
    }

    /// Trim oldest-retrieved memories until the rendered block fits within
    /// `max_tokens`. Trimmed ids stay in `retrieved_ids` and `memories` so
    /// restoration never recounts. Returns the removed ids in trim order.
    pub fn trim_memories_to_limit(
        &mut self,
        max_tokens: usize,
        count_tokens: &dyn Fn(&str) -> usize,
    ) -> Vec<String> {
        let mut removed = Vec::new();

        let mut ordered_in_context: Vec<String> = self
            .retrieval_order
            .iter()
            .filter(|id| self.in_context_ids.contains(*id))
            .cloned()
            .collect();

        while !ordered_in_context.is_empty() {
            let block = self.render_memory_block();
            if count_tokens(&block) <= max_tokens {
                break;
            }
            let oldest = ordered_in_context.remove(0);
            self.in_context_ids.remove(&oldest);
            removed.push(oldest);
        }

        if !removed.is_empty() {
            info!(
                removed = removed.len(),
                remaining = self.in_context_ids.len(),
                "trimmed memories to token limit"
            );
        }
        removed
    }

    // ── rolling context ──────────────────────────────────────────────────

    /// Append a human/assistant exchange. `human` is None on multi-entity
    /// continuations. Multi-entity content gets speaker prefixes so the
    /// model sees a conversation among many.
    pub fn add_exchange(&mut self, human: Option<&str>, assistant: &str) {
        if let Some(human) = human {
            self.push_user_turn(human);
        }
        self.push_assistant_turn(assistant);
    }

    /// Append the user half of an exchange (tool loops interleave tool
    /// exchanges between the halves).
    pub fn push_user_turn(&mut self, human: &str) {
        let content = if self.is_multi_entity {
            format!("[Human]: {human}")
        } else {
            human.to_string()
        };
        self.rolling_context.push(ContextMessage::user(content));
    }

    /// Append the assistant half of an exchange.
    pub fn push_assistant_turn(&mut self, assistant: &str) {
        let content = match (&self.is_multi_entity, &self.responding_entity_label) {
            (true, Some(label)) => format!("[{label}]: {assistant}"),
            _ => assistant.to_string(),
        };
        self.rolling_context.push(ContextMessage::assistant(content));
    }

    /// Append one tool exchange as structured blocks: the assistant's
    /// content (text + tool_use) and the matching tool_result user message.
    pub fn add_tool_exchange(
        &mut self,
        assistant_blocks: Vec<ContentBlock>,
        result_blocks: Vec<ContentBlock>,
    ) {
        self.rolling_context.push(ContextMessage {
            role: ApiRole::Assistant,
            content: MessageContent::Blocks(assistant_blocks),
        });
        self.rolling_context.push(ContextMessage {
            role: ApiRole::User,
            content: MessageContent::Blocks(result_blocks),
        });
    }

    /// Drop whole exchanges from the front of the context until it (plus
    /// the pending user message) fits within `max_tokens`. Returns how many
    /// messages were removed.
    pub fn trim_context_to_limit(
        &mut self,
        max_tokens: usize,
        count_tokens: &dyn Fn(&str) -> usize,
        pending_user_message: Option<&str>,
    ) -> usize {
        let mut removed = 0usize;

        loop {
            let mut text = self
                .rolling_context
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content.display_text()))
                .collect::<Vec<_>>()
                .join("\n");
            if let Some(pending) = pending_user_message {
                text.push_str(&format!("\nuser: {pending}"));
            }

            if count_tokens(&text) <= max_tokens {
                break;
            }
            if self.rolling_context.len() < 2 {
                break;
            }

            // Remove the oldest pair (user + assistant)
            self.rolling_context.remove(0);
            removed += 1;
            if self
                .rolling_context
                .first()
                .map(|m| m.role == ApiRole::Assistant)
                .unwrap_or(false)
            {
                self.rolling_context.remove(0);
                removed += 1;
            }

            // The cached prefix can only shrink with the context.
            self.last_cached_context_length = self
                .last_cached_context_length
                .min(self.rolling_context.len());
        }

        removed
    }

    // ── cache breakpoint ─────────────────────────────────────────────────

    /// The frozen prefix of the rolling context.
    pub fn cached_context(&self) -> &[ContextMessage] {
        &self.rolling_context[..self.last_cached_context_length.min(self.rolling_context.len())]
    }

    /// Everything past the frozen prefix.
    pub fn new_context(&self) -> &[ContextMessage] {
        &self.rolling_context[self.last_cached_context_length.min(self.rolling_context.len())..]
    }

    /// Whether to consolidate (grow) the cached prefix this turn.
    ///
    /// Consolidation costs one cache MISS but buys a larger prefix for
    /// future hits. Triggered when the cached prefix renders below the
    /// provider's minimum cacheable size, or the uncached tail has grown
    /// past the consolidation threshold.
    pub fn should_consolidate(&self, count_tokens: &dyn Fn(&str) -> usize) -> bool {
        if self.rolling_context.is_empty() {
            return false;
        }

        let cached = self.cached_context();
        let new = self.new_context();
        if new.is_empty() {
            return false;
        }

        if !cached.is_empty() {
            let cached_tokens = count_tokens(&render_plain(cached));
            if cached_tokens < MIN_CACHEABLE_TOKENS {
                debug!(cached_tokens, "consolidating: cached prefix below cacheable minimum");
                return true;
            }
        }

        let new_tokens = count_tokens(&render_plain(new));
        new_tokens >= CONSOLIDATE_AT_NEW_TOKENS
    }

    /// Advance the breakpoint after a completed turn.
    ///
    /// - consolidate: freeze everything except the exchange just appended;
    /// - bootstrap (breakpoint was 0): freeze everything;
    /// - otherwise hold, so the next call hits the same prefix.
    pub fn advance_cache_after_turn(&mut self, consolidate: bool) {
        let old = self.last_cached_context_length;
        let new = if consolidate {
            self.rolling_context.len().saturating_sub(2)
        } else if old == 0 && !self.rolling_context.is_empty() {
            self.rolling_context.len()
        } else {
            old
        };
        if new != old {
            info!(from = old, to = new, "cache breakpoint advanced");
        }
        self.last_cached_context_length = new;
    }

    /// Clamp a preserved breakpoint from a prior session incarnation.
    pub fn set_cached_context_length(&mut self, length: usize) {
        self.last_cached_context_length = length.min(self.rolling_context.len());
    }
}

fn render_plain(messages: &[ContextMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content.display_text()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_memory::types::MemorySource;

    fn entry(id: &str, content: &str) -> MemoryEntry {
        MemoryEntry {
            id: id.to_string(),
            conversation_id: "other".to_string(),
            role: "assistant".to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            times_retrieved: 1,
            score: 0.8,
            significance: 0.5,
            combined_score: 1.2,
            days_since_creation: 1.0,
            days_since_retrieval: None,
            source: MemorySource::User,
        }
    }

    fn session() -> Session {
        Session::new("conv-1", "claude-sonnet-4-5", 1.0, 4096)
    }

    fn assert_invariants(s: &Session) {
        assert!(s.in_context_ids.is_subset(&s.retrieved_ids));
        for id in &s.retrieved_ids {
            assert!(s.get_memory(id).is_some());
        }
        assert!(s.last_cached_context_length <= s.rolling_context.len());
    }

    #[test]
    fn add_memory_first_time_is_new_retrieval() {
        let mut s = session();
        let (added, is_new) = s.add_memory(entry("m1", "a fact"));
        assert!(added);
        assert!(is_new);
        assert_invariants(&s);
    }

    #[test]
    fn add_memory_twice_is_noop() {
        let mut s = session();
        s.add_memory(entry("m1", "a fact"));
        let (added, is_new) = s.add_memory(entry("m1", "a fact"));
        assert!(!added);
        assert!(!is_new);
        assert_eq!(s.memory_count(), 1);
        assert_invariants(&s);
    }

    #[test]
    fn trimmed_memory_restores_without_recount() {
        let mut s = session();
        for (i, id) in ["m_a", "m_b", "m_c", "m_d", "m_e"].iter().enumerate() {
            s.add_memory(entry(id, &format!("memory number {i} with some padding text")));
        }

        // Budget forces the two oldest out.
        let count = |text: &str| text.len() / 4;
        let block_len = count(&s.render_memory_block());
        let per_memory = block_len / 5;
        let removed = s.trim_memories_to_limit(per_memory * 3 + 10, &count);

        assert_eq!(removed, vec!["m_a".to_string(), "m_b".to_string()]);
        assert_eq!(s.in_context_ids.len(), 3);
        assert_eq!(s.memory_count(), 5);
        assert!(s.retrieved_ids.contains("m_a"));
        assert_invariants(&s);

        // Re-surfacing a trimmed memory restores without a new retrieval.
        let (added, is_new) = s.add_memory(entry("m_a", "memory number 0 with some padding text"));
        assert!(added);
        assert!(!is_new);
        assert!(s.in_context_ids.contains("m_a"));
        assert_invariants(&s);
    }

    #[test]
    fn restored_memory_gets_fresh_score() {
        let mut s = session();
        s.add_memory(entry("m1", "fact"));
        s.trim_memories_to_limit(0, &|_| usize::MAX);
        assert!(s.in_context_ids.is_empty());

        let mut fresh = entry("m1", "fact");
        fresh.score = 0.95;
        s.add_memory(fresh);
        assert_eq!(s.get_memory("m1").map(|m| m.score), Some(0.95));
    }

    #[test]
    fn injection_order_is_by_id_not_retrieval_order() {
        let mut s = session();
        s.add_memory(entry("zzz", "late alphabet, first retrieved"));
        s.add_memory(entry("aaa", "early alphabet, last retrieved"));
        let ids: Vec<&str> = s.memories_for_injection().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["aaa", "zzz"]);
    }

    #[test]
    fn memory_block_uses_display_labels() {
        let mut s = session();
        s.user_display_name = Some("River".to_string());
        s.responding_entity_label = Some("Aria".to_string());
        let mut human_memory = entry("m1", "I like tea");
        human_memory.role = "human".to_string();
        s.add_memory(human_memory);
        s.add_memory(entry("m2", "noted the tea preference"));

        let block = s.render_memory_block();
        assert!(block.starts_with("[MEMORIES FROM PREVIOUS CONVERSATIONS]"));
        assert!(block.contains("Memory from River"));
        assert!(block.contains("Memory from Aria"));
        assert!(block.ends_with("[/MEMORIES]"));
    }

    #[test]
    fn exchange_appends_user_then_assistant() {
        let mut s = session();
        s.add_exchange(Some("Hello"), "Hi!");
        assert_eq!(s.rolling_context.len(), 2);
        assert_eq!(s.rolling_context[0].role, ApiRole::User);
        assert_eq!(s.rolling_context[1].role, ApiRole::Assistant);
        assert_eq!(s.rolling_context[0].content.as_text(), Some("Hello"));
    }

    #[test]
    fn multi_entity_exchange_gets_speaker_prefixes() {
        let mut s = session();
        s.is_multi_entity = true;
        s.responding_entity_label = Some("Aria".to_string());
        s.add_exchange(Some("who's there"), "just me");
        assert_eq!(
            s.rolling_context[0].content.as_text(),
            Some("[Human]: who's there")
        );
        assert_eq!(s.rolling_context[1].content.as_text(), Some("[Aria]: just me"));
    }

    #[test]
    fn continuation_appends_assistant_only() {
        let mut s = session();
        s.is_multi_entity = true;
        s.responding_entity_label = Some("Sol".to_string());
        s.add_exchange(None, "continuing the thought");
        assert_eq!(s.rolling_context.len(), 1);
        assert_eq!(s.rolling_context[0].role, ApiRole::Assistant);
    }

    #[test]
    fn context_trim_removes_whole_exchanges_from_front() {
        let mut s = session();
        for i in 0..6 {
            s.add_exchange(Some(&format!("question {i}")), &format!("answer {i}"));
        }
        assert_eq!(s.rolling_context.len(), 12);

        // Each message renders to > 1 token; permit roughly half.
        let count = |text: &str| text.split('\n').count();
        let removed = s.trim_context_to_limit(6, &count, Some("next question"));

        assert!(removed >= 6);
        assert_eq!(removed % 2, 0, "messages leave in pairs");
        assert_eq!(s.rolling_context[0].role, ApiRole::User);
        assert_invariants(&s);
    }

    #[test]
    fn bootstrap_caches_everything_after_first_turn() {
        let mut s = session();
        assert_eq!(s.last_cached_context_length, 0);
        s.add_exchange(Some("Hello"), "Hi!");
        s.advance_cache_after_turn(false);
        assert_eq!(s.last_cached_context_length, 2);
        assert_invariants(&s);
    }

    #[test]
    fn hold_keeps_breakpoint_for_cache_hits() {
        let mut s = session();
        s.add_exchange(Some("a"), "b");
        s.advance_cache_after_turn(false);
        s.add_exchange(Some("c"), "d");
        s.advance_cache_after_turn(false);
        assert_eq!(s.last_cached_context_length, 2);
        assert_eq!(s.new_context().len(), 2);
    }

    #[test]
    fn consolidation_freezes_all_but_latest_exchange() {
        let mut s = session();
        for i in 0..4 {
            s.add_exchange(Some(&format!("q{i}")), &format!("a{i}"));
        }
        s.set_cached_context_length(4);
        s.add_exchange(Some("q4"), "a4");
        s.advance_cache_after_turn(true);
        // 10 messages, the just-appended exchange stays new
        assert_eq!(s.last_cached_context_length, 8);
        assert_eq!(s.new_context().len(), 2);
    }

    #[test]
    fn should_consolidate_when_new_tail_is_large() {
        let mut s = session();
        // cached prefix: comfortably above the minimum
        s.add_exchange(Some(&"x".repeat(4096)), &"y".repeat(4096));
        s.set_cached_context_length(2);
        // new tail: above the 2048-token threshold at ~4 chars/token
        s.add_exchange(Some(&"n".repeat(8192)), &"m".repeat(8192));

        let count = |text: &str| text.len() / 4;
        assert!(s.should_consolidate(&count));
    }

    #[test]
    fn should_consolidate_when_cached_prefix_too_small() {
        let mut s = session();
        s.add_exchange(Some("tiny"), "prefix");
        s.set_cached_context_length(2);
        s.add_exchange(Some("more"), "content");

        let count = |text: &str| text.len() / 4;
        assert!(s.should_consolidate(&count));
    }

    #[test]
    fn no_consolidation_without_new_tail() {
        let mut s = session();
        s.add_exchange(Some("q"), "a");
        s.set_cached_context_length(2);
        let count = |text: &str| text.len() / 4;
        assert!(!s.should_consolidate(&count));
    }

    #[test]
    fn tool_exchange_lands_as_structured_blocks() {
        let mut s = session();
        s.add_tool_exchange(
            vec![
                ContentBlock::Text {
                    text: "looking it up".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "tu_1".to_string(),
                    name: "web_search".to_string(),
                    input: serde_json::json!({"query": "rust"}),
                },
            ],
            vec![ContentBlock::ToolResult {
                tool_use_id: "tu_1".to_string(),
                content: "found it".to_string(),
                is_error: false,
            }],
        );
        assert_eq!(s.rolling_context.len(), 2);
        assert!(s.rolling_context[0].is_tool_exchange());
        assert!(s.rolling_context[1].is_tool_exchange());
        assert_eq!(s.rolling_context[1].role, ApiRole::User);
    }
}
