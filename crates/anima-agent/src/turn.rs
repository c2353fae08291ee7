//! The turn pipeline: retrieval → budgeting → prompt assembly → LLM call →
//! tool loop → session mutation. One `Pipeline` is shared by every
//! conversation; per-turn state lives on the stack.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use anima_core::config::AnimaConfig;
use anima_core::content::{ApiRole, ContentBlock};
use anima_core::tokens::TokenCounter;
use anima_db::Database;
use anima_memory::VectorStore;
use anima_session::Session;

use crate::assemble::{build_messages, AssembleInput, PromptMessage};
use crate::events::{MemoryInfo, ToolCallInfo, ToolResultInfo, ToolUseRecord, TurnEvent};
use crate::notes::NotesProvider;
use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError, StreamEvent, Usage};
use crate::retrieval::{retrieve_and_budget, RetrievalOutcome};
use crate::tools::ToolRegistry;

/// Result of a non-streaming turn (POST /send).
#[derive(Debug)]
pub struct TurnOutput {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: String,
    pub new_memories_retrieved: Vec<MemoryInfo>,
    pub total_memories_in_context: usize,
    pub trimmed_memory_ids: Vec<String>,
    pub trimmed_context_messages: usize,
}

/// What a completed streaming turn produced, for the persistence layer.
/// `None` from `process_message_stream` means cancelled or failed — no
/// session mutation happened and nothing should be persisted.
#[derive(Debug)]
pub struct StreamTurnSummary {
    pub content: String,
    pub tool_exchanges: Vec<(Vec<ContentBlock>, Vec<ContentBlock>)>,
    pub stop_reason: String,
}

/// Shared turn machinery. Cheap to clone — everything is behind Arcs.
#[derive(Clone)]
pub struct Pipeline {
    pub db: Arc<Database>,
    pub store: Option<Arc<VectorStore>>,
    pub provider: Arc<dyn LlmProvider>,
    pub config: Arc<AnimaConfig>,
    pub counter: Arc<TokenCounter>,
    pub notes: Arc<NotesProvider>,
}

impl Pipeline {
    fn notes_for(&self, session: &Session) -> (Option<String>, Option<String>) {
        match &session.responding_entity_label {
            Some(label) => (self.notes.entity_notes(label), self.notes.shared_notes()),
            None => (None, None),
        }
    }

    /// Non-streaming turn: retrieval, budgeting, a single LLM call, then
    /// session mutation. No tool loop on this path. `user_message` is None
    /// only on multi-entity continuations.
    pub async fn process_message(
        &self,
        session: &mut Session,
        user_message: Option<&str>,
        image_blocks: Vec<ContentBlock>,
    ) -> Result<TurnOutput, ProviderError> {
        let counter = self.counter.clone();
        let count = move |text: &str| counter.count(text);

        let outcome = retrieve_and_budget(
            session,
            user_message,
            &self.db,
            self.store.as_deref(),
            &self.config,
            &count,
        )
        .await;

        let consolidate = session.should_consolidate(&count);
        let (entity_notes, shared_notes) = self.notes_for(session);

        let messages = build_messages(AssembleInput {
            session,
            current_message: user_message,
            include_memories: true,
            entity_notes: entity_notes.as_deref(),
            shared_notes: shared_notes.as_deref(),
            image_blocks,
            now: Utc::now(),
            enable_caching: true,
            count_tokens: &count,
        });

        let request = ChatRequest {
            model: session.model.clone(),
            system: session.system_prompt.clone(),
            messages,
            temperature: session.temperature,
            max_tokens: session.max_tokens,
            tools: Vec::new(),
            enable_caching: true,
        };

        let response = self.provider.send(&request).await?;

        info!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            cache_read = response.usage.cache_read_input_tokens,
            "turn complete"
        );

        session.add_exchange(user_message, &response.content);
        session.advance_cache_after_turn(consolidate);

        Ok(TurnOutput {
            content: response.content,
            model: response.model,
            usage: response.usage,
            stop_reason: response.stop_reason,
            new_memories_retrieved: outcome
                .new_memories
                .iter()
                .map(MemoryInfo::from_entry)
                .collect(),
            total_memories_in_context: session.in_context_ids.len(),
            trimmed_memory_ids: outcome.trimmed_memory_ids,
            trimmed_context_messages: outcome.trimmed_context_messages,
        })
    }

    /// Streaming turn with the agentic tool loop. Events arrive on `tx` in
    /// contract order; the session is mutated only when a terminal response
    /// lands, so a cancelled turn leaves no partial exchange behind.
    #[allow(clippy::too_many_arguments)]
    pub async fn process_message_stream(
        &self,
        session: &mut Session,
        user_message: Option<&str>,
        registry: Option<&ToolRegistry>,
        image_blocks: Vec<ContentBlock>,
        tx: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
    ) -> Option<StreamTurnSummary> {
        let counter = self.counter.clone();
        let count = move |text: &str| counter.count(text);

        let outcome = retrieve_and_budget(
            session,
            user_message,
            &self.db,
            self.store.as_deref(),
            &self.config,
            &count,
        )
        .await;

        if !emit(&tx, memories_event(session, &outcome)).await {
            return None;
        }

        let consolidate = session.should_consolidate(&count);
        let (entity_notes, shared_notes) = self.notes_for(session);
        let now = Utc::now();

        // The base prompt, and its twin without the memories block. The
        // twin anchors iterations 2+ so memory churn cannot defeat the
        // tool-exchange cache.
        let base = build_messages(AssembleInput {
            session,
            current_message: user_message,
            include_memories: true,
            entity_notes: entity_notes.as_deref(),
            shared_notes: shared_notes.as_deref(),
            image_blocks: image_blocks.clone(),
            now,
            enable_caching: true,
            count_tokens: &count,
        });
        let base_without_memories = build_messages(AssembleInput {
            session,
            current_message: user_message,
            include_memories: false,
            entity_notes: entity_notes.as_deref(),
            shared_notes: shared_notes.as_deref(),
            image_blocks,
            now,
            enable_caching: true,
            count_tokens: &count,
        });

        let tool_defs = registry.map(|r| r.definitions()).unwrap_or_default();
        let max_iterations = self.config.retrieval.tool_use_max_iterations;

        // Accumulated across iterations.
        let mut tool_tail: Vec<PromptMessage> = Vec::new();
        let mut session_exchanges: Vec<(Vec<ContentBlock>, Vec<ContentBlock>)> = Vec::new();
        let mut accumulated_tool_uses: Vec<ToolUseRecord> = Vec::new();
        let mut full_content = String::new();

        for iteration in 1..=max_iterations {
            let messages = if iteration == 1 {
                base.clone()
            } else {
                let mut m = base_without_memories.clone();
                m.extend(tool_tail.iter().cloned());
                m
            };

            let request = ChatRequest {
                model: session.model.clone(),
                system: session.system_prompt.clone(),
                messages,
                temperature: session.temperature,
                max_tokens: session.max_tokens,
                tools: tool_defs.clone(),
                enable_caching: true,
            };

            let (response, truncated) = match self
                .stream_one_iteration(request, iteration, &tx, &cancel)
                .await
            {
                IterationEnd::Completed { response, truncated } => (response, truncated),
                IterationEnd::Cancelled => return None,
                IterationEnd::Failed => return None,
            };

            full_content.push_str(&response.content);

            let tool_registry = if response.wants_tools() && !truncated {
                registry
            } else {
                None
            };
            let Some(registry) = tool_registry else {
                if truncated {
                    warn!("tool use truncated by max_tokens; finishing without executing it");
                }
                self.finish_turn(
                    session,
                    user_message,
                    &session_exchanges,
                    &full_content,
                    consolidate,
                );
                let _ = emit(
                    &tx,
                    TurnEvent::Done {
                        content: full_content.clone(),
                        model: response.model.clone(),
                        usage: response.usage.clone(),
                        stop_reason: response.stop_reason.clone(),
                        tool_uses: if accumulated_tool_uses.is_empty() {
                            None
                        } else {
                            Some(accumulated_tool_uses.clone())
                        },
                    },
                )
                .await;
                return Some(StreamTurnSummary {
                    content: full_content,
                    tool_exchanges: session_exchanges,
                    stop_reason: response.stop_reason,
                });
            };

            // Execute the requested tools, in order.
            info!(
                iteration,
                calls = response.tool_calls.len(),
                "processing tool calls"
            );

            let mut result_blocks: Vec<ContentBlock> = Vec::new();
            for call in &response.tool_calls {
                if !emit(
                    &tx,
                    TurnEvent::ToolStart {
                        tool_name: call.name.clone(),
                        tool_id: call.id.clone(),
                        input: call.input.clone(),
                    },
                )
                .await
                {
                    return None;
                }

                let executed = registry
                    .execute(&call.id, &call.name, call.input.clone())
                    .await;

                if !emit(
                    &tx,
                    TurnEvent::ToolResult {
                        tool_name: call.name.clone(),
                        tool_id: call.id.clone(),
                        content: executed.content.clone(),
                        is_error: executed.is_error,
                    },
                )
                .await
                {
                    return None;
                }

                accumulated_tool_uses.push(ToolUseRecord {
                    call: ToolCallInfo {
                        name: call.name.clone(),
                        id: call.id.clone(),
                        input: call.input.clone(),
                    },
                    result: ToolResultInfo {
                        content: executed.content.clone(),
                        is_error: executed.is_error,
                    },
                });
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: executed.tool_use_id,
                    content: executed.content,
                    is_error: executed.is_error,
                });
            }

            // A consumer gone mid-tools: results stand, session untouched.
            if cancel.is_cancelled() {
                return None;
            }

            // Splice the exchange onto the working tail. The cache marker
            // migrates to the newest tool-result message so the next
            // iteration shares this prefix byte-for-byte.
            for msg in &mut tool_tail {
                msg.clear_cache_marks();
            }
            tool_tail.push(PromptMessage::from_blocks(
                ApiRole::Assistant,
                response.content_blocks.clone(),
            ));
            let mut result_msg =
                PromptMessage::from_blocks(ApiRole::User, result_blocks.clone());
            result_msg.mark_cache();
            tool_tail.push(result_msg);

            session_exchanges.push((response.content_blocks.clone(), result_blocks));
        }

        // Iterations exhausted without a terminal response.
        warn!(max_iterations, "tool loop hit maximum iterations");
        self.finish_turn(
            session,
            user_message,
            &session_exchanges,
            &full_content,
            consolidate,
        );
        let _ = emit(
            &tx,
            TurnEvent::Done {
                content: full_content.clone(),
                model: session.model.clone(),
                usage: Usage::default(),
                stop_reason: "max_iterations".to_string(),
                tool_uses: if accumulated_tool_uses.is_empty() {
                    None
                } else {
                    Some(accumulated_tool_uses)
                },
            },
        )
        .await;

        Some(StreamTurnSummary {
            content: full_content,
            tool_exchanges: session_exchanges,
            stop_reason: "max_iterations".to_string(),
        })
    }

    /// Run one streamed LLM call, relaying events. Returns the assembled
    /// response, or the reason the turn must stop.
    async fn stream_one_iteration(
        &self,
        request: ChatRequest,
        iteration: usize,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> IterationEnd {
        if cancel.is_cancelled() {
            return IterationEnd::Cancelled;
        }

        let (etx, mut erx) = mpsc::channel::<StreamEvent>(64);
        let provider = self.provider.clone();
        let handle = tokio::spawn(async move { provider.send_stream(&request, etx).await });

        let mut done: Option<(ChatResponse, bool)> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Stop at the next token boundary; session untouched.
                    handle.abort();
                    return IterationEnd::Cancelled;
                }
                event = erx.recv() => match event {
                    None => break,
                    Some(StreamEvent::Start { model }) => {
                        if iteration == 1 && !emit(tx, TurnEvent::Start { model }).await {
                            return IterationEnd::Failed;
                        }
                    }
                    Some(StreamEvent::TextDelta { text }) => {
                        if !emit(tx, TurnEvent::Token { content: text }).await {
                            return IterationEnd::Failed;
                        }
                    }
                    Some(StreamEvent::ToolUseStart { id, name }) => {
                        // Input arrives once the block's JSON completes.
                        if !emit(tx, TurnEvent::ToolStart {
                            tool_name: name,
                            tool_id: id,
                            input: serde_json::json!({}),
                        })
                        .await
                        {
                            return IterationEnd::Failed;
                        }
                    }
                    Some(StreamEvent::Done { response, truncated_tool_use }) => {
                        done = Some((response, truncated_tool_use));
                    }
                    Some(StreamEvent::Error { message }) => {
                        let _ = emit(tx, TurnEvent::Error { error: message }).await;
                        return IterationEnd::Failed;
                    }
                }
            }
        }

        // Surface transport errors that pre-empted any stream event.
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if done.is_none() {
                    let _ = emit(tx, TurnEvent::Error { error: e.to_string() }).await;
                    return IterationEnd::Failed;
                }
            }
            Err(e) => {
                let _ = emit(tx, TurnEvent::Error { error: e.to_string() }).await;
                return IterationEnd::Failed;
            }
        }

        match done {
            Some((response, truncated)) => IterationEnd::Completed { response, truncated },
            None => {
                let _ = emit(
                    tx,
                    TurnEvent::Error {
                        error: "stream ended without completion".to_string(),
                    },
                )
                .await;
                IterationEnd::Failed
            }
        }
    }

    /// Terminal session mutation: the user turn, every structured tool
    /// exchange, the final assistant text, then the breakpoint policy.
    fn finish_turn(
        &self,
        session: &mut Session,
        user_message: Option<&str>,
        exchanges: &[(Vec<ContentBlock>, Vec<ContentBlock>)],
        assistant_content: &str,
        consolidate: bool,
    ) {
        if let Some(user_message) = user_message {
            session.push_user_turn(user_message);
        }
        for (assistant_blocks, result_blocks) in exchanges {
            session.add_tool_exchange(assistant_blocks.clone(), result_blocks.clone());
        }
        session.push_assistant_turn(assistant_content);
        session.advance_cache_after_turn(consolidate);
    }
}

enum IterationEnd {
    Completed {
        response: ChatResponse,
        truncated: bool,
    },
    Cancelled,
    Failed,
}

fn memories_event(session: &Session, outcome: &RetrievalOutcome) -> TurnEvent {
    TurnEvent::Memories {
        entity_id: if session.is_multi_entity {
            session.entity_id.clone()
        } else {
            None
        },
        entity_label: if session.is_multi_entity {
            session.responding_entity_label.clone()
        } else {
            None
        },
        new_memories: outcome
            .new_memories
            .iter()
            .map(MemoryInfo::from_entry)
            .collect(),
        total_in_context: session.in_context_ids.len(),
        trimmed_memory_ids: outcome.trimmed_memory_ids.clone(),
        trimmed_context_messages: outcome.trimmed_context_messages,
    }
}

/// Deliver an event. Token events are droppable under backpressure;
/// everything else blocks until the consumer takes it. Returns false when
/// the consumer is gone.
async fn emit(tx: &mpsc::Sender<TurnEvent>, event: TurnEvent) -> bool {
    if event.droppable() {
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true, // slow consumer, drop
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    } else {
        tx.send(event).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use anima_core::content::MessageContent;
    use crate::assemble::PromptBlock;
    use crate::provider::ToolCall;
    use crate::tools::{Tool, ToolCategory, ToolResult};

    /// Plays back a fixed sequence of responses and records every request.
    struct ScriptedProvider {
        responses: Mutex<VecDeque<ChatResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.requests.lock().unwrap().push(req.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ProviderError::Parse("script exhausted".to_string()))
        }

        async fn send_stream(
            &self,
            req: &ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            let response = {
                self.requests.lock().unwrap().push(req.clone());
                self.responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .ok_or_else(|| ProviderError::Parse("script exhausted".to_string()))?
            };
            let _ = tx
                .send(StreamEvent::Start {
                    model: response.model.clone(),
                })
                .await;
            if !response.content.is_empty() {
                let _ = tx
                    .send(StreamEvent::TextDelta {
                        text: response.content.clone(),
                    })
                    .await;
            }
            let _ = tx
                .send(StreamEvent::Done {
                    response,
                    truncated_tool_use: false,
                })
                .await;
            Ok(())
        }
    }

    struct FixedTool;

    #[async_trait]
    impl Tool for FixedTool {
        fn name(&self) -> &str {
            "web_search"
        }
        fn description(&self) -> &str {
            "test search"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::Web
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            ToolResult::ok("search says: 42")
        }
    }

    fn text_response(content: &str, stop_reason: &str) -> ChatResponse {
        ChatResponse {
            content: content.to_string(),
            content_blocks: vec![ContentBlock::Text {
                text: content.to_string(),
            }],
            tool_calls: Vec::new(),
            model: "claude-sonnet-4-5".to_string(),
            usage: Usage::default(),
            stop_reason: stop_reason.to_string(),
        }
    }

    fn tool_response(tool_id: &str) -> ChatResponse {
        let input = serde_json::json!({"query": "answer to everything"});
        ChatResponse {
            content: String::new(),
            content_blocks: vec![ContentBlock::ToolUse {
                id: tool_id.to_string(),
                name: "web_search".to_string(),
                input: input.clone(),
            }],
            tool_calls: vec![ToolCall {
                id: tool_id.to_string(),
                name: "web_search".to_string(),
                input,
            }],
            model: "claude-sonnet-4-5".to_string(),
            usage: Usage::default(),
            stop_reason: "tool_use".to_string(),
        }
    }

    fn pipeline(provider: Arc<ScriptedProvider>) -> Pipeline {
        Pipeline {
            db: Arc::new(Database::open_in_memory().expect("db")),
            store: None,
            provider,
            config: Arc::new(AnimaConfig::default()),
            counter: Arc::new(TokenCounter::new()),
            notes: Arc::new(NotesProvider::disabled()),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn first_turn_streams_and_bootstraps_cache() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_response(
            "Hi there!",
            "end_turn",
        )]));
        let pipeline = pipeline(provider.clone());
        let mut session = Session::new("c1", "claude-sonnet-4-5", 1.0, 4096);

        let (tx, rx) = mpsc::channel(64);
        let summary = pipeline
            .process_message_stream(
                &mut session,
                Some("Hello"),
                None,
                Vec::new(),
                tx,
                CancellationToken::new(),
            )
            .await;

        let summary = summary.expect("completed turn");
        assert_eq!(summary.content, "Hi there!");
        assert!(summary.tool_exchanges.is_empty());

        let events = drain(rx).await;
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["memories", "start", "token", "done"]);

        match &events[0] {
            TurnEvent::Memories {
                new_memories,
                total_in_context,
                ..
            } => {
                assert!(new_memories.is_empty());
                assert_eq!(*total_in_context, 0);
            }
            other => panic!("expected memories event, got {other:?}"),
        }
        match events.last() {
            Some(TurnEvent::Done {
                content,
                stop_reason,
                tool_uses,
                ..
            }) => {
                assert_eq!(content, "Hi there!");
                assert_eq!(stop_reason, "end_turn");
                assert!(tool_uses.is_none());
            }
            other => panic!("expected done event, got {other:?}"),
        }

        assert_eq!(session.rolling_context.len(), 2);
        assert_eq!(session.last_cached_context_length, 2);
        assert!(session.retrieved_ids.is_empty());

        // First-turn prompt: one composite message, no memories block.
        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn tool_loop_marks_tool_results_and_suppresses_memories() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_response("tu_1"),
            text_response("Done.", "end_turn"),
        ]));
        let pipeline = pipeline(provider.clone());

        let mut session = Session::new("c1", "claude-sonnet-4-5", 1.0, 4096);
        // One memory in context so suppression is observable.
        session.add_memory(anima_memory::types::MemoryEntry {
            id: "m1".to_string(),
            conversation_id: "other".to_string(),
            role: "assistant".to_string(),
            content: "an old fact".to_string(),
            created_at: Utc::now(),
            times_retrieved: 1,
            score: 0.9,
            significance: 0.1,
            combined_score: 1.0,
            days_since_creation: 1.0,
            days_since_retrieval: None,
            source: anima_memory::types::MemorySource::User,
        });

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FixedTool));

        let (tx, rx) = mpsc::channel(64);
        let summary = pipeline
            .process_message_stream(
                &mut session,
                Some("what is the answer?"),
                Some(&registry),
                Vec::new(),
                tx,
                CancellationToken::new(),
            )
            .await;

        let summary = summary.expect("completed turn");
        assert_eq!(summary.tool_exchanges.len(), 1);
        assert_eq!(summary.stop_reason, "end_turn");

        let events = drain(rx).await;
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["memories", "start", "tool_start", "tool_result", "token", "done"]
        );

        match events.last() {
            Some(TurnEvent::Done {
                content, tool_uses, ..
            }) => {
                assert_eq!(content, "Done.");
                let uses = tool_uses.as_ref().expect("tool uses recorded");
                assert_eq!(uses.len(), 1);
                assert_eq!(uses[0].call.name, "web_search");
                assert_eq!(uses[0].result.content, "search says: 42");
            }
            other => panic!("expected done event, got {other:?}"),
        }

        // Iteration 1 carries the memories block; iteration 2 does not,
        // and ends with a cache-marked tool_result user message.
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);

        let first_text = prompt_text(&requests[0]);
        assert!(first_text.contains("[MEMORIES FROM PREVIOUS CONVERSATIONS]"));

        let second_text = prompt_text(&requests[1]);
        assert!(!second_text.contains("[MEMORIES FROM PREVIOUS CONVERSATIONS]"));

        let last_msg = requests[1].messages.last().expect("tool tail");
        assert_eq!(last_msg.role, ApiRole::User);
        let last_block: &PromptBlock = last_msg.blocks.last().expect("result block");
        assert!(last_block.cache);
        assert!(matches!(
            last_block.block,
            ContentBlock::ToolResult { .. }
        ));

        // Rolling context: user turn, tool exchange (2 structured msgs),
        // then the plain assistant text.
        assert_eq!(session.rolling_context.len(), 4);
        assert!(matches!(
            session.rolling_context[1].content,
            MessageContent::Blocks(_)
        ));
        assert!(matches!(
            session.rolling_context[2].content,
            MessageContent::Blocks(_)
        ));
        assert_eq!(
            session.rolling_context[3].content.as_text(),
            Some("Done.")
        );
    }

    #[tokio::test]
    async fn cancelled_turn_leaves_session_untouched() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_response(
            "never delivered",
            "end_turn",
        )]));
        let pipeline = pipeline(provider);
        let mut session = Session::new("c1", "claude-sonnet-4-5", 1.0, 4096);
        session.add_exchange(Some("before"), "turn");
        session.advance_cache_after_turn(false);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, rx) = mpsc::channel(64);
        let summary = pipeline
            .process_message_stream(
                &mut session,
                Some("doomed"),
                None,
                Vec::new(),
                tx,
                cancel,
            )
            .await;
        assert!(summary.is_none());

        let events = drain(rx).await;
        // Memories went out before the LLM call; nothing terminal after.
        assert!(events.iter().all(|e| e.name() != "done"));
        assert_eq!(session.rolling_context.len(), 2);
        assert_eq!(session.last_cached_context_length, 2);
    }

    #[tokio::test]
    async fn exhausted_iterations_end_with_max_iterations() {
        // Every response asks for tools; the loop must give up.
        let mut config = AnimaConfig::default();
        config.retrieval.tool_use_max_iterations = 2;

        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_response("tu_1"),
            tool_response("tu_2"),
        ]));
        let mut pipeline = pipeline(provider);
        pipeline.config = Arc::new(config);

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FixedTool));

        let mut session = Session::new("c1", "claude-sonnet-4-5", 1.0, 4096);
        let (tx, rx) = mpsc::channel(64);
        pipeline
            .process_message_stream(
                &mut session,
                Some("loop forever"),
                Some(&registry),
                Vec::new(),
                tx,
                CancellationToken::new(),
            )
            .await;

        let events = drain(rx).await;
        match events.last() {
            Some(TurnEvent::Done {
                stop_reason,
                tool_uses,
                ..
            }) => {
                assert_eq!(stop_reason, "max_iterations");
                assert_eq!(tool_uses.as_ref().map(Vec::len), Some(2));
            }
            other => panic!("expected done event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_streaming_turn_returns_structured_output() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_response(
            "plain reply",
            "end_turn",
        )]));
        let pipeline = pipeline(provider);
        let mut session = Session::new("c1", "claude-sonnet-4-5", 1.0, 4096);

        let output = pipeline
            .process_message(&mut session, Some("hello"), Vec::new())
            .await
            .expect("turn");

        assert_eq!(output.content, "plain reply");
        assert_eq!(output.stop_reason, "end_turn");
        assert_eq!(output.total_memories_in_context, 0);
        assert_eq!(session.rolling_context.len(), 2);
    }

    fn prompt_text(request: &ChatRequest) -> String {
        request
            .messages
            .iter()
            .flat_map(|m| m.blocks.iter())
            .filter_map(|b| match &b.block {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
