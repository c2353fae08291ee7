use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use anima_core::config::AnimaConfig;
use anima_core::content::{ApiRole, ContentBlock, ContextMessage, MessageContent};
use anima_db::{ConversationKind, Database, MessageRole};
use anima_memory::types::{MemoryEntry, MemorySource};

use crate::error::Result;
use crate::session::Session;

/// In-process table of live sessions, keyed by conversation id.
///
/// Each entry sits behind its own async mutex: a turn holds the lock for
/// its full duration, which serialises turns per conversation while turns
/// on different conversations run in parallel.
pub struct SessionTable {
    config: Arc<AnimaConfig>,
    sessions: DashMap<String, Arc<Mutex<Session>>>,
}

impl SessionTable {
    pub fn new(config: Arc<AnimaConfig>) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(conversation_id).map(|e| e.value().clone())
    }

    /// Construct a fresh session with config defaults and register it.
    pub fn create(&self, conversation_id: &str, entity_id: Option<&str>) -> Arc<Mutex<Session>> {
        let model = match entity_id {
            Some(eid) => self.config.model_for_entity(eid),
            None => self.config.chat.default_model.clone(),
        };
        let mut session = Session::new(
            conversation_id,
            model,
            self.config.chat.default_temperature,
            self.config.chat.default_max_tokens,
        );
        session.entity_id = entity_id.map(String::from);

        let handle = Arc::new(Mutex::new(session));
        self.sessions
            .insert(conversation_id.to_string(), handle.clone());
        handle
    }

    /// Drop a session from the table. In-flight turns keep their Arc.
    pub fn close(&self, conversation_id: &str) {
        if self.sessions.remove(conversation_id).is_some() {
            debug!(conversation_id, "session closed");
        }
    }

    /// Rebuild a session from the database of record: conversation row,
    /// message history, and previously retrieved memories.
    ///
    /// `responding_entity_id` picks the acting entity in multi-entity
    /// conversations. `preserve_context_cache_length` carries the cache
    /// breakpoint across an entity switch (clamped to the replayed
    /// context length); without it the breakpoint bootstraps to the full
    /// context.
    #[instrument(skip(self, db))]
    pub fn load_from_db(
        &self,
        conversation_id: &str,
        db: &Database,
        responding_entity_id: Option<&str>,
        preserve_context_cache_length: Option<usize>,
    ) -> Result<Option<Arc<Mutex<Session>>>> {
        let conversation = match db.get_conversation(conversation_id)? {
            Some(c) => c,
            None => return Ok(None),
        };

        let is_multi_entity = conversation.kind == ConversationKind::MultiEntity;

        // Build entity_id → label mapping for multi-entity conversations.
        let mut entity_labels: HashMap<String, String> = HashMap::new();
        let mut responding_entity_label: Option<String> = None;

        if is_multi_entity {
            for eid in db.participants(conversation_id)? {
                let label = self
                    .config
                    .entity_by_index(&eid)
                    .map(|e| e.label.clone())
                    .unwrap_or_else(|| eid.clone());
                entity_labels.insert(eid, label);
            }
            if let Some(rid) = responding_entity_id {
                responding_entity_label = entity_labels.get(rid).cloned();
            }
        } else if let Some(eid) = conversation.entity_id.as_deref() {
            responding_entity_label = self.config.entity_by_index(eid).map(|e| e.label.clone());
        }

        // Acting entity: the responder in multi-entity, the owner otherwise.
        let entity_id = responding_entity_id
            .map(String::from)
            .or_else(|| conversation.entity_id.clone());

        // Model: responder's configured default wins; otherwise the model
        // the conversation last used; otherwise resolve from the entity.
        let model = match responding_entity_id {
            Some(rid) => self.config.model_for_entity(rid),
            None => conversation.llm_model_used.clone().unwrap_or_else(|| {
                entity_id
                    .as_deref()
                    .map(|e| self.config.model_for_entity(e))
                    .unwrap_or_else(|| self.config.chat.default_model.clone())
            }),
        };

        // System prompt: per-entity entry wins (even an empty one), then
        // the legacy single prompt.
        let prompt_entity = responding_entity_id.or(conversation.entity_id.as_deref());
        let system_prompt = prompt_entity
            .and_then(|eid| {
                conversation
                    .entity_system_prompts
                    .as_ref()
                    .and_then(|m| m.get(eid).cloned())
            })
            .or_else(|| conversation.system_prompt_used.clone());

        let mut session = Session::new(
            conversation_id,
            model,
            self.config.chat.default_temperature,
            self.config.chat.default_max_tokens,
        );
        session.entity_id = entity_id.clone();
        session.system_prompt = system_prompt;
        session.conversation_start_date = Some(conversation.created_at);
        session.is_multi_entity = is_multi_entity;
        session.entity_labels = entity_labels.clone();
        session.responding_entity_label = responding_entity_label;

        // Replay message history in timestamp order.
        let messages = db.list_messages(conversation_id)?;
        info!(count = messages.len(), "replaying messages into session");

        for msg in &messages {
            match msg.role {
                MessageRole::Human => {
                    let content = if is_multi_entity {
                        format!("[Human]: {}", msg.content)
                    } else {
                        msg.content.clone()
                    };
                    session.rolling_context.push(ContextMessage::user(content));
                }
                MessageRole::Assistant => {
                    let content = match (&is_multi_entity, &msg.speaker_entity_id) {
                        (true, Some(speaker)) => {
                            let label = entity_labels
                                .get(speaker)
                                .cloned()
                                .unwrap_or_else(|| speaker.clone());
                            format!("[{label}]: {}", msg.content)
                        }
                        _ => msg.content.clone(),
                    };
                    session
                        .rolling_context
                        .push(ContextMessage::assistant(content));
                }
                MessageRole::ToolUse | MessageRole::ToolResult => {
                    // Tool rows persist their structured blocks as JSON.
                    match serde_json::from_str::<Vec<ContentBlock>>(&msg.content) {
                        Ok(blocks) => {
                            let role = if msg.role == MessageRole::ToolUse {
                                ApiRole::Assistant
                            } else {
                                ApiRole::User
                            };
                            session.rolling_context.push(ContextMessage {
                                role,
                                content: MessageContent::Blocks(blocks),
                            });
                        }
                        Err(e) => {
                            warn!(message_id = %msg.id, error = %e, "skipping unparseable tool row");
                        }
                    }
                }
            }
        }

        // Seed memory sets from the link table. Everything previously
        // retrieved starts in context; trimming will re-apply budgets.
        let link_filter = if is_multi_entity {
            entity_id.as_deref()
        } else {
            None
        };
        let retrieved = db.retrieved_ids(conversation_id, link_filter)?;
        for mem_id in &retrieved {
            match db.get_message(mem_id)? {
                Some(record) => {
                    session.seed_memory(MemoryEntry {
                        id: record.id.clone(),
                        conversation_id: record.conversation_id.clone(),
                        role: record.role.to_string(),
                        content: record.content.clone(),
                        created_at: record.created_at,
                        times_retrieved: record.times_retrieved,
                        score: 0.0,
                        significance: 0.0,
                        combined_score: 0.0,
                        days_since_creation: 0.0,
                        days_since_retrieval: None,
                        source: MemorySource::Unknown,
                    });
                }
                None => {
                    debug!(memory_id = %mem_id, "linked memory missing from database, skipping");
                }
            }
        }

        match preserve_context_cache_length {
            Some(preserved) => {
                session.set_cached_context_length(preserved);
                info!(
                    preserved,
                    effective = session.last_cached_context_length,
                    "preserved cache breakpoint across reload"
                );
            }
            None => {
                // Bootstrap: treat all replayed content as cached.
                let len = session.rolling_context.len();
                session.set_cached_context_length(len);
            }
        }

        let handle = Arc::new(Mutex::new(session));
        self.sessions
            .insert(conversation_id.to_string(), handle.clone());
        Ok(Some(handle))
    }
}
