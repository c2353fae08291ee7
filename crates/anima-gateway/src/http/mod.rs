pub mod health;
pub mod regenerate;
pub mod send;
pub mod session;
pub mod stream;

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use anima_core::error::AnimaError;
use anima_db::ConversationKind;
use anima_session::Session;

use crate::app::AppState;
use crate::attach::Attachment;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/send", post(send::send_handler))
        .route("/stream", post(stream::stream_handler))
        .route("/regenerate", post(regenerate::regenerate_handler))
        .route("/session/{conversation_id}", get(session::info_handler))
        .route(
            "/session/{conversation_id}/close",
            post(session::close_handler),
        )
        .route("/health", get(health::health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Shared request shape for /send and /stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatTurnRequest {
    pub conversation_id: String,
    /// May be null only for multi-entity continuations.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub verbosity: Option<String>,
    /// Required for multi-entity conversations.
    #[serde(default)]
    pub responding_entity_id: Option<String>,
    #[serde(default)]
    pub user_display_name: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Returns true if the request is authorised. Token mode only; `None`
/// disables auth for local development.
pub fn check_auth(state: &AppState, headers: &HeaderMap) -> bool {
    match &state.config.gateway.auth_token {
        None => true,
        Some(expected) => headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| token == expected)
            .unwrap_or(false),
    }
}

/// HTTP status for an error, standard semantics per kind.
pub fn status_for(err: &AnimaError) -> StatusCode {
    match err {
        AnimaError::ConversationNotFound { .. } | AnimaError::MessageNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        AnimaError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        AnimaError::Busy { .. } => StatusCode::CONFLICT,
        AnimaError::Provider(_) => StatusCode::BAD_GATEWAY,
        AnimaError::Config(_) | AnimaError::Database(_) | AnimaError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// JSON error body shared by HTTP responses and SSE error events.
pub fn error_body(err: &AnimaError) -> serde_json::Value {
    json!({ "error": err.to_string(), "code": err.code() })
}

/// Everything a turn handler needs after validation.
#[derive(Debug)]
pub struct TurnSetup {
    pub is_multi_entity: bool,
    pub responding_entity_id: Option<String>,
    pub session: Arc<tokio::sync::Mutex<Session>>,
    /// Entities whose indexes receive this turn's new memories.
    pub target_entities: Vec<String>,
}

/// Validate the request, resolve (or rebuild) the session, and apply
/// per-request overrides. `has_message` reflects the effective message
/// after text attachments were inlined.
pub async fn prepare_turn(
    state: &AppState,
    req: &ChatTurnRequest,
    has_message: bool,
) -> Result<TurnSetup, AnimaError> {
    let conversation = state
        .db
        .get_conversation(&req.conversation_id)
        .map_err(|e| AnimaError::Database(e.to_string()))?
        .ok_or_else(|| AnimaError::ConversationNotFound {
            id: req.conversation_id.clone(),
        })?;

    let is_multi_entity = conversation.kind == ConversationKind::MultiEntity;

    if !has_message && !is_multi_entity {
        return Err(AnimaError::InvalidRequest(
            "Continuation without message requires multi-entity conversation".to_string(),
        ));
    }

    let mut participants: Vec<String> = Vec::new();
    if is_multi_entity {
        participants = state
            .db
            .participants(&req.conversation_id)
            .map_err(|e| AnimaError::Database(e.to_string()))?;
        if participants.is_empty() {
            return Err(AnimaError::InvalidRequest(
                "Multi-entity conversation has no entities".to_string(),
            ));
        }
        match &req.responding_entity_id {
            None => {
                return Err(AnimaError::InvalidRequest(
                    "responding_entity_id is required for multi-entity conversations".to_string(),
                ));
            }
            Some(rid) if !participants.contains(rid) => {
                return Err(AnimaError::InvalidRequest(format!(
                    "Entity '{rid}' is not part of this conversation"
                )));
            }
            Some(_) => {}
        }
    }

    // One turn at a time per conversation — concurrent callers fail fast.
    if state.active_turns.contains_key(&req.conversation_id) {
        return Err(AnimaError::Busy {
            id: req.conversation_id.clone(),
        });
    }

    let responding_entity_id = if is_multi_entity {
        req.responding_entity_id.clone()
    } else {
        None
    };

    // Reuse the live session unless the responding entity changed — then
    // rebuild for the new entity, preserving the cache breakpoint.
    let mut preserve_cache_length: Option<usize> = None;
    let mut session = state.sessions.get(&req.conversation_id);
    if is_multi_entity {
        if let Some(handle) = session.clone() {
            let current = handle.lock().await;
            if current.entity_id != responding_entity_id {
                preserve_cache_length = Some(current.last_cached_context_length);
                drop(current);
                state.sessions.close(&req.conversation_id);
                session = None;
            }
        }
    }

    let session = match session {
        Some(handle) => handle,
        None => state
            .sessions
            .load_from_db(
                &req.conversation_id,
                &state.db,
                responding_entity_id.as_deref(),
                preserve_cache_length,
            )
            .map_err(|e| AnimaError::Database(e.to_string()))?
            .ok_or_else(|| AnimaError::ConversationNotFound {
                id: req.conversation_id.clone(),
            })?,
    };

    {
        let mut s = session.lock().await;

        if is_multi_entity {
            if let Some(rid) = &responding_entity_id {
                s.entity_id = Some(rid.clone());
                s.is_multi_entity = true;
                s.entity_labels = participants
                    .iter()
                    .map(|eid| {
                        let label = state
                            .config
                            .entity_by_index(eid)
                            .map(|e| e.label.clone())
                            .unwrap_or_else(|| eid.clone());
                        (eid.clone(), label)
                    })
                    .collect();
                s.responding_entity_label = s.entity_labels.get(rid).cloned();
                s.model = state.config.model_for_entity(rid);
            }
        }

        if let Some(model) = &req.model {
            s.model = model.clone();
        }
        if let Some(temperature) = req.temperature {
            s.temperature = temperature;
        }
        if let Some(max_tokens) = req.max_tokens {
            s.max_tokens = max_tokens;
        }
        if let Some(prompt) = &req.system_prompt {
            s.system_prompt = Some(prompt.clone());
        }
        if let Some(verbosity) = &req.verbosity {
            s.verbosity = Some(verbosity.clone());
        }
        if let Some(name) = &req.user_display_name {
            s.user_display_name = Some(name.clone());
        }
    }

    let target_entities = if is_multi_entity {
        participants
    } else {
        conversation
            .entity_id
            .clone()
            .or_else(|| state.config.default_entity().map(|e| e.index_name.clone()))
            .into_iter()
            .collect()
    };

    Ok(TurnSetup {
        is_multi_entity,
        responding_entity_id,
        session,
        target_entities,
    })
}

/// RAII registration of an in-flight turn. Dropping cancels the turn and
/// frees the conversation — covers both completion and client disconnect.
pub struct TurnGuard {
    state: Arc<AppState>,
    conversation_id: String,
    cancel: tokio_util::sync::CancellationToken,
}

impl TurnGuard {
    pub fn register(
        state: Arc<AppState>,
        conversation_id: String,
    ) -> (Self, tokio_util::sync::CancellationToken) {
        let cancel = tokio_util::sync::CancellationToken::new();
        state
            .active_turns
            .insert(conversation_id.clone(), cancel.clone());
        (
            Self {
                state,
                conversation_id,
                cancel: cancel.clone(),
            },
            cancel,
        )
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.state.active_turns.remove(&self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    use anima_agent::anthropic::AnthropicProvider;
    use anima_agent::notes::NotesProvider;
    use anima_agent::turn::Pipeline;
    use anima_core::config::{AnimaConfig, EntityConfig};
    use anima_core::tokens::TokenCounter;
    use anima_db::{Conversation, Database};
    use anima_session::SessionTable;
    use dashmap::DashMap;

    fn test_state() -> Arc<AppState> {
        let mut config = AnimaConfig::default();
        config.entities = vec![
            EntityConfig {
                index_name: "aria-memories".to_string(),
                label: "Aria".to_string(),
                description: None,
                provider: "anthropic".to_string(),
                default_model: None,
                host: None,
            },
            EntityConfig {
                index_name: "sol-memories".to_string(),
                label: "Sol".to_string(),
                description: None,
                provider: "anthropic".to_string(),
                default_model: None,
                host: None,
            },
        ];
        let config = Arc::new(config);
        let db = Arc::new(Database::open_in_memory().expect("db"));
        let pipeline = Pipeline {
            db: db.clone(),
            store: None,
            provider: Arc::new(AnthropicProvider::new("test-key".to_string(), None)),
            config: config.clone(),
            counter: Arc::new(TokenCounter::new()),
            notes: Arc::new(NotesProvider::disabled()),
        };
        Arc::new(AppState {
            sessions: SessionTable::new(config.clone()),
            config,
            db,
            store: None,
            pipeline,
            active_turns: DashMap::new(),
        })
    }

    fn seed_conversation(state: &AppState, id: &str, kind: anima_db::ConversationKind) {
        let now = Utc::now();
        state
            .db
            .create_conversation(&Conversation {
                id: id.to_string(),
                entity_id: match kind {
                    anima_db::ConversationKind::MultiEntity => Some("multi-entity".to_string()),
                    _ => Some("aria-memories".to_string()),
                },
                kind,
                title: None,
                llm_model_used: None,
                system_prompt_used: None,
                entity_system_prompts: None,
                is_archived: false,
                created_at: now,
                updated_at: now,
            })
            .expect("create conversation");
    }

    fn request(conversation_id: &str, message: Option<&str>) -> ChatTurnRequest {
        ChatTurnRequest {
            conversation_id: conversation_id.to_string(),
            message: message.map(String::from),
            model: None,
            temperature: None,
            max_tokens: None,
            system_prompt: None,
            verbosity: None,
            responding_entity_id: None,
            user_display_name: None,
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn missing_conversation_is_not_found() {
        let state = test_state();
        let err = prepare_turn(&state, &request("ghost", Some("hi")), true)
            .await
            .expect_err("should fail");
        assert!(matches!(err, AnimaError::ConversationNotFound { .. }));
    }

    #[tokio::test]
    async fn continuation_rejected_for_single_entity() {
        let state = test_state();
        seed_conversation(&state, "c1", ConversationKind::Normal);
        let err = prepare_turn(&state, &request("c1", None), false)
            .await
            .expect_err("should fail");
        assert!(matches!(err, AnimaError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn multi_entity_requires_responding_entity() {
        let state = test_state();
        seed_conversation(&state, "m1", ConversationKind::MultiEntity);
        state.db.add_participant("m1", "aria-memories", 0).expect("add");
        state.db.add_participant("m1", "sol-memories", 1).expect("add");

        let err = prepare_turn(&state, &request("m1", Some("hi")), true)
            .await
            .expect_err("should fail");
        assert!(matches!(err, AnimaError::InvalidRequest(_)));

        let mut req = request("m1", Some("hi"));
        req.responding_entity_id = Some("nova-memories".to_string());
        let err = prepare_turn(&state, &req, true).await.expect_err("should fail");
        assert!(matches!(err, AnimaError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn multi_entity_continuation_is_accepted() {
        let state = test_state();
        seed_conversation(&state, "m2", ConversationKind::MultiEntity);
        state.db.add_participant("m2", "aria-memories", 0).expect("add");
        state.db.add_participant("m2", "sol-memories", 1).expect("add");

        let mut req = request("m2", None);
        req.responding_entity_id = Some("sol-memories".to_string());
        let setup = prepare_turn(&state, &req, false).await.expect("setup");
        assert!(setup.is_multi_entity);
        assert_eq!(setup.responding_entity_id.as_deref(), Some("sol-memories"));
        assert_eq!(setup.target_entities.len(), 2);

        let session = setup.session.lock().await;
        assert_eq!(session.responding_entity_label.as_deref(), Some("Sol"));
        assert_eq!(session.entity_id.as_deref(), Some("sol-memories"));
    }

    #[tokio::test]
    async fn concurrent_turn_fails_fast_with_busy() {
        let state = test_state();
        seed_conversation(&state, "c2", ConversationKind::Normal);
        state
            .active_turns
            .insert("c2".to_string(), CancellationToken::new());

        let err = prepare_turn(&state, &request("c2", Some("hi")), true)
            .await
            .expect_err("should fail");
        assert!(matches!(err, AnimaError::Busy { .. }));
    }

    #[tokio::test]
    async fn overrides_apply_to_the_session() {
        let state = test_state();
        seed_conversation(&state, "c3", ConversationKind::Normal);

        let mut req = request("c3", Some("hi"));
        req.model = Some("claude-opus-4-1".to_string());
        req.temperature = Some(0.2);
        req.user_display_name = Some("River".to_string());
        let setup = prepare_turn(&state, &req, true).await.expect("setup");

        let session = setup.session.lock().await;
        assert_eq!(session.model, "claude-opus-4-1");
        assert_eq!(session.temperature, 0.2);
        assert_eq!(session.user_display_name.as_deref(), Some("River"));
        assert_eq!(setup.target_entities, vec!["aria-memories".to_string()]);
    }
}
