//! POST /regenerate — delete a prior assistant reply and re-run the turn.
//!
//! The request names either the assistant message to regenerate or the
//! human message whose reply should be regenerated. The old reply is
//! removed from the database AND from every affected entity index before
//! the streaming pipeline runs again.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use anima_agent::events::TurnEvent;
use anima_core::content::ApiRole;
use anima_core::error::AnimaError;
use anima_db::{ConversationKind, MessageRecord, MessageRole};

use crate::app::AppState;
use crate::persist::{store_turn, TurnToStore};

use super::stream::{error_event, error_event_for, turn_event_to_sse};
use super::{check_auth, TurnGuard};

#[derive(Debug, Clone, Deserialize)]
pub struct RegenerateRequest {
    /// An assistant message id (regenerate that reply) or a human message
    /// id (regenerate the reply to it).
    pub message_id: String,
    #[serde(default)]
    pub responding_entity_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub user_display_name: Option<String>,
}

pub async fn regenerate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegenerateRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        if !check_auth(&state, &headers) {
            yield Ok(error_event("Unauthorized"));
            return;
        }

        let anchor = match state.db.get_message(&req.message_id) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                yield Ok(error_event_for(&AnimaError::MessageNotFound {
                    id: req.message_id.clone(),
                }));
                return;
            }
            Err(e) => {
                yield Ok(error_event_for(&AnimaError::Database(e.to_string())));
                return;
            }
        };
        let conversation_id = anchor.conversation_id.clone();

        let conversation = match state.db.get_conversation(&conversation_id) {
            Ok(Some(c)) => c,
            Ok(None) => {
                yield Ok(error_event_for(&AnimaError::ConversationNotFound {
                    id: conversation_id.clone(),
                }));
                return;
            }
            Err(e) => {
                yield Ok(error_event_for(&AnimaError::Database(e.to_string())));
                return;
            }
        };

        let is_multi_entity = conversation.kind == ConversationKind::MultiEntity;
        let mut participants: Vec<String> = Vec::new();
        if is_multi_entity {
            participants = match state.db.participants(&conversation_id) {
                Ok(p) if !p.is_empty() => p,
                Ok(_) => {
                    yield Ok(error_event_for(&AnimaError::InvalidRequest(
                        "Multi-entity conversation has no entities".to_string(),
                    )));
                    return;
                }
                Err(e) => {
                    yield Ok(error_event_for(&AnimaError::Database(e.to_string())));
                    return;
                }
            };
            match &req.responding_entity_id {
                None => {
                    yield Ok(error_event_for(&AnimaError::InvalidRequest(
                        "responding_entity_id is required for multi-entity conversations"
                            .to_string(),
                    )));
                    return;
                }
                Some(rid) if !participants.contains(rid) => {
                    yield Ok(error_event_for(&AnimaError::InvalidRequest(format!(
                        "Entity '{rid}' is not part of this conversation"
                    ))));
                    return;
                }
                Some(_) => {}
            }
        }

        if state.active_turns.contains_key(&conversation_id) {
            yield Ok(error_event_for(&AnimaError::Busy {
                id: conversation_id.clone(),
            }));
            return;
        }

        // Resolve the human turn and the assistant reply to discard.
        let (human, assistant_to_delete, is_continuation) = match anchor.role {
            MessageRole::Assistant => {
                let human = match state
                    .db
                    .human_message_before(&conversation_id, anchor.created_at)
                {
                    Ok(h) => h,
                    Err(e) => {
                        yield Ok(error_event_for(&AnimaError::Database(e.to_string())));
                        return;
                    }
                };
                match human {
                    Some(human) => (Some(human), Some(anchor), false),
                    None if is_multi_entity => (None, Some(anchor), true),
                    None => {
                        yield Ok(error_event_for(&AnimaError::InvalidRequest(
                            "Cannot find human message to regenerate from".to_string(),
                        )));
                        return;
                    }
                }
            }
            MessageRole::Human => {
                let reply = match state
                    .db
                    .assistant_reply_after(&conversation_id, anchor.created_at)
                {
                    Ok(r) => r,
                    Err(e) => {
                        yield Ok(error_event_for(&AnimaError::Database(e.to_string())));
                        return;
                    }
                };
                (Some(anchor), reply, false)
            }
            _ => {
                yield Ok(error_event_for(&AnimaError::InvalidRequest(
                    "Can only regenerate from a human or assistant message".to_string(),
                )));
                return;
            }
        };

        let target_entities: Vec<String> = if is_multi_entity {
            participants.clone()
        } else {
            conversation
                .entity_id
                .clone()
                .or_else(|| state.config.default_entity().map(|e| e.index_name.clone()))
                .into_iter()
                .collect()
        };

        // Remove the stale reply everywhere before regenerating.
        if let Some(stale) = &assistant_to_delete {
            if let Err(e) = state.db.delete_message(&stale.id) {
                yield Ok(error_event_for(&AnimaError::Database(format!(
                    "could not delete prior reply: {e}"
                ))));
                return;
            }
            if let Some(store) = &state.store {
                for entity_id in &target_entities {
                    store.delete(entity_id, &stale.id).await;
                }
            }
            info!(message_id = %stale.id, "deleted prior assistant reply");
        }

        let (_guard, cancel) = TurnGuard::register(state.clone(), conversation_id.clone());

        // Rebuild the session from the post-delete database state.
        state.sessions.close(&conversation_id);
        let session_handle = match state.sessions.load_from_db(
            &conversation_id,
            &state.db,
            req.responding_entity_id.as_deref(),
            None,
        ) {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                yield Ok(error_event_for(&AnimaError::ConversationNotFound {
                    id: conversation_id.clone(),
                }));
                return;
            }
            Err(e) => {
                yield Ok(error_event_for(&AnimaError::Database(e.to_string())));
                return;
            }
        };

        {
            let mut session = session_handle.lock().await;
            if let Some(model) = &req.model {
                session.model = model.clone();
            }
            if let Some(name) = &req.user_display_name {
                session.user_display_name = Some(name.clone());
            }
            // Drop the human turn being regenerated from (and anything
            // after it) — the pipeline re-appends it on completion.
            if let Some(human) = &human {
                truncate_at_human_turn(&mut session, human);
            }
        }

        let registry = {
            let session = session_handle.lock().await;
            state.build_tools(&conversation_id, session.entity_id.as_deref(), is_multi_entity)
        };

        let user_message: Option<String> = if is_continuation {
            None
        } else {
            human.as_ref().map(|h| h.content.clone())
        };

        let (tx, mut rx) = mpsc::channel::<TurnEvent>(64);
        let pipeline = state.pipeline.clone();
        let session_arc = session_handle.clone();
        let turn_message = user_message.clone();
        let task = tokio::spawn(async move {
            let mut session = session_arc.lock().await;
            pipeline
                .process_message_stream(
                    &mut session,
                    turn_message.as_deref(),
                    Some(&registry),
                    Vec::new(),
                    tx,
                    cancel,
                )
                .await
        });

        let mut failed = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, TurnEvent::Error { .. }) {
                failed = true;
            }
            yield Ok(turn_event_to_sse(&event));
        }

        let summary = match task.await {
            Ok(Some(summary)) if !failed => summary,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "regenerate task panicked");
                yield Ok(error_event_for(&AnimaError::Internal(e.to_string())));
                return;
            }
        };

        // Persist only the new assistant reply — the human row survived.
        match store_turn(
            &state,
            TurnToStore {
                conversation_id: conversation_id.clone(),
                human_content: None,
                tool_exchanges: summary.tool_exchanges,
                assistant_content: summary.content,
                speaker_entity_id: req.responding_entity_id.clone(),
                target_entities,
            },
        )
        .await
        {
            Ok(stored) => {
                let mut payload = json!({ "message_id": stored.assistant.id });
                if !is_continuation {
                    if let Some(human) = &human {
                        payload["human_message_id"] = json!(human.id);
                    }
                }
                if let Some(rid) = &req.responding_entity_id {
                    payload["speaker_entity_id"] = json!(rid);
                    payload["speaker_label"] = json!(state
                        .config
                        .entity_by_index(rid)
                        .map(|e| e.label.clone())
                        .unwrap_or_else(|| rid.clone()));
                }
                yield Ok(Event::default().event("stored").data(payload.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "persistence failed after regenerate");
                yield Ok(error_event_for(&AnimaError::Database(e.to_string())));
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Truncate the rolling context at the given human turn, dropping the turn
/// itself and everything after it. The context stores multi-entity turns
/// with speaker prefixes, so match both renderings.
fn truncate_at_human_turn(session: &mut anima_session::Session, human: &MessageRecord) {
    let plain = human.content.as_str();
    let labelled = format!("[Human]: {plain}");

    let position = session
        .rolling_context
        .iter()
        .rposition(|m| {
            m.role == ApiRole::User
                && m.content
                    .as_text()
                    .map(|t| t == plain || t == labelled)
                    .unwrap_or(false)
        });

    if let Some(idx) = position {
        session.rolling_context.truncate(idx);
        let current = session.last_cached_context_length;
        session.set_cached_context_length(current);
    }
}
