//! POST /send — the non-streaming turn.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use anima_agent::events::MemoryInfo;
use anima_agent::provider::Usage;
use anima_core::error::AnimaError;

use crate::app::AppState;
use crate::attach::apply_attachments;
use crate::persist::{store_turn, TurnToStore};

use super::{check_auth, error_body, prepare_turn, status_for, ChatTurnRequest, TurnGuard};

#[derive(Serialize)]
pub struct SendResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: String,
    pub new_memories_retrieved: Vec<MemoryInfo>,
    pub total_memories_in_context: usize,
    pub trimmed_memory_ids: Vec<String>,
    pub trimmed_context_messages: usize,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_label: Option<String>,
}

fn reject(err: AnimaError) -> (StatusCode, Json<Value>) {
    (status_for(&err), Json(error_body(&err)))
}

pub async fn send_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatTurnRequest>,
) -> Result<Json<SendResponse>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        ));
    }

    let (message, image_blocks) = apply_attachments(req.message.clone(), req.attachments.clone());

    let setup = prepare_turn(&state, &req, message.is_some())
        .await
        .map_err(reject)?;

    let (_guard, _cancel) = TurnGuard::register(state.clone(), req.conversation_id.clone());

    let output = {
        let mut session = setup.session.lock().await;
        state
            .pipeline
            .process_message(&mut session, message.as_deref(), image_blocks)
            .await
            .map_err(|e| {
                warn!(error = %e, "POST /send failed");
                reject(AnimaError::Provider(e.to_string()))
            })?
    };

    let stored = store_turn(
        &state,
        TurnToStore {
            conversation_id: req.conversation_id.clone(),
            human_content: message,
            tool_exchanges: Vec::new(),
            assistant_content: output.content.clone(),
            speaker_entity_id: setup.responding_entity_id.clone(),
            target_entities: setup.target_entities.clone(),
        },
    )
    .await
    .map_err(|e| {
        warn!(error = %e, "persistence failed after successful turn");
        reject(AnimaError::Database(e.to_string()))
    })?;

    let speaker_label = setup.responding_entity_id.as_deref().map(|eid| {
        state
            .config
            .entity_by_index(eid)
            .map(|e| e.label.clone())
            .unwrap_or_else(|| eid.to_string())
    });

    Ok(Json(SendResponse {
        content: output.content,
        model: output.model,
        usage: output.usage,
        stop_reason: output.stop_reason,
        new_memories_retrieved: output.new_memories_retrieved,
        total_memories_in_context: output.total_memories_in_context,
        trimmed_memory_ids: output.trimmed_memory_ids,
        trimmed_context_messages: output.trimmed_context_messages,
        message_id: stored.assistant.id.clone(),
        human_message_id: stored.human.as_ref().map(|h| h.id.clone()),
        speaker_entity_id: setup.responding_entity_id,
        speaker_label,
    }))
}
