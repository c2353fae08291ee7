//! Session inspection and lifecycle endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;

use super::check_auth;

/// GET /session/{conversation_id} — live session state, or 404 when the
/// conversation has no in-memory session.
pub async fn info_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }

    match state.sessions.get(&conversation_id) {
        Some(handle) => {
            let session = handle.lock().await;
            Ok(Json(json!({
                "conversation_id": session.conversation_id,
                "model": session.model,
                "entity_id": session.entity_id,
                "is_multi_entity": session.is_multi_entity,
                "context_messages": session.rolling_context.len(),
                "cached_context_length": session.last_cached_context_length,
                "memories_in_context": session.in_context_ids.len(),
                "memories_retrieved": session.retrieved_ids.len(),
                "busy": state.active_turns.contains_key(&conversation_id),
            })))
        }
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No active session for this conversation" })),
        )),
    }
}

/// POST /session/{conversation_id}/close — drop the in-memory session.
/// The next turn rebuilds it from the database of record.
pub async fn close_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }

    state.sessions.close(&conversation_id);
    Ok(Json(json!({ "closed": conversation_id })))
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized" })),
    )
}
