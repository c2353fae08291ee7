//! GET /health — liveness plus a cheap view of subsystem wiring.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "entities": state.config.entities.len(),
        "vector_store_configured": state.store.is_some(),
        "active_turns": state.active_turns.len(),
    }))
}
