//! POST /stream — the streaming turn over Server-Sent Events.
//!
//! Every outcome is delivered in-stream (`error` events rather than HTTP
//! status codes), so clients need a single code path. After a successful
//! turn the `stored` event carries the new message ids.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::warn;

use anima_agent::events::TurnEvent;
use anima_core::error::AnimaError;

use crate::app::AppState;
use crate::attach::apply_attachments;
use crate::persist::{store_turn, stored_event_payload, TurnToStore};

use super::{check_auth, error_body, prepare_turn, ChatTurnRequest, TurnGuard};

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatTurnRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        if !check_auth(&state, &headers) {
            yield Ok(error_event("Unauthorized"));
            return;
        }

        let (message, image_blocks) =
            apply_attachments(req.message.clone(), req.attachments.clone());

        let setup = match prepare_turn(&state, &req, message.is_some()).await {
            Ok(setup) => setup,
            Err(e) => {
                yield Ok(error_event_for(&e));
                return;
            }
        };

        // Dropping the guard (turn done OR client gone) cancels the
        // pipeline and frees the conversation for the next turn.
        let (_guard, cancel) = TurnGuard::register(state.clone(), req.conversation_id.clone());

        let registry = {
            let session = setup.session.lock().await;
            state.build_tools(
                &req.conversation_id,
                session.entity_id.as_deref(),
                setup.is_multi_entity,
            )
        };

        let (tx, mut rx) = mpsc::channel::<TurnEvent>(64);
        let pipeline = state.pipeline.clone();
        let session_arc = setup.session.clone();
        let turn_message = message.clone();
        let task = tokio::spawn(async move {
            let mut session = session_arc.lock().await;
            pipeline
                .process_message_stream(
                    &mut session,
                    turn_message.as_deref(),
                    Some(&registry),
                    image_blocks,
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
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "turn task panicked");
                yield Ok(error_event_for(&AnimaError::Internal(e.to_string())));
                return;
            }
        };

        let Some(summary) = summary else {
            // Cancelled or failed — nothing to persist, no stored event.
            return;
        };
        if failed {
            return;
        }

        match store_turn(
            &state,
            TurnToStore {
                conversation_id: req.conversation_id.clone(),
                human_content: message,
                tool_exchanges: summary.tool_exchanges,
                assistant_content: summary.content,
                speaker_entity_id: setup.responding_entity_id.clone(),
                target_entities: setup.target_entities.clone(),
            },
        )
        .await
        {
            Ok(stored) => {
                let payload =
                    stored_event_payload(&state, &stored, setup.responding_entity_id.as_deref());
                yield Ok(Event::default().event("stored").data(payload.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "persistence failed after successful turn");
                yield Ok(error_event_for(&AnimaError::Database(e.to_string())));
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub(crate) fn turn_event_to_sse(event: &TurnEvent) -> Event {
    let data = serde_json::to_string(event)
        .unwrap_or_else(|_| "{\"type\":\"error\",\"error\":\"serialization failed\"}".to_string());
    Event::default().event(event.name()).data(data)
}

pub(crate) fn error_event(message: &str) -> Event {
    Event::default()
        .event("error")
        .data(serde_json::json!({ "error": message }).to_string())
}

/// SSE error event carrying the shared error body (message + code).
pub(crate) fn error_event_for(err: &AnimaError) -> Event {
    Event::default().event("error").data(error_body(err).to_string())
}
