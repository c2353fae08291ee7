//! Post-turn persistence.
//!
//! Ordering: (1) message rows land in one transaction with
//! the conversation's updated_at bump; (2) each new human/assistant
//! message is upserted into the vector index of every relevant entity,
//! best-effort. A step-2 failure never rolls back step 1.

use serde_json::json;
use tracing::warn;

use anima_core::content::ContentBlock;
use anima_db::{Database, DbError, MessageRecord, MessageRole, NewMessage};
use anima_memory::store::UpsertRecord;
use anima_memory::VectorStore;

use crate::app::AppState;

/// The messages of one completed turn, ready to persist.
pub struct TurnToStore {
    pub conversation_id: String,
    /// None on continuation turns (the human said nothing).
    pub human_content: Option<String>,
    /// Structured tool exchanges, in loop order.
    pub tool_exchanges: Vec<(Vec<ContentBlock>, Vec<ContentBlock>)>,
    pub assistant_content: String,
    /// The responding entity in multi-entity conversations.
    pub speaker_entity_id: Option<String>,
    /// Every entity whose index should receive the new memories: the
    /// participants for multi-entity, the owner otherwise.
    pub target_entities: Vec<String>,
}

pub struct StoredTurn {
    pub human: Option<MessageRecord>,
    pub assistant: MessageRecord,
}

/// Insert the turn's rows transactionally, then fan the new messages out
/// to the vector indexes.
pub async fn store_turn(
    state: &AppState,
    turn: TurnToStore,
) -> Result<StoredTurn, DbError> {
    let count = |text: &str| state.pipeline.counter.count(text);

    let human = turn
        .human_content
        .as_ref()
        .map(|content| NewMessage::human(content.clone(), count(content)));

    let mut tool_rows: Vec<NewMessage> = Vec::new();
    for (assistant_blocks, result_blocks) in &turn.tool_exchanges {
        tool_rows.push(tool_row(MessageRole::ToolUse, assistant_blocks)?);
        tool_rows.push(tool_row(MessageRole::ToolResult, result_blocks)?);
    }

    let assistant = NewMessage::assistant(
        turn.assistant_content.clone(),
        count(&turn.assistant_content),
        turn.speaker_entity_id.clone(),
    );

    let (human_record, assistant_record) =
        state
            .db
            .insert_turn(&turn.conversation_id, human, tool_rows, assistant)?;

    if let Some(store) = &state.store {
        upsert_memories(
            store,
            &turn,
            human_record.as_ref(),
            &assistant_record,
            state,
        )
        .await;
    }

    Ok(StoredTurn {
        human: human_record,
        assistant: assistant_record,
    })
}

fn tool_row(role: MessageRole, blocks: &[ContentBlock]) -> Result<NewMessage, DbError> {
    let content = serde_json::to_string(blocks)?;
    Ok(NewMessage {
        role,
        content,
        speaker_entity_id: None,
        token_count: 0,
    })
}

/// Multi-entity role labelling: the responder's own index stores its
/// reply as "assistant"; every other participant stores it under the
/// responder's display label. Human messages store as "human" everywhere.
async fn upsert_memories(
    store: &VectorStore,
    turn: &TurnToStore,
    human: Option<&MessageRecord>,
    assistant: &MessageRecord,
    state: &AppState,
) {
    let speaker_label = turn.speaker_entity_id.as_deref().map(|eid| {
        state
            .config
            .entity_by_index(eid)
            .map(|e| e.label.clone())
            .unwrap_or_else(|| eid.to_string())
    });

    for entity_id in &turn.target_entities {
        if !store.is_configured(entity_id) {
            continue;
        }

        if let (Some(human_record), Some(content)) = (human, turn.human_content.as_ref()) {
            let ok = store
                .upsert(
                    entity_id,
                    UpsertRecord {
                        id: human_record.id.clone(),
                        text: content.clone(),
                        conversation_id: turn.conversation_id.clone(),
                        created_at: human_record.created_at.to_rfc3339(),
                        role: "human".to_string(),
                        times_retrieved: 0,
                    },
                )
                .await;
            if !ok {
                warn!(entity_id, "human memory upsert failed");
            }
        }

        let assistant_role = match (&turn.speaker_entity_id, &speaker_label) {
            (Some(speaker), Some(label)) if speaker != entity_id => label.clone(),
            _ => "assistant".to_string(),
        };
        let ok = store
            .upsert(
                entity_id,
                UpsertRecord {
                    id: assistant.id.clone(),
                    text: turn.assistant_content.clone(),
                    conversation_id: turn.conversation_id.clone(),
                    created_at: assistant.created_at.to_rfc3339(),
                    role: assistant_role,
                    times_retrieved: 0,
                },
            )
            .await;
        if !ok {
            warn!(entity_id, "assistant memory upsert failed");
        }
    }
}

/// The `stored` SSE payload.
pub fn stored_event_payload(
    state: &AppState,
    stored: &StoredTurn,
    speaker_entity_id: Option<&str>,
) -> serde_json::Value {
    let mut payload = json!({
        "message_id": stored.assistant.id,
    });
    if let Some(human) = &stored.human {
        payload["human_message_id"] = json!(human.id);
    }
    if let Some(speaker) = speaker_entity_id {
        payload["speaker_entity_id"] = json!(speaker);
        payload["speaker_label"] = json!(state
            .config
            .entity_by_index(speaker)
            .map(|e| e.label.clone())
            .unwrap_or_else(|| speaker.to_string()));
    }
    payload
}
