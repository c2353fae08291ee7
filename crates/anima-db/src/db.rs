use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::schema;
use crate::types::{Conversation, ConversationKind, MessageRecord, MessageRole, NewMessage};

/// Database of record for conversations, messages, participants and
/// memory links.
///
/// Wraps a single SQLite connection in a `Mutex`. For high-concurrency
/// deployments consider a connection pool, but a Mutex is sufficient for
/// the single-node target — every call holds the lock only for the
/// duration of its statements.
pub struct Database {
    db: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        schema::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // ── conversations ────────────────────────────────────────────────────

    pub fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        let prompts_json = match &conversation.entity_system_prompts {
            Some(map) => Some(serde_json::to_string(map)?),
            None => None,
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations
             (id, entity_id, conversation_type, title, llm_model_used,
              system_prompt_used, entity_system_prompts, is_archived,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                conversation.id,
                conversation.entity_id,
                conversation.kind.to_string(),
                conversation.title,
                conversation.llm_model_used,
                conversation.system_prompt_used,
                prompts_json,
                conversation.is_archived as i64,
                conversation.created_at.to_rfc3339(),
                conversation.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, entity_id, conversation_type, title, llm_model_used,
                    system_prompt_used, entity_system_prompts, is_archived,
                    created_at, updated_at
             FROM conversations WHERE id = ?1",
            rusqlite::params![id],
            row_to_conversation,
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Database(e)),
        }
    }

    pub fn set_archived(&self, id: &str, archived: bool) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE conversations SET is_archived = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![archived as i64, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound {
                what: "conversation",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Archived conversation ids, filtered for one entity when given.
    ///
    /// A conversation counts as archived for entity E when its entity_id
    /// matches E, or it is multi-entity and E is a listed participant, or
    /// its entity_id is null and E is the default entity.
    pub fn archived_conversation_ids(
        &self,
        entity: Option<(&str, bool)>,
    ) -> Result<HashSet<String>> {
        let db = self.db.lock().unwrap();
        let mut out = HashSet::new();
        match entity {
            None => {
                let mut stmt =
                    db.prepare("SELECT id FROM conversations WHERE is_archived = 1")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                for row in rows {
                    out.insert(row?);
                }
            }
            Some((entity_id, is_default)) => {
                let mut stmt = db.prepare(
                    "SELECT c.id FROM conversations c
                     WHERE c.is_archived = 1
                       AND (c.entity_id = ?1
                            OR (c.conversation_type = 'multi_entity'
                                AND EXISTS (SELECT 1 FROM conversation_entities ce
                                            WHERE ce.conversation_id = c.id
                                              AND ce.entity_id = ?1))
                            OR (c.entity_id IS NULL AND ?2))",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![entity_id, is_default as i64],
                    |row| row.get::<_, String>(0),
                )?;
                for row in rows {
                    out.insert(row?);
                }
            }
        }
        Ok(out)
    }

    // ── participants ─────────────────────────────────────────────────────

    pub fn add_participant(
        &self,
        conversation_id: &str,
        entity_id: &str,
        display_order: u32,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO conversation_entities
             (conversation_id, entity_id, display_order)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![conversation_id, entity_id, display_order],
        )?;
        Ok(())
    }

    /// Participating entity ids in display order.
    pub fn participants(&self, conversation_id: &str) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT entity_id FROM conversation_entities
             WHERE conversation_id = ?1
             ORDER BY display_order",
        )?;
        let rows = stmt.query_map(rusqlite::params![conversation_id], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── messages ─────────────────────────────────────────────────────────

    /// All messages of a conversation in timestamp order.
    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, content, speaker_entity_id,
                    token_count, times_retrieved, last_retrieved_at, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(rusqlite::params![conversation_id], row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRecord>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, conversation_id, role, content, speaker_entity_id,
                    token_count, times_retrieved, last_retrieved_at, created_at
             FROM messages WHERE id = ?1",
            rusqlite::params![id],
            row_to_message,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Database(e)),
        }
    }

    /// Append a turn's messages in a single transaction, bumping the
    /// conversation's updated_at. `human` is None for multi-entity
    /// continuations. Returns the stored human/assistant records.
    pub fn insert_exchange(
        &self,
        conversation_id: &str,
        human: Option<NewMessage>,
        assistant: NewMessage,
    ) -> Result<(Option<MessageRecord>, MessageRecord)> {
        self.insert_turn(conversation_id, human, Vec::new(), assistant)
    }

    /// Full-turn insert: the human turn, any tool_use/tool_result rows the
    /// tool loop produced, and the assistant reply — one transaction, with
    /// the conversation's updated_at bump.
    #[instrument(skip_all, fields(conversation_id))]
    pub fn insert_turn(
        &self,
        conversation_id: &str,
        human: Option<NewMessage>,
        tool_messages: Vec<NewMessage>,
        assistant: NewMessage,
    ) -> Result<(Option<MessageRecord>, MessageRecord)> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let now = Utc::now();

        let human_record = match human {
            Some(msg) => Some(insert_message(&tx, conversation_id, msg, now)?),
            None => None,
        };
        for msg in tool_messages {
            insert_message(&tx, conversation_id, msg, now)?;
        }
        let assistant_record = insert_message(&tx, conversation_id, assistant, now)?;

        let changed = tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now.to_rfc3339(), conversation_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound {
                what: "conversation",
                id: conversation_id.to_string(),
            });
        }

        tx.commit()?;
        Ok((human_record, assistant_record))
    }

    /// Delete a message and its memory links (used by /regenerate).
    pub fn delete_message(&self, id: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM memory_links WHERE message_id = ?1",
            rusqlite::params![id],
        )?;
        let changed = tx.execute("DELETE FROM messages WHERE id = ?1", rusqlite::params![id])?;
        if changed == 0 {
            return Err(DbError::NotFound {
                what: "message",
                id: id.to_string(),
            });
        }
        tx.commit()?;
        Ok(())
    }

    /// The latest human message at or before `before` — the turn an
    /// assistant reply answered, when regenerating by assistant id.
    pub fn human_message_before(
        &self,
        conversation_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, conversation_id, role, content, speaker_entity_id,
                    token_count, times_retrieved, last_retrieved_at, created_at
             FROM messages
             WHERE conversation_id = ?1 AND role = 'human' AND created_at <= ?2
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1",
            rusqlite::params![conversation_id, before.to_rfc3339()],
            row_to_message,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Database(e)),
        }
    }

    /// The first assistant message at or after `after` — the reply to a
    /// given human message when regenerating by human id.
    pub fn assistant_reply_after(
        &self,
        conversation_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, conversation_id, role, content, speaker_entity_id,
                    token_count, times_retrieved, last_retrieved_at, created_at
             FROM messages
             WHERE conversation_id = ?1 AND role = 'assistant' AND created_at >= ?2
             ORDER BY created_at, rowid
             LIMIT 1",
            rusqlite::params![conversation_id, after.to_rfc3339()],
            row_to_message,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Database(e)),
        }
    }

    /// Every message id in the database — orphan reconciliation input.
    pub fn all_message_ids(&self) -> Result<HashSet<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT id FROM messages")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    // ── retrieval tracking ───────────────────────────────────────────────

    /// Bump times_retrieved, stamp last_retrieved_at, and record the link.
    /// Atomic — either both the count and the link land, or neither.
    #[instrument(skip(self))]
    pub fn increment_retrieval(
        &self,
        message_id: &str,
        conversation_id: &str,
        entity_id: Option<&str>,
    ) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let now = Utc::now().to_rfc3339();

        let changed = tx.execute(
            "UPDATE messages
             SET times_retrieved = times_retrieved + 1,
                 last_retrieved_at = ?1
             WHERE id = ?2",
            rusqlite::params![now, message_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound {
                what: "message",
                id: message_id.to_string(),
            });
        }

        tx.execute(
            "INSERT OR IGNORE INTO memory_links
             (conversation_id, message_id, entity_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![conversation_id, message_id, entity_id.unwrap_or(""), now],
        )?;

        tx.commit()?;
        debug!(message_id, conversation_id, "retrieval count incremented");
        Ok(())
    }

    /// Message ids already surfaced to a conversation. With an entity
    /// filter, only that entity's links count (multi-entity isolation).
    pub fn retrieved_ids(
        &self,
        conversation_id: &str,
        entity_id: Option<&str>,
    ) -> Result<HashSet<String>> {
        let db = self.db.lock().unwrap();
        let mut out = HashSet::new();
        match entity_id {
            Some(eid) => {
                let mut stmt = db.prepare(
                    "SELECT message_id FROM memory_links
                     WHERE conversation_id = ?1 AND entity_id = ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![conversation_id, eid], |row| {
                    row.get::<_, String>(0)
                })?;
                for row in rows {
                    out.insert(row?);
                }
            }
            None => {
                let mut stmt = db.prepare(
                    "SELECT message_id FROM memory_links WHERE conversation_id = ?1",
                )?;
                let rows = stmt.query_map(rusqlite::params![conversation_id], |row| {
                    row.get::<_, String>(0)
                })?;
                for row in rows {
                    out.insert(row?);
                }
            }
        }
        Ok(out)
    }
}

fn insert_message(
    tx: &rusqlite::Transaction<'_>,
    conversation_id: &str,
    msg: NewMessage,
    now: DateTime<Utc>,
) -> Result<MessageRecord> {
    let id = Uuid::now_v7().to_string();
    tx.execute(
        "INSERT INTO messages
         (id, conversation_id, role, content, speaker_entity_id,
          token_count, times_retrieved, last_retrieved_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL, ?7)",
        rusqlite::params![
            id,
            conversation_id,
            msg.role.to_string(),
            msg.content,
            msg.speaker_entity_id,
            msg.token_count as i64,
            now.to_rfc3339(),
        ],
    )?;
    Ok(MessageRecord {
        id,
        conversation_id: conversation_id.to_string(),
        role: msg.role,
        content: msg.content,
        speaker_entity_id: msg.speaker_entity_id,
        token_count: msg.token_count,
        times_retrieved: 0,
        last_retrieved_at: None,
        created_at: now,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let kind_str: String = row.get(2)?;
    let prompts_json: Option<String> = row.get(6)?;
    let entity_system_prompts = match prompts_json {
        Some(json) => serde_json::from_str::<HashMap<String, String>>(&json).ok(),
        None => None,
    };
    Ok(Conversation {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        kind: ConversationKind::from_str(&kind_str).unwrap_or(ConversationKind::Normal),
        title: row.get(3)?,
        llm_model_used: row.get(4)?,
        system_prompt_used: row.get(5)?,
        entity_system_prompts,
        is_archived: row.get::<_, i64>(7)? != 0,
        created_at: parse_ts(row, 8)?,
        updated_at: parse_ts(row, 9)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role_str: String = row.get(2)?;
    let last_retrieved: Option<String> = row.get(7)?;
    let last_retrieved_at = match last_retrieved {
        Some(s) => Some(parse_ts_str(&s, 7)?),
        None => None,
    };
    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: MessageRole::from_str(&role_str).unwrap_or(MessageRole::Human),
        content: row.get(3)?,
        speaker_entity_id: row.get(4)?,
        token_count: row.get::<_, i64>(5)? as usize,
        times_retrieved: row.get::<_, i64>(6)? as u32,
        last_retrieved_at,
        created_at: parse_ts(row, 8)?,
    })
}

fn parse_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts_str(&s, idx)
}

fn parse_ts_str(s: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_conversation(id: &str, entity_id: Option<&str>, kind: ConversationKind) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: id.to_string(),
            entity_id: entity_id.map(String::from),
            kind,
            title: None,
            llm_model_used: None,
            system_prompt_used: None,
            entity_system_prompts: None,
            is_archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn conversation_roundtrip() {
        let db = Database::open_in_memory().expect("open");
        let mut conv = new_conversation("c-1", Some("aria-memories"), ConversationKind::Normal);
        conv.entity_system_prompts = Some(HashMap::from([(
            "aria-memories".to_string(),
            "be kind".to_string(),
        )]));
        db.create_conversation(&conv).expect("create");

        let loaded = db.get_conversation("c-1").expect("get").expect("some");
        assert_eq!(loaded.entity_id.as_deref(), Some("aria-memories"));
        assert_eq!(loaded.kind, ConversationKind::Normal);
        assert_eq!(
            loaded
                .entity_system_prompts
                .as_ref()
                .and_then(|m| m.get("aria-memories"))
                .map(String::as_str),
            Some("be kind")
        );
        assert!(db.get_conversation("missing").expect("get").is_none());
    }

    #[test]
    fn exchange_insert_preserves_order_and_bumps_updated_at() {
        let db = Database::open_in_memory().expect("open");
        let conv = new_conversation("c-2", None, ConversationKind::Normal);
        db.create_conversation(&conv).expect("create");

        let (human, assistant) = db
            .insert_exchange(
                "c-2",
                Some(NewMessage::human("hello", 2)),
                NewMessage::assistant("hi there", 3, None),
            )
            .expect("insert");
        let human = human.expect("human record");

        let messages = db.list_messages("c-2").expect("list");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, human.id);
        assert_eq!(messages[0].role, MessageRole::Human);
        assert_eq!(messages[1].id, assistant.id);
        assert_eq!(messages[1].role, MessageRole::Assistant);

        let loaded = db.get_conversation("c-2").expect("get").expect("some");
        assert!(loaded.updated_at >= conv.updated_at);
    }

    #[test]
    fn exchange_into_missing_conversation_fails() {
        let db = Database::open_in_memory().expect("open");
        let result = db.insert_exchange(
            "missing",
            None,
            NewMessage::assistant("hi", 1, None),
        );
        assert!(matches!(result, Err(DbError::NotFound { .. })));
    }

    #[test]
    fn retrieval_increment_is_idempotent_on_links() {
        let db = Database::open_in_memory().expect("open");
        db.create_conversation(&new_conversation("src", None, ConversationKind::Normal))
            .expect("create src");
        db.create_conversation(&new_conversation("dst", None, ConversationKind::Normal))
            .expect("create dst");
        let (_, msg) = db
            .insert_exchange("src", None, NewMessage::assistant("a memory", 2, None))
            .expect("insert");

        db.increment_retrieval(&msg.id, "dst", None).expect("first");
        db.increment_retrieval(&msg.id, "dst", None).expect("second");

        // The count is per increment call; the link stays unique.
        let loaded = db.get_message(&msg.id).expect("get").expect("some");
        assert_eq!(loaded.times_retrieved, 2);
        assert!(loaded.last_retrieved_at.is_some());

        let ids = db.retrieved_ids("dst", None).expect("ids");
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&msg.id));
    }

    #[test]
    fn retrieved_ids_respects_entity_filter() {
        let db = Database::open_in_memory().expect("open");
        db.create_conversation(&new_conversation("src", None, ConversationKind::Normal))
            .expect("create src");
        db.create_conversation(&new_conversation(
            "dst",
            Some("multi-entity"),
            ConversationKind::MultiEntity,
        ))
        .expect("create dst");
        let (_, m1) = db
            .insert_exchange("src", None, NewMessage::assistant("one", 1, None))
            .expect("insert");
        let (_, m2) = db
            .insert_exchange("src", None, NewMessage::assistant("two", 1, None))
            .expect("insert");

        db.increment_retrieval(&m1.id, "dst", Some("aria-memories"))
            .expect("inc");
        db.increment_retrieval(&m2.id, "dst", Some("sol-memories"))
            .expect("inc");

        let aria = db.retrieved_ids("dst", Some("aria-memories")).expect("ids");
        assert_eq!(aria.len(), 1);
        assert!(aria.contains(&m1.id));

        let all = db.retrieved_ids("dst", None).expect("ids");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn archived_ids_follow_multi_entity_rules() {
        let db = Database::open_in_memory().expect("open");

        let mut owned = new_conversation("owned", Some("aria-memories"), ConversationKind::Normal);
        owned.is_archived = true;
        db.create_conversation(&owned).expect("create");

        let mut multi = new_conversation(
            "multi",
            Some("multi-entity"),
            ConversationKind::MultiEntity,
        );
        multi.is_archived = true;
        db.create_conversation(&multi).expect("create");
        db.add_participant("multi", "aria-memories", 0).expect("add");
        db.add_participant("multi", "sol-memories", 1).expect("add");

        let mut legacy = new_conversation("legacy", None, ConversationKind::Normal);
        legacy.is_archived = true;
        db.create_conversation(&legacy).expect("create");

        let mut other = new_conversation("other", Some("sol-memories"), ConversationKind::Normal);
        other.is_archived = true;
        db.create_conversation(&other).expect("create");

        // Default entity sees: its own, multi-entity it participates in, legacy
        let aria = db
            .archived_conversation_ids(Some(("aria-memories", true)))
            .expect("ids");
        assert!(aria.contains("owned"));
        assert!(aria.contains("multi"));
        assert!(aria.contains("legacy"));
        assert!(!aria.contains("other"));

        // Non-default entity does not absorb legacy conversations
        let sol = db
            .archived_conversation_ids(Some(("sol-memories", false)))
            .expect("ids");
        assert!(sol.contains("other"));
        assert!(sol.contains("multi"));
        assert!(!sol.contains("legacy"));
        assert!(!sol.contains("owned"));

        // No filter: everything archived
        let all = db.archived_conversation_ids(None).expect("ids");
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn delete_message_removes_row_and_links() {
        let db = Database::open_in_memory().expect("open");
        db.create_conversation(&new_conversation("src", None, ConversationKind::Normal))
            .expect("create");
        db.create_conversation(&new_conversation("dst", None, ConversationKind::Normal))
            .expect("create");
        let (_, msg) = db
            .insert_exchange("src", None, NewMessage::assistant("gone soon", 2, None))
            .expect("insert");
        db.increment_retrieval(&msg.id, "dst", None).expect("inc");

        db.delete_message(&msg.id).expect("delete");
        assert!(db.get_message(&msg.id).expect("get").is_none());
        assert!(db.retrieved_ids("dst", None).expect("ids").is_empty());
    }

    #[test]
    fn assistant_reply_after_finds_the_reply() {
        let db = Database::open_in_memory().expect("open");
        db.create_conversation(&new_conversation("c", None, ConversationKind::Normal))
            .expect("create");
        let (human, assistant) = db
            .insert_exchange(
                "c",
                Some(NewMessage::human("question", 1)),
                NewMessage::assistant("answer", 1, None),
            )
            .expect("insert");
        let human = human.expect("human");

        let reply = db
            .assistant_reply_after("c", human.created_at)
            .expect("query")
            .expect("some");
        assert_eq!(reply.id, assistant.id);
    }
}
