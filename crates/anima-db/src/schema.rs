use rusqlite::{Connection, Result};

/// Initialise all tables and indexes. Safe to call on every startup
/// (idempotent — `IF NOT EXISTS` throughout).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_conversations_table(conn)?;
    create_messages_table(conn)?;
    create_conversation_entities_table(conn)?;
    create_memory_links_table(conn)?;
    Ok(())
}

fn create_conversations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id                     TEXT PRIMARY KEY,
            entity_id              TEXT,
            conversation_type      TEXT NOT NULL DEFAULT 'normal',
            title                  TEXT,
            llm_model_used         TEXT,
            system_prompt_used     TEXT,
            entity_system_prompts  TEXT,
            is_archived            INTEGER NOT NULL DEFAULT 0,
            created_at             TEXT NOT NULL,
            updated_at             TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_entity
            ON conversations(entity_id, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_conversations_archived
            ON conversations(is_archived);",
    )
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id                 TEXT PRIMARY KEY,
            conversation_id    TEXT NOT NULL,
            role               TEXT NOT NULL,
            content            TEXT NOT NULL,
            speaker_entity_id  TEXT,
            token_count        INTEGER NOT NULL DEFAULT 0,
            times_retrieved    INTEGER NOT NULL DEFAULT 0,
            last_retrieved_at  TEXT,
            created_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);",
    )
}

/// Participants of a multi-entity conversation, in display order.
fn create_conversation_entities_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversation_entities (
            conversation_id  TEXT NOT NULL,
            entity_id        TEXT NOT NULL,
            display_order    INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (conversation_id, entity_id)
        );",
    )
}

/// Records that a memory was surfaced to a conversation (per entity in
/// multi-entity conversations; entity_id is '' for single-entity rows).
/// Existence of a row means the retrieval count was already bumped.
/// Rows are never updated and never deleted.
fn create_memory_links_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_links (
            conversation_id  TEXT NOT NULL,
            message_id       TEXT NOT NULL,
            entity_id        TEXT NOT NULL DEFAULT '',
            created_at       TEXT NOT NULL,
            UNIQUE (conversation_id, message_id, entity_id)
        );
        CREATE INDEX IF NOT EXISTS idx_memory_links_conversation
            ON memory_links(conversation_id);",
    )
}
