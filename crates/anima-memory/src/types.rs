use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which query surfaced a candidate. `Unknown` marks entries rebuilt from
/// memory links on session reload, where the original query is long gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    User,
    Assistant,
    Both,
    Unknown,
}

impl fmt::Display for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemorySource::User => "user",
            MemorySource::Assistant => "assistant",
            MemorySource::Both => "both",
            MemorySource::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One raw vector-search hit: the id, similarity score and the metadata
/// snapshot stored alongside the embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub conversation_id: Option<String>,
    pub created_at: Option<String>,
    pub role: Option<String>,
    pub content_preview: Option<String>,
    #[serde(default)]
    pub times_retrieved: u32,
}

/// A fully-enriched memory as held by a session: the vector hit joined
/// with the full message row and the scores computed at retrieval time.
/// All fields are a snapshot — never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub conversation_id: String,
    /// Display role: "human", "assistant", or another entity's label in
    /// multi-entity indexes.
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub times_retrieved: u32,
    /// Raw similarity from the vector search.
    pub score: f64,
    pub significance: f64,
    pub combined_score: f64,
    pub days_since_creation: f64,
    /// `None` when the memory was never retrieved before.
    pub days_since_retrieval: Option<f64>,
    pub source: MemorySource,
}
