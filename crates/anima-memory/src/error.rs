use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vector store API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("no index configured for entity: {entity_id}")]
    NoIndex { entity_id: String },

    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
