use thiserror::Error;

/// Failures surfaced to callers of the gateway. Soft failures (vector
/// store, metadata updates) never become an `AnimaError` — they degrade
/// the turn instead.
#[derive(Debug, Error)]
pub enum AnimaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Conversation not found: {id}")]
    ConversationNotFound { id: String },

    #[error("Message not found: {id}")]
    MessageNotFound { id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Conversation busy: {id}")]
    Busy { id: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM provider error: {0}")]
    Provider(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AnimaError {
    /// Short error code string included in HTTP error bodies and SSE
    /// error events.
    pub fn code(&self) -> &'static str {
        match self {
            AnimaError::Config(_) => "CONFIG_ERROR",
            AnimaError::ConversationNotFound { .. } => "CONVERSATION_NOT_FOUND",
            AnimaError::MessageNotFound { .. } => "MESSAGE_NOT_FOUND",
            AnimaError::InvalidRequest(_) => "INVALID_REQUEST",
            AnimaError::Busy { .. } => "CONVERSATION_BUSY",
            AnimaError::Database(_) => "DATABASE_ERROR",
            AnimaError::Provider(_) => "LLM_PROVIDER_ERROR",
            AnimaError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AnimaError>;
