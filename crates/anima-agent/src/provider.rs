use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use anima_core::content::ContentBlock;

use crate::assemble::PromptMessage;

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call extracted from the LLM response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Request to an LLM provider. Messages carry their own cache markers;
/// the system prompt gets its own cache block when caching is enabled.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<PromptMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Tools to expose to the LLM. Empty disables tool use.
    pub tools: Vec<ToolDefinition>,
    pub enable_caching: bool,
}

/// Token accounting, including prompt-cache traffic when the provider
/// reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_creation_input_tokens: u32,
    #[serde(default)]
    pub cache_read_input_tokens: u32,
}

/// Response from an LLM provider (non-streaming, or assembled at the end
/// of a stream).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Concatenated text content.
    pub content: String,
    /// Every content block in response order (text and tool_use).
    pub content_blocks: Vec<ContentBlock>,
    /// Tool calls requested by the LLM. Empty when none.
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: String,
}

impl ChatResponse {
    pub fn wants_tools(&self) -> bool {
        self.stop_reason == "tool_use" && !self.tool_calls.is_empty()
    }
}

/// Events emitted while streaming an LLM response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Stream opened; the model that will answer.
    Start { model: String },

    /// Incremental text content.
    TextDelta { text: String },

    /// A tool_use block opened. Input arrives with `Done` once the block's
    /// JSON has fully accumulated.
    ToolUseStart { id: String, name: String },

    /// Stream completed. `truncated_tool_use` flags a tool call cut off by
    /// max_tokens — it must not be executed.
    Done {
        response: ChatResponse,
        truncated_tool_use: bool,
    },

    /// Error during streaming.
    Error { message: String },
}

/// Common interface for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming chat request, wait for the full response.
    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response events through a channel.
    /// Default: falls back to non-streaming send.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.send(req).await?;
        let _ = tx
            .send(StreamEvent::Start {
                model: resp.model.clone(),
            })
            .await;
        let _ = tx
            .send(StreamEvent::TextDelta {
                text: resp.content.clone(),
            })
            .await;
        let _ = tx
            .send(StreamEvent::Done {
                response: resp,
                truncated_tool_use: false,
            })
            .await;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,
}
