use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use anima_core::content::ContentBlock;

use crate::provider::{
    ChatRequest, ChatResponse, LlmProvider, ProviderError, StreamEvent, ToolCall, Usage,
};

const API_VERSION: &str = "2023-06-01";
/// Opts into 1-hour cache TTL so a conversation survives a coffee break.
const CACHE_TTL_BETA: &str = "extended-cache-ttl-2025-04-11";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", CACHE_TTL_BETA)
            .header("content-type", "application/json")
            .json(body)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req, false);

        debug!(model = %req.model, messages = req.messages.len(), "sending request to Anthropic");

        let resp = self.request(&body).send().await?;
        let resp = check_status(resp).await?;

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);

        debug!(model = %req.model, "sending streaming request to Anthropic");

        let resp = self.request(&body).send().await?;
        let resp = check_status(resp).await?;

        crate::anthropic_stream::process_stream(resp, tx).await;
        Ok(())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status().as_u16();
    if status == 429 {
        let retry = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5000);
        return Err(ProviderError::RateLimited {
            retry_after_ms: retry,
        });
    }
    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        warn!(status, body = %text, "Anthropic API error");
        return Err(ProviderError::Api {
            status,
            message: text,
        });
    }
    Ok(resp)
}

fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(|m| m.to_wire()).collect();

    let mut body = json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "temperature": req.temperature,
        "messages": messages,
        "stream": stream,
    });

    if let Some(system) = &req.system {
        if req.enable_caching {
            // The system prompt carries its own cache block, separate from
            // the single conversation breakpoint in the message list.
            body["system"] = json!([{
                "type": "text",
                "text": system,
                "cache_control": { "type": "ephemeral", "ttl": "1h" },
            }]);
        } else {
            body["system"] = json!(system);
        }
    }

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    body
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let mut content = String::new();
    let mut content_blocks: Vec<ContentBlock> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in resp.content {
        match block {
            ApiContentBlock::Text { text } => {
                content.push_str(&text);
                content_blocks.push(ContentBlock::Text { text });
            }
            ApiContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
                content_blocks.push(ContentBlock::ToolUse { id, name, input });
            }
            ApiContentBlock::Unknown => {}
        }
    }

    ChatResponse {
        content,
        content_blocks,
        tool_calls,
        model: resp.model,
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            cache_creation_input_tokens: resp.usage.cache_creation_input_tokens.unwrap_or(0),
            cache_read_input_tokens: resp.usage.cache_read_input_tokens.unwrap_or(0),
        },
        stop_reason: resp.stop_reason.unwrap_or_default(),
    }
}

// Anthropic API response types (private — only used for deserialization)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ApiContentBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
    cache_creation_input_tokens: Option<u32>,
    cache_read_input_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::PromptMessage;

    fn request(messages: Vec<PromptMessage>) -> ChatRequest {
        ChatRequest {
            model: "claude-sonnet-4-5".to_string(),
            system: Some("be helpful".to_string()),
            messages,
            temperature: 1.0,
            max_tokens: 4096,
            tools: Vec::new(),
            enable_caching: true,
        }
    }

    #[test]
    fn system_prompt_gets_its_own_cache_block() {
        let body = build_request_body(&request(vec![PromptMessage::user_text("hi")]), false);
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["system"][0]["text"], "be helpful");
    }

    #[test]
    fn plain_system_prompt_when_caching_disabled() {
        let mut req = request(vec![PromptMessage::user_text("hi")]);
        req.enable_caching = false;
        let body = build_request_body(&req, false);
        assert_eq!(body["system"], "be helpful");
    }

    #[test]
    fn marked_message_carries_cache_control_on_wire() {
        let mut cached = PromptMessage::user_text("the stable prefix");
        cached.mark_cache();
        let body = build_request_body(&request(vec![cached]), true);
        assert_eq!(body["stream"], true);
        assert_eq!(
            body["messages"][0]["content"][0]["cache_control"]["ttl"],
            "1h"
        );
    }

    #[test]
    fn response_parse_splits_text_and_tool_calls() {
        let resp: ApiResponse = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "content": [
                { "type": "text", "text": "Let me check. " },
                { "type": "tool_use", "id": "tu_1", "name": "web_search",
                  "input": { "query": "weather" } },
            ],
            "stop_reason": "tool_use",
            "usage": {
                "input_tokens": 100,
                "output_tokens": 20,
                "cache_read_input_tokens": 90
            }
        }))
        .expect("parse");

        let parsed = parse_response(resp);
        assert_eq!(parsed.content, "Let me check. ");
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "web_search");
        assert_eq!(parsed.content_blocks.len(), 2);
        assert_eq!(parsed.usage.cache_read_input_tokens, 90);
        assert!(parsed.wants_tools());
    }
}
