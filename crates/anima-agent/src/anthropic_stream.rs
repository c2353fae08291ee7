//! Anthropic SSE stream processing.
//!
//! Parses the event stream into `StreamEvent`s, accumulating content
//! blocks and tool-use input JSON so the final `Done` event carries a
//! complete `ChatResponse`.

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use anima_core::content::ContentBlock;

use crate::provider::{ChatResponse, StreamEvent, ToolCall, Usage};

/// Parse a single SSE line: `event: <type>` or `data: <json>`.
fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

enum SseParsed {
    Event(String),
    Data(String),
}

#[derive(Default)]
struct StreamState {
    current_event: String,
    /// Block type from `content_block_start` so deltas know what to do.
    current_block_type: String,
    tool_use_id: String,
    tool_use_name: String,
    tool_use_input_json: String,
    full_content: String,
    tool_use_blocks: Vec<ContentBlock>,
    model: String,
    usage: Usage,
    stop_reason: String,
    started: bool,
}

/// Read the byte stream, parse SSE lines, emit StreamEvents. Ends with a
/// `Done` carrying the assembled response; a receiver drop stops the
/// producer at the next event boundary.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut state = StreamState::default();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        // Multiple SSE lines per chunk; keep the trailing partial line.
        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(parsed) = parse_sse_line(line) {
                match parsed {
                    SseParsed::Event(ev) => state.current_event = ev,
                    SseParsed::Data(data) => {
                        if let Some(event) = handle_data(&mut state, &data) {
                            if tx.send(event).await.is_err() {
                                return; // receiver dropped
                            }
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    // A tool_use block still open at end-of-stream hit max_tokens mid-input.
    // It must not execute.
    let truncated = !state.tool_use_id.is_empty();
    if truncated {
        warn!(
            tool = %state.tool_use_name,
            "tool use truncated by max_tokens; it will not execute"
        );
    }

    let mut content_blocks: Vec<ContentBlock> = Vec::new();
    if !state.full_content.is_empty() {
        content_blocks.push(ContentBlock::Text {
            text: state.full_content.clone(),
        });
    }
    content_blocks.extend(state.tool_use_blocks.iter().cloned());

    let tool_calls: Vec<ToolCall> = state
        .tool_use_blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect();

    let _ = tx
        .send(StreamEvent::Done {
            response: ChatResponse {
                content: state.full_content,
                content_blocks,
                tool_calls,
                model: state.model,
                usage: state.usage,
                stop_reason: state.stop_reason,
            },
            truncated_tool_use: truncated,
        })
        .await;
}

fn handle_data(state: &mut StreamState, data: &str) -> Option<StreamEvent> {
    match state.current_event.as_str() {
        "message_start" => {
            if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                state.model = msg.message.model;
                state.usage.input_tokens = msg.message.usage.input_tokens;
                state.usage.cache_creation_input_tokens =
                    msg.message.usage.cache_creation_input_tokens.unwrap_or(0);
                state.usage.cache_read_input_tokens =
                    msg.message.usage.cache_read_input_tokens.unwrap_or(0);
            }
            if !state.started {
                state.started = true;
                return Some(StreamEvent::Start {
                    model: state.model.clone(),
                });
            }
            None
        }

        "content_block_start" => {
            if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                state.current_block_type = start.content_block.block_type.clone();
                if start.content_block.block_type == "tool_use" {
                    state.tool_use_id = start.content_block.id.unwrap_or_default();
                    state.tool_use_name = start.content_block.name.unwrap_or_default();
                    state.tool_use_input_json.clear();
                    return Some(StreamEvent::ToolUseStart {
                        id: state.tool_use_id.clone(),
                        name: state.tool_use_name.clone(),
                    });
                }
            }
            None
        }

        "content_block_delta" => {
            if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                match delta.delta.delta_type.as_str() {
                    "text_delta" => {
                        if let Some(text) = delta.delta.text {
                            state.full_content.push_str(&text);
                            return Some(StreamEvent::TextDelta { text });
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.delta.partial_json {
                            state.tool_use_input_json.push_str(&partial);
                        }
                    }
                    other => {
                        debug!(delta_type = other, "unhandled delta type");
                    }
                }
            }
            None
        }

        "content_block_stop" => {
            if state.current_block_type == "tool_use" {
                let input = serde_json::from_str::<serde_json::Value>(
                    state.tool_use_input_json.as_str(),
                )
                .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));
                state.tool_use_blocks.push(ContentBlock::ToolUse {
                    id: std::mem::take(&mut state.tool_use_id),
                    name: std::mem::take(&mut state.tool_use_name),
                    input,
                });
                state.tool_use_input_json.clear();
            }
            state.current_block_type.clear();
            None
        }

        "message_delta" => {
            if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                state.usage.output_tokens = delta.usage.output_tokens;
                if let Some(reason) = delta.delta.stop_reason {
                    state.stop_reason = reason;
                }
            }
            None
        }

        "error" => {
            warn!(data, "anthropic stream error");
            Some(StreamEvent::Error {
                message: data.to_string(),
            })
        }

        // message_stop, ping, unknown events — no action needed
        _ => None,
    }
}

// Anthropic SSE data types (private — deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    model: String,
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
    cache_creation_input_tokens: Option<u32>,
    cache_read_input_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut StreamState, event: &str, data: &str) -> Option<StreamEvent> {
        state.current_event = event.to_string();
        handle_data(state, data)
    }

    #[test]
    fn message_start_emits_start_with_model() {
        let mut state = StreamState::default();
        let event = feed(
            &mut state,
            "message_start",
            r#"{"message":{"model":"claude-sonnet-4-5","usage":{"input_tokens":42,"cache_read_input_tokens":30}}}"#,
        );
        assert!(matches!(event, Some(StreamEvent::Start { model }) if model == "claude-sonnet-4-5"));
        assert_eq!(state.usage.input_tokens, 42);
        assert_eq!(state.usage.cache_read_input_tokens, 30);
    }

    #[test]
    fn text_deltas_accumulate() {
        let mut state = StreamState::default();
        feed(
            &mut state,
            "content_block_start",
            r#"{"content_block":{"type":"text"}}"#,
        );
        let first = feed(
            &mut state,
            "content_block_delta",
            r#"{"delta":{"type":"text_delta","text":"Hel"}}"#,
        );
        assert!(matches!(first, Some(StreamEvent::TextDelta { text }) if text == "Hel"));
        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta":{"type":"text_delta","text":"lo"}}"#,
        );
        assert_eq!(state.full_content, "Hello");
    }

    #[test]
    fn tool_use_input_json_assembles_across_deltas() {
        let mut state = StreamState::default();
        let start = feed(
            &mut state,
            "content_block_start",
            r#"{"content_block":{"type":"tool_use","id":"tu_1","name":"web_search"}}"#,
        );
        assert!(matches!(start, Some(StreamEvent::ToolUseStart { ref name, .. }) if name == "web_search"));

        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta":{"type":"input_json_delta","partial_json":"{\"query\":"}}"#,
        );
        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
        );
        feed(&mut state, "content_block_stop", r#"{}"#);

        assert_eq!(state.tool_use_blocks.len(), 1);
        match &state.tool_use_blocks[0] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "tu_1");
                assert_eq!(name, "web_search");
                assert_eq!(input["query"], "rust");
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
        // id consumed — nothing left open to flag as truncated
        assert!(state.tool_use_id.is_empty());
    }

    #[test]
    fn message_delta_captures_stop_reason_and_output_tokens() {
        let mut state = StreamState::default();
        feed(
            &mut state,
            "message_delta",
            r#"{"delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":17}}"#,
        );
        assert_eq!(state.stop_reason, "tool_use");
        assert_eq!(state.usage.output_tokens, 17);
    }
}
