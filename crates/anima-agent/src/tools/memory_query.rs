//! Deliberate memory recall, exposed to the model as a tool.
//!
//! Unlike automatic retrieval this applies NO exclusions: results may come
//! from the current conversation and may already be in context — the model
//! asked, so it gets the full picture. Each returned id still counts as a
//! retrieval, once per invocation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use anima_core::config::AnimaConfig;
use anima_db::Database;
use anima_memory::VectorStore;

use super::{Tool, ToolCategory, ToolResult};

const DEFAULT_NUM_RESULTS: usize = 5;
const MIN_NUM_RESULTS: usize = 1;
const MAX_NUM_RESULTS: usize = 10;
const RESULT_CONTENT_CAP: usize = 1000;

/// Explicit per-turn context for tool handlers. Built by the pipeline for
/// each turn — never ambient state.
#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    /// Acting entity's index name.
    pub entity_id: Option<String>,
    /// True in multi-entity conversations, where retrieval links are
    /// attributed per entity.
    pub is_multi_entity: bool,
    pub db: Arc<Database>,
    pub store: Option<Arc<VectorStore>>,
    pub config: Arc<AnimaConfig>,
}

pub struct MemoryQueryTool {
    ctx: ToolContext,
}

impl MemoryQueryTool {
    pub fn new(ctx: ToolContext) -> Self {
        Self { ctx }
    }
}

pub(crate) fn clamp_num_results(requested: Option<i64>) -> usize {
    match requested {
        None => DEFAULT_NUM_RESULTS,
        Some(n) if n < MIN_NUM_RESULTS as i64 => MIN_NUM_RESULTS,
        Some(n) if n > MAX_NUM_RESULTS as i64 => MAX_NUM_RESULTS,
        Some(n) => n as usize,
    }
}

#[async_trait]
impl Tool for MemoryQueryTool {
    fn name(&self) -> &str {
        "memory_query"
    }

    fn description(&self) -> &str {
        "Search your long-term memory for past conversations relevant to a query. \
         Use when you want to recall something specific that may not already be in context."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to search your memories for"
                },
                "num_results": {
                    "type": "integer",
                    "description": "How many memories to return (1-10, default 5)"
                }
            },
            "required": ["query"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Memory
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let query = input
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if query.is_empty() {
            return ToolResult::error("query must not be empty");
        }

        let num_results = clamp_num_results(input.get("num_results").and_then(Value::as_i64));

        let entity_id = match &self.ctx.entity_id {
            Some(eid) => eid.clone(),
            None => match self.ctx.config.default_entity() {
                Some(entity) => entity.index_name.clone(),
                None => return ToolResult::error("memory is not configured for this conversation"),
            },
        };

        let store = match &self.ctx.store {
            Some(store) if store.is_configured(&entity_id) => store.clone(),
            _ => return ToolResult::error("memory is not configured for this conversation"),
        };

        // Deliberate recall: no conversation filter, no in-context dedup.
        let hits = store.search(&entity_id, query, num_results, None).await;
        if hits.is_empty() {
            return ToolResult::ok(format!("No memories found for \"{query}\"."));
        }

        let now = Utc::now();
        let link_entity = if self.ctx.is_multi_entity {
            Some(entity_id.as_str())
        } else {
            None
        };

        let mut lines: Vec<String> = Vec::new();
        for hit in &hits {
            let record = match self.ctx.db.get_message(&hit.id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!(memory_id = %hit.id, "skipping orphaned memory hit");
                    continue;
                }
                Err(e) => {
                    warn!(memory_id = %hit.id, error = %e, "could not load memory content");
                    continue;
                }
            };

            // A deliberate surfacing still counts as a retrieval.
            if let Err(e) =
                self.ctx
                    .db
                    .increment_retrieval(&record.id, &self.ctx.conversation_id, link_entity)
            {
                warn!(memory_id = %record.id, error = %e, "retrieval count update failed");
            }
            store
                .update_times_retrieved(&entity_id, &record.id, record.times_retrieved + 1)
                .await;

            let age_days = (now - record.created_at).num_days().max(0);
            let content: String = record.content.chars().take(RESULT_CONTENT_CAP).collect();
            lines.push(format!(
                "{}. From {} ({} days ago, similarity {:.2}):\n\"{}\"",
                lines.len() + 1,
                record.role,
                age_days,
                hit.score,
                content,
            ));
        }

        if lines.is_empty() {
            return ToolResult::ok(format!(
                "No memories found for \"{query}\" (matches could not be loaded)."
            ));
        }

        info!(
            query,
            returned = lines.len(),
            "deliberate memory query complete"
        );
        ToolResult::ok(format!(
            "Found {} memories for \"{}\":\n\n{}",
            lines.len(),
            query,
            lines.join("\n\n"),
        ))
    }
}
