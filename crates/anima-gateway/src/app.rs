use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use anima_agent::anthropic::AnthropicProvider;
use anima_agent::notes::NotesProvider;
use anima_agent::tools::memory_query::{MemoryQueryTool, ToolContext};
use anima_agent::tools::web::{WebFetchTool, WebSearchTool};
use anima_agent::tools::ToolRegistry;
use anima_agent::turn::Pipeline;
use anima_core::config::AnimaConfig;
use anima_core::error::{AnimaError, Result};
use anima_core::tokens::TokenCounter;
use anima_db::Database;
use anima_memory::VectorStore;
use anima_session::SessionTable;

/// Shared state for every HTTP handler.
pub struct AppState {
    pub config: Arc<AnimaConfig>,
    pub db: Arc<Database>,
    pub store: Option<Arc<VectorStore>>,
    pub sessions: SessionTable,
    pub pipeline: Pipeline,
    /// conversation_id → cancellation token for the in-flight turn.
    /// Presence means busy: concurrent turns on one conversation fail fast.
    pub active_turns: DashMap<String, CancellationToken>,
}

impl AppState {
    pub fn from_config(config: AnimaConfig) -> Result<Self> {
        let config = Arc::new(config);

        let anthropic = config
            .providers
            .anthropic
            .as_ref()
            .ok_or_else(|| AnimaError::Config("providers.anthropic is required".to_string()))?;
        let provider = Arc::new(AnthropicProvider::new(
            anthropic.api_key.clone(),
            Some(anthropic.base_url.clone()),
        ));

        let db = Arc::new(Database::open(&config.database.path).map_err(|e| {
            AnimaError::Database(e.to_string())
        })?);
        let store = VectorStore::from_config(config.as_ref()).map(Arc::new);
        let counter = Arc::new(TokenCounter::new());
        let notes = Arc::new(NotesProvider::from_config(&config.notes));

        let pipeline = Pipeline {
            db: db.clone(),
            store: store.clone(),
            provider,
            config: config.clone(),
            counter,
            notes,
        };

        Ok(Self {
            sessions: SessionTable::new(config.clone()),
            config,
            db,
            store,
            pipeline,
            active_turns: DashMap::new(),
        })
    }

    /// Build the per-turn tool registry. The memory query tool gets an
    /// explicit context value — which conversation and entity it acts
    /// for — rather than reading ambient state.
    pub fn build_tools(&self, conversation_id: &str, entity_id: Option<&str>, is_multi_entity: bool) -> ToolRegistry {
        let mut registry = ToolRegistry::new();

        if let Some(web_config) = &self.config.providers.web_search {
            registry.register(Arc::new(WebSearchTool::new(web_config)));
        }
        registry.register(Arc::new(WebFetchTool::new()));

        registry.register(Arc::new(MemoryQueryTool::new(ToolContext {
            conversation_id: conversation_id.to_string(),
            entity_id: entity_id.map(String::from),
            is_multi_entity,
            db: self.db.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
        })));

        registry
    }
}
