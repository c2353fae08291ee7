use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8780;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Sentinel entity id marking a conversation shared between several entities.
pub const MULTI_ENTITY_SENTINEL: &str = "multi-entity";

/// Top-level config (anima.toml + ANIMA_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimaConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// One entry per AI identity, each backed by its own vector index.
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub notes: NotesConfig,
}

impl Default for AnimaConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            providers: ProvidersConfig::default(),
            entities: Vec::new(),
            chat: ChatConfig::default(),
            retrieval: RetrievalConfig::default(),
            notes: NotesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on every request. `None` disables auth
    /// (local development only).
    pub auth_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicConfig>,
    pub vector_store: Option<VectorStoreConfig>,
    pub web_search: Option<WebSearchConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub api_key: String,
    /// Control-plane URL; per-entity data planes come from `EntityConfig.host`.
    #[serde(default = "default_vector_store_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    pub api_key: String,
    #[serde(default = "default_web_search_base_url")]
    pub base_url: String,
}

/// One AI identity: its vector index, display label, and model defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Vector index name — doubles as the entity id everywhere.
    pub index_name: String,
    /// Display label used in rendered prompts and multi-entity headers.
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    /// LLM provider for this entity (currently only "anthropic").
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Overrides the global default model when set.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Data-plane host for serverless indexes. Optional for pod indexes.
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
        }
    }
}

/// Retrieval and budgeting knobs. Defaults match long-running production
/// tuning; change with care — significance scores shift globally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Raw similarity floor applied after ranking.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Memories kept per turn once the session is warm.
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,
    /// Memories kept on the first retrieval of a session.
    #[serde(default = "default_initial_retrieval_top_k")]
    pub initial_retrieval_top_k: usize,
    /// Token budget for the rendered memories block.
    #[serde(default = "default_memory_token_limit")]
    pub memory_token_limit: usize,
    /// Token budget for the rolling conversation context.
    #[serde(default = "default_context_token_limit")]
    pub context_token_limit: usize,
    /// Upper bound on LLM/tool round-trips within one turn.
    #[serde(default = "default_tool_use_max_iterations")]
    pub tool_use_max_iterations: usize,
    /// Days for a memory's significance to halve.
    #[serde(default = "default_significance_half_life_days")]
    pub significance_half_life_days: f64,
    /// Ceiling on the recency boost multiplier.
    #[serde(default = "default_recency_boost_strength")]
    pub recency_boost_strength: f64,
    /// Minimum significance, so similarity alone never zeroes out.
    #[serde(default = "default_significance_floor")]
    pub significance_floor: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            retrieval_top_k: default_retrieval_top_k(),
            initial_retrieval_top_k: default_initial_retrieval_top_k(),
            memory_token_limit: default_memory_token_limit(),
            context_token_limit: default_context_token_limit(),
            tool_use_max_iterations: default_tool_use_max_iterations(),
            significance_half_life_days: default_significance_half_life_days(),
            recency_boost_strength: default_recency_boost_strength(),
            significance_floor: default_significance_floor(),
        }
    }
}

/// Entity/shared note injection (index.md files on disk).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotesConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory holding `<entity-label>/index.md` and `shared/index.md`.
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.anima/anima.db")
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_vector_store_base_url() -> String {
    "https://api.pinecone.io".to_string()
}
fn default_web_search_base_url() -> String {
    "https://api.search.brave.com".to_string()
}
fn default_provider() -> String {
    "anthropic".to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_temperature() -> f64 {
    1.0
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_similarity_threshold() -> f64 {
    0.7
}
fn default_retrieval_top_k() -> usize {
    4
}
fn default_initial_retrieval_top_k() -> usize {
    8
}
fn default_memory_token_limit() -> usize {
    3000
}
fn default_context_token_limit() -> usize {
    100_000
}
fn default_tool_use_max_iterations() -> usize {
    10
}
fn default_significance_half_life_days() -> f64 {
    60.0
}
fn default_recency_boost_strength() -> f64 {
    1.0
}
fn default_significance_floor() -> f64 {
    0.01
}

impl AnimaConfig {
    /// Load config from a TOML file with ANIMA_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.anima/anima.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: AnimaConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ANIMA_").split("_"))
            .extract()
            .map_err(|e| crate::error::AnimaError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Look up an entity by its index name.
    pub fn entity_by_index(&self, index_name: &str) -> Option<&EntityConfig> {
        self.entities.iter().find(|e| e.index_name == index_name)
    }

    /// The first configured entity — fallback when a conversation carries
    /// no entity id.
    pub fn default_entity(&self) -> Option<&EntityConfig> {
        self.entities.first()
    }

    /// Resolve the model an entity should use: its own default if set,
    /// then the provider default, then the global default.
    pub fn model_for_entity(&self, entity_id: &str) -> String {
        match self.entity_by_index(entity_id) {
            Some(entity) => entity
                .default_model
                .clone()
                .unwrap_or_else(|| self.default_model_for_provider(&entity.provider)),
            None => self.chat.default_model.clone(),
        }
    }

    /// Provider-level default model. Only Anthropic is wired today; unknown
    /// providers fall back to the global default.
    pub fn default_model_for_provider(&self, provider: &str) -> String {
        match provider {
            "anthropic" => self.chat.default_model.clone(),
            _ => self.chat.default_model.clone(),
        }
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.anima/anima.toml")
}
