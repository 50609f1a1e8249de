use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: default_chat_model(),
            temperature: 0.0,
            max_retries: default_max_retries(),
            timeout_secs: default_chat_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Hard ceiling on AGENT/TOOLS alternations before the loop is cut off
    /// with a partial result.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Per-tool-call execution timeout. Timeouts become tool error results,
    /// not process failures.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Multiplier applied to the cosine score of artifacts owned by the
    /// current session during ranking.
    #[serde(default = "default_session_boost")]
    pub session_boost: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            tool_timeout_secs: default_tool_timeout_secs(),
            session_boost: default_session_boost(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WebSearchConfig {
    /// Search API endpoint. Web search is disabled when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the search API key.
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_search_max_results")]
    pub max_results: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_chat_provider() -> String {
    "openai".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_chat_timeout_secs() -> u64 {
    120
}
fn default_max_steps() -> usize {
    25
}
fn default_tool_timeout_secs() -> u64 {
    60
}
fn default_session_boost() -> f64 {
    1.2
}
fn default_search_key_env() -> String {
    "SEARCH_API_KEY".to_string()
}
fn default_search_max_results() -> usize {
    5
}

impl Config {
    /// A minimal in-memory configuration for tests and offline commands.
    pub fn minimal(db_path: PathBuf) -> Self {
        Self {
            db: DbConfig { path: db_path },
            embedding: EmbeddingConfig::default(),
            chat: ChatConfig::default(),
            agent: AgentConfig::default(),
            web_search: WebSearchConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:8600".to_string(),
            },
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.agent.max_steps == 0 {
        anyhow::bail!("agent.max_steps must be >= 1");
    }

    if config.agent.session_boost < 1.0 {
        anyhow::bail!("agent.session_boost must be >= 1.0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.chat.provider.as_str() {
        "openai" => {}
        other => anyhow::bail!("Unknown chat provider: '{}'. Must be openai.", other),
    }

    Ok(config)
}
