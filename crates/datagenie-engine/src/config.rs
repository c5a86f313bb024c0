//! Engine configuration
//!
//! Every numeric knob has a default, so an empty file (or no file) yields a
//! working configuration. Values are layered: built-in defaults, then an
//! optional TOML/YAML/JSON file, then `DATAGENIE__SECTION__KEY` environment
//! variables.

use crate::masking::MaskingKind;
use crate::result_cache::CacheCategory;
use anyhow::Context;
use datagenie_query::Secret;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    /// Column sensitivity rules fed into the static masking policy
    #[serde(default)]
    pub masking: Vec<MaskingRule>,
}

impl EngineConfig {
    /// Load configuration from an optional file overlaid with environment variables
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        // Map DATAGENIE__POOL__MAX_CONNECTIONS to pool.max_connections, etc.
        builder = builder.add_source(
            config::Environment::with_prefix("DATAGENIE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let engine_config: EngineConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        engine_config
            .validate()
            .context("Configuration validation failed")?;

        Ok(engine_config)
    }

    /// Reject settings that would make the engine unusable
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.max_connections == 0 {
            anyhow::bail!("pool.max_connections must be greater than zero");
        }
        if self.pool.acquire_timeout_ms == 0 {
            anyhow::bail!("pool.acquire_timeout_ms must be greater than zero");
        }
        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be greater than zero");
        }
        if self.cache.result_ttl_secs == 0 || self.cache.schema_ttl_secs == 0 {
            anyhow::bail!("cache TTLs must be greater than zero");
        }
        if self.generation.timeout_secs == 0 {
            anyhow::bail!("generation.timeout_secs must be greater than zero");
        }
        if self.generation.max_question_chars == 0 {
            anyhow::bail!("generation.max_question_chars must be greater than zero");
        }
        if self.validation.default_row_cap == 0 {
            anyhow::bail!("validation.default_row_cap must be greater than zero");
        }
        if !(0.0..=2.0).contains(&self.reasoning.temperature) {
            anyhow::bail!("reasoning.temperature must be between 0.0 and 2.0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_max_idle_age_secs")]
    pub max_idle_age_secs: u64,
    /// Ping pooled connections before handing them out
    #[serde(default = "default_true")]
    pub liveness_probe: bool,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_idle_age(&self) -> Duration {
        Duration::from_secs(self.max_idle_age_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_idle_age_secs: default_max_idle_age_secs(),
            liveness_probe: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    #[serde(default = "default_schema_ttl_secs")]
    pub schema_ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn ttl(&self, category: CacheCategory) -> Duration {
        match category {
            CacheCategory::Result => Duration::from_secs(self.result_ttl_secs),
            CacheCategory::Schema => Duration::from_secs(self.schema_ttl_secs),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            result_ttl_secs: default_result_ttl_secs(),
            schema_ttl_secs: default_schema_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_question_chars")]
    pub max_question_chars: usize,
    /// How many prior questions of the conversation go into the prompt
    #[serde(default = "default_max_context_items")]
    pub max_context_items: usize,
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_generation_timeout_secs(),
            max_question_chars: default_max_question_chars(),
            max_context_items: default_max_context_items(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_max_subquery_depth")]
    pub max_subquery_depth: usize,
    #[serde(default = "default_row_cap")]
    pub default_row_cap: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_subquery_depth: default_max_subquery_depth(),
            default_row_cap: default_row_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestConfig {
    /// Slack added on top of generation and execution budgets
    #[serde(default = "default_deadline_margin_ms")]
    pub deadline_margin_ms: u64,
}

impl RequestConfig {
    pub fn deadline_margin(&self) -> Duration {
        Duration::from_millis(self.deadline_margin_ms)
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            deadline_margin_ms: default_deadline_margin_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReasoningConfig {
    /// OpenAI-compatible chat completions endpoint
    #[serde(default = "default_reasoning_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_reasoning_model")]
    pub model: String,
    /// Tried once when the primary model call fails
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub api_key: Option<Secret>,
    #[serde(default = "default_reasoning_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
}

impl ReasoningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            endpoint: default_reasoning_endpoint(),
            model: default_reasoning_model(),
            fallback_model: None,
            api_key: None,
            timeout_secs: default_reasoning_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
        }
    }
}

/// One sensitivity rule. Omitted scope fields match anything.
#[derive(Debug, Clone, Deserialize)]
pub struct MaskingRule {
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    pub column: String,
    pub kind: MaskingKind,
}

fn default_max_connections() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_max_idle_age_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_result_ttl_secs() -> u64 {
    300
}

fn default_schema_ttl_secs() -> u64 {
    3_600
}

fn default_max_entries() -> usize {
    1_024
}

fn default_generation_timeout_secs() -> u64 {
    30
}

fn default_max_question_chars() -> usize {
    1_000
}

fn default_max_context_items() -> usize {
    3
}

fn default_max_subquery_depth() -> usize {
    3
}

fn default_row_cap() -> u64 {
    1_000
}

fn default_deadline_margin_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_reasoning_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_reasoning_model() -> String {
    "gpt-4".to_string()
}

fn default_reasoning_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    2_000
}
