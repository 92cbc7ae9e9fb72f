use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};
use crate::types::DocumentScope;

/// Top-level strand configuration (`strand.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Per-run defaults; requests override individual fields.
    #[serde(default)]
    pub defaults: RunConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub middleware: MiddlewareConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Settings for one workflow run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_true", alias = "enableTools")]
    pub enable_tools: bool,
    #[serde(default, alias = "enableRetrieval")]
    pub enable_retrieval: bool,
    #[serde(default = "default_true", alias = "enableMemory")]
    pub enable_memory: bool,
    /// Tool allow-list. `None` allows every tool the user may use.
    #[serde(default, alias = "allowedTools")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, alias = "documentScope")]
    pub document_scope: DocumentScope,
    /// Message count above which memory nodes compact history.
    #[serde(default = "default_memory_window", alias = "memoryWindow")]
    pub memory_window: usize,
    #[serde(default = "default_max_tool_calls", alias = "maxToolCalls")]
    pub max_tool_calls: u32,
    #[serde(default, alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    /// Timeout applied to every model, tool and retriever call.
    #[serde(default = "default_call_timeout", alias = "callTimeoutSecs")]
    pub call_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            enable_tools: true,
            enable_retrieval: false,
            enable_memory: true,
            allowed_tools: None,
            document_scope: DocumentScope::default(),
            memory_window: default_memory_window(),
            max_tool_calls: default_max_tool_calls(),
            system_prompt: None,
            call_timeout_secs: default_call_timeout(),
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_model() -> String { "gpt-4o-mini".to_string() }
fn default_temperature() -> f32 { 0.2 }
fn default_max_tokens() -> u32 { 2048 }
fn default_true() -> bool { true }
fn default_memory_window() -> usize { 40 }
fn default_max_tool_calls() -> u32 { 8 }
fn default_call_timeout() -> u64 { 60 }

/// Request-level overrides applied on top of `[defaults]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfigPatch {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub enable_tools: Option<bool>,
    #[serde(default)]
    pub enable_retrieval: Option<bool>,
    #[serde(default)]
    pub enable_memory: Option<bool>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub document_scope: Option<DocumentScope>,
    #[serde(default)]
    pub memory_window: Option<usize>,
    #[serde(default)]
    pub max_tool_calls: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
}

impl RunConfig {
    /// Copy of `self` with every field set in `patch` replaced.
    pub fn merged(&self, patch: &RunConfigPatch) -> RunConfig {
        let mut out = self.clone();
        if let Some(v) = &patch.provider {
            out.provider = v.clone();
        }
        if let Some(v) = &patch.model {
            out.model = v.clone();
        }
        if let Some(v) = patch.temperature {
            out.temperature = v;
        }
        if let Some(v) = patch.max_tokens {
            out.max_tokens = v;
        }
        if let Some(v) = patch.enable_tools {
            out.enable_tools = v;
        }
        if let Some(v) = patch.enable_retrieval {
            out.enable_retrieval = v;
        }
        if let Some(v) = patch.enable_memory {
            out.enable_memory = v;
        }
        if patch.allowed_tools.is_some() {
            out.allowed_tools = patch.allowed_tools.clone();
        }
        if let Some(v) = &patch.document_scope {
            out.document_scope = v.clone();
        }
        if let Some(v) = patch.memory_window {
            out.memory_window = v;
        }
        if let Some(v) = patch.max_tool_calls {
            out.max_tool_calls = v;
        }
        if patch.system_prompt.is_some() {
            out.system_prompt = patch.system_prompt.clone();
        }
        if let Some(v) = patch.call_timeout_secs {
            out.call_timeout_secs = v;
        }
        out
    }
}

/// Which executor strategy runs a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Pick per graph shape.
    #[default]
    Auto,
    Sequential,
    #[serde(alias = "dag")]
    Graph,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Upper bound on concurrently running branches.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Delay nodes are clamped to this duration.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Entries kept in each run's execution trace.
    #[serde(default = "default_trace_capacity")]
    pub trace_capacity: usize,
    /// EventBus broadcast buffer.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Auto,
            max_parallel: default_max_parallel(),
            max_delay_ms: default_max_delay_ms(),
            trace_capacity: default_trace_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_parallel() -> usize { 4 }
fn default_max_delay_ms() -> u64 { 60_000 }
fn default_trace_capacity() -> usize { 256 }
fn default_event_capacity() -> usize { 1024 }

/// Middleware available to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareKind {
    Monitoring,
    #[serde(alias = "caching")]
    Cache,
    Retry,
    Validation,
    #[serde(alias = "rate_limiting")]
    RateLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// Outermost first.
    #[serde(default = "default_middleware_order")]
    pub order: Vec<MiddlewareKind>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            order: default_middleware_order(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

fn default_middleware_order() -> Vec<MiddlewareKind> {
    vec![
        MiddlewareKind::Monitoring,
        MiddlewareKind::RateLimit,
        MiddlewareKind::Validation,
        MiddlewareKind::Cache,
        MiddlewareKind::Retry,
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_entries(),
        }
    }
}

fn default_cache_ttl() -> u64 { 300 }
fn default_cache_entries() -> usize { 1024 }

/// Retry configuration for workflow invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30_000 }

/// Whom a rate limit counts against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    #[default]
    PerUser,
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Invocations allowed per window.
    #[serde(default = "default_rate_requests")]
    pub max_requests: usize,
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
    /// In-flight invocations allowed at once (None = unbounded).
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub scope: RateLimitScope,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_rate_requests(),
            window_secs: default_rate_window(),
            max_concurrent: None,
            scope: RateLimitScope::PerUser,
        }
    }
}

fn default_rate_requests() -> usize { 60 }
fn default_rate_window() -> u64 { 60 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Raise on shape violations instead of logging them.
    #[serde(default)]
    pub strict: bool,
}

/// Per-million-token prices in USD.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_per_mtok: f64,
    #[serde(default)]
    pub output_per_mtok: f64,
}

impl ModelPricing {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_mtok + output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

/// An OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    /// Pricing by model id, used when the provider reports no cost.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.strand/strand.db".to_string() }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run summary only, 2 = per-node, 3 = per-chunk.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_dir() -> String { "~/.strand/logs".to_string() }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrandError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| StrandError::Config(e.to_string()))
    }

    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn env_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").expect("env pattern is a valid regex"))
}

/// Expand `${ENV_VAR}` patterns. Unset variables are left untouched.
fn expand_env_vars(input: &str) -> String {
    env_re()
        .replace_all(input, |caps: &Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
