//! Typed node configurations, parsed once from each node's raw JSON.
//!
//! Keys accept both snake_case and camelCase.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use strand_core::error::{Result, StrandError};
use strand_core::graph::Node;

/// Parse `node.config` into `T`. A null config yields `T::default()`.
pub fn parse<T: DeserializeOwned + Default>(node: &Node) -> Result<T> {
    if node.config.is_null() {
        return Ok(T::default());
    }
    parse_required(node)
}

/// Parse `node.config` into `T`, which has required fields.
pub fn parse_required<T: DeserializeOwned>(node: &Node) -> Result<T> {
    serde_json::from_value(node.config.clone()).map_err(|e| {
        StrandError::GraphInvalid(format!(
            "node '{}' has an invalid {} config: {}",
            node.id, node.node_type, e
        ))
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Overrides the run's system prompt. `{{var}}` placeholders are rendered.
    #[serde(default, alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    /// Appended to history as a user message before the call.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default, alias = "maxTokens")]
    pub max_tokens: Option<u32>,
    /// Offer the run's tools to the model.
    #[serde(default = "default_true", alias = "useTools")]
    pub use_tools: bool,
    #[serde(default, alias = "outputVar")]
    pub output_var: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallSpec {
    #[serde(alias = "name")]
    pub tool: String,
    #[serde(default, alias = "arguments", alias = "input")]
    pub args: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Explicit calls. When empty, the model's pending tool uses run instead.
    #[serde(default)]
    pub calls: Vec<ToolCallSpec>,
    #[serde(default, alias = "outputVar")]
    pub output_var: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Query template. Defaults to the latest user message.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_top_k", alias = "topK", alias = "limit")]
    pub top_k: usize,
    #[serde(default, alias = "outputVar")]
    pub output_var: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            query: None,
            top_k: default_top_k(),
            output_var: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalConfig {
    #[serde(alias = "expr", alias = "expression")]
    pub condition: String,
}

/// What a loop does when its predicate still holds at `max_iterations`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnLimit {
    #[default]
    Stop,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Continue while this holds. Without one the body runs `max_iterations` times.
    #[serde(default, alias = "expr")]
    pub condition: Option<String>,
    #[serde(default = "default_max_iterations", alias = "maxIterations")]
    pub max_iterations: u32,
    /// Entry node of the loop body.
    #[serde(alias = "bodyEntry", alias = "body_entry")]
    pub body: String,
    #[serde(default, alias = "onLimit")]
    pub on_limit: OnLimit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    #[default]
    Summarize,
    Truncate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub mode: MemoryMode,
    /// Message-count trigger. Defaults to the run's `memory_window`.
    #[serde(default)]
    pub window: Option<usize>,
    /// Messages kept verbatim after compaction. Defaults to half the window.
    #[serde(default, alias = "keepLast")]
    pub keep_last: Option<usize>,
    /// Token trigger (cl100k estimate).
    #[serde(default, alias = "maxTokens")]
    pub max_tokens: Option<usize>,
    #[serde(default, alias = "summaryPrompt")]
    pub summary_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableConfig {
    /// `name -> value`; string values are rendered against the context.
    #[serde(default, alias = "variables", alias = "assign")]
    pub set: Map<String, Value>,
    /// `target -> source` lookups.
    #[serde(default)]
    pub copy: Map<String, Value>,
    /// Store the latest assistant reply under this name.
    #[serde(default, alias = "fromResponse", alias = "from_response")]
    pub capture: Option<String>,
    #[serde(default, alias = "remove")]
    pub unset: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default, alias = "duration_ms", alias = "durationMs", alias = "milliseconds")]
    pub ms: Option<u64>,
    #[serde(default, alias = "secs")]
    pub seconds: Option<f64>,
}

impl DelayConfig {
    pub fn duration_ms(&self) -> u64 {
        self.ms
            .or_else(|| self.seconds.map(|s| (s.max(0.0) * 1000.0) as u64))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlerConfig {
    /// Reply appended in place of the failed step. `{{error}}` is the failure message.
    #[serde(default = "default_fallback", alias = "message", alias = "fallbackMessage")]
    pub fallback: String,
    #[serde(default = "default_error_var", alias = "errorVar", alias = "error_var")]
    pub variable: String,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            fallback: default_fallback(),
            variable: default_error_var(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_top_k() -> usize {
    4
}
fn default_max_iterations() -> u32 {
    10
}
fn default_fallback() -> String {
    "Sorry, I couldn't complete that request.".into()
}
fn default_error_var() -> String {
    "last_error".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::graph::NodeType;

    #[test]
    fn camel_case_keys_are_accepted() {
        let node = Node::new(
            "l",
            NodeType::Loop,
            json!({"maxIterations": 3, "bodyEntry": "step", "onLimit": "fail"}),
        );
        let cfg: LoopConfig = parse_required(&node).unwrap();
        assert_eq!(cfg.max_iterations, 3);
        assert_eq!(cfg.body, "step");
        assert_eq!(cfg.on_limit, OnLimit::Fail);
    }

    #[test]
    fn null_config_uses_defaults() {
        let node = Node::new("r", NodeType::Retrieval, Value::Null);
        let cfg: RetrievalConfig = parse(&node).unwrap();
        assert_eq!(cfg.top_k, 4);
        assert!(cfg.query.is_none());
    }

    #[test]
    fn invalid_config_is_graph_invalid() {
        let node = Node::new("m", NodeType::Model, json!({"temperature": "hot"}));
        let err = parse::<ModelConfig>(&node).unwrap_err();
        assert!(matches!(err, StrandError::GraphInvalid(msg) if msg.contains("'m'")));
    }

    #[test]
    fn delay_accepts_seconds() {
        let cfg = DelayConfig { ms: None, seconds: Some(1.5) };
        assert_eq!(cfg.duration_ms(), 1500);
        assert_eq!(DelayConfig::default().duration_ms(), 0);
    }
}
