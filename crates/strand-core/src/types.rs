use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one workflow run (execution id).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a persisted assistant message.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A chat message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
        }
    }

    /// Assistant message carrying text plus the tool calls the model requested.
    pub fn assistant_with_tools(text: impl Into<String>, calls: &[ToolUseRequest]) -> Self {
        let text = text.into();
        let mut content = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
        content.extend(calls.iter().map(|c| ContentBlock::ToolUse {
            id: c.id.clone(),
            name: c.name.clone(),
            input: c.input.clone(),
        }));
        Self {
            role: Role::Assistant,
            content,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }],
            timestamp: Some(Utc::now()),
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool use blocks from this message.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    /// Ids of tool results carried by this message.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Stop reason reported by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// Token usage reported by a provider for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Provider-reported cost in USD, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Accumulated usage across all model calls of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub model_calls: u32,
}

impl UsageTotals {
    /// Add one provider call's usage.
    pub fn record(&mut self, usage: &Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cost += usage.cost.unwrap_or(0.0);
        self.model_calls += 1;
    }

    /// Add another accumulator.
    pub fn absorb(&mut self, other: &UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost += other.cost;
        self.model_calls += other.model_calls;
    }

    /// The part of `self` accumulated since `base`.
    pub fn since(&self, base: &UsageTotals) -> UsageTotals {
        UsageTotals {
            input_tokens: self.input_tokens.saturating_sub(base.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(base.output_tokens),
            cost: (self.cost - base.cost).max(0.0),
            model_calls: self.model_calls.saturating_sub(base.model_calls),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseRequest {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// A request to a model provider.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub tools: Vec<ToolDefinition>,
}

/// A streaming delta from a model provider.
#[derive(Debug, Clone)]
pub enum ModelDelta {
    /// A chunk of text content.
    Text(String),
    /// A fully assembled tool call.
    ToolUse(ToolUseRequest),
    /// Usage information, sent once near the end of the stream.
    Usage(Usage),
    /// The response is complete.
    Stop(StopReason),
}

/// A complete (non-streaming) model response.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub text: String,
    pub tool_uses: Vec<ToolUseRequest>,
    pub usage: Usage,
    pub stop_reason: Option<StopReason>,
}

impl ModelResponse {
    /// Fold one streaming delta into the response.
    pub fn apply(&mut self, delta: ModelDelta) {
        match delta {
            ModelDelta::Text(text) => self.text.push_str(&text),
            ModelDelta::ToolUse(call) => self.tool_uses.push(call),
            ModelDelta::Usage(usage) => {
                self.usage.input_tokens += usage.input_tokens;
                self.usage.output_tokens += usage.output_tokens;
                self.usage.cost = match (self.usage.cost, usage.cost) {
                    (Some(a), Some(b)) => Some(a + b),
                    (a, b) => a.or(b),
                };
            }
            ModelDelta::Stop(reason) => self.stop_reason = Some(reason),
        }
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition for sending to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub user_id: String,
    pub conversation_id: Option<String>,
}

/// Which tools a user may invoke.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPermissions {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl ToolPermissions {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(names.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, tool: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(tool),
        }
    }
}

/// Documents a retriever may search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentScope {
    /// Restrict to one collection (None = all collections).
    #[serde(default)]
    pub collection: Option<String>,
    /// Restrict to these documents (empty = all documents).
    #[serde(default)]
    pub document_ids: Vec<String>,
}

impl DocumentScope {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: Some(name.into()),
            document_ids: Vec::new(),
        }
    }
}

/// A chunk of a document returned by a retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub document_id: String,
    pub content: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// One piece of streamed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Position in the run's chunk sequence, starting at 0.
    pub index: u64,
    /// Node that produced the chunk.
    pub node_id: String,
    pub delta: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_response_accumulates_deltas() {
        let mut resp = ModelResponse::default();
        resp.apply(ModelDelta::Text("Hel".into()));
        resp.apply(ModelDelta::Text("lo".into()));
        resp.apply(ModelDelta::Usage(Usage::new(10, 2)));
        resp.apply(ModelDelta::Usage(Usage::new(0, 3).with_cost(0.01)));
        resp.apply(ModelDelta::Stop(StopReason::EndTurn));

        assert_eq!(resp.text, "Hello");
        assert_eq!(resp.usage.input_tokens, 10);
        assert_eq!(resp.usage.output_tokens, 5);
        assert_eq!(resp.usage.cost, Some(0.01));
        assert_eq!(resp.stop_reason, Some(StopReason::EndTurn));
    }

    #[test]
    fn usage_totals_since_base() {
        let mut base = UsageTotals::default();
        base.record(&Usage::new(5, 5).with_cost(0.5));
        let mut later = base.clone();
        later.record(&Usage::new(3, 4).with_cost(0.25));

        let delta = later.since(&base);
        assert_eq!(delta.input_tokens, 3);
        assert_eq!(delta.output_tokens, 4);
        assert_eq!(delta.model_calls, 1);
        assert!((delta.cost - 0.25).abs() < 1e-9);
    }

    #[test]
    fn assistant_with_tools_keeps_calls() {
        let calls = vec![ToolUseRequest {
            id: "c1".into(),
            name: "lookup".into(),
            input: serde_json::json!({"q": "rust"}),
        }];
        let msg = ChatMessage::assistant_with_tools("", &calls);
        assert_eq!(msg.tool_uses().len(), 1);
        assert_eq!(msg.text(), "");
    }

    #[test]
    fn permissions_only_allows_listed() {
        let perms = ToolPermissions::only(["search"]);
        assert!(perms.allows("search"));
        assert!(!perms.allows("shell"));
        assert!(ToolPermissions::All.allows("shell"));
    }
}
