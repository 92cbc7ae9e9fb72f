use std::collections::{BTreeMap, HashMap, VecDeque};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strand_core::config::{ModelPricing, ProviderConfig};
use strand_core::error::{Result, StrandError};
use strand_core::traits::ModelProvider;
use strand_core::types::*;

use crate::streaming::{SseEvent, SseStream};

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat completion provider. Works with OpenAI, Ollama,
/// vLLM, Groq, OpenRouter and anything else speaking the same dialect.
pub struct OpenAiProvider {
    name: String,
    http: Client,
    base_url: String,
    api_key: Option<String>,
    extra_headers: Vec<(String, String)>,
    pricing: HashMap<String, ModelPricing>,
}

impl OpenAiProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            http: Client::new(),
            base_url: base_url.into(),
            api_key: None,
            extra_headers: Vec::new(),
            pricing: HashMap::new(),
        }
    }

    pub fn from_config(name: &str, config: &ProviderConfig, default_url: &str) -> Self {
        let mut provider = Self::new(name, config.base_url.as_deref().unwrap_or(default_url));
        provider.api_key = config.api_key.clone().filter(|k| !k.is_empty());
        provider.extra_headers = config
            .extra_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        provider.pricing = config.pricing.clone();
        provider
    }

    pub fn with_http(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize, Debug, PartialEq)]
pub(crate) struct OaiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OaiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OaiMessage {
    fn text(role: &'static str, content: String) -> Self {
        Self {
            role,
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct OaiToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function: Option<OaiFunction>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct OaiFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<String>,
}

#[derive(Serialize)]
struct OaiTool {
    r#type: &'static str,
    function: OaiToolDef,
}

#[derive(Serialize)]
struct OaiToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChunkBody {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Deserialize, Debug)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaiToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    /// Reported by some gateways (e.g. OpenRouter).
    #[serde(default)]
    cost: Option<f64>,
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<OaiTool> {
    tools
        .iter()
        .map(|t| OaiTool {
            r#type: "function",
            function: OaiToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect()
}

pub(crate) fn convert_messages(messages: &[ChatMessage]) -> Vec<OaiMessage> {
    let mut out = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => out.push(OaiMessage::text("system", msg.text())),
            Role::User => out.push(OaiMessage::text("user", msg.text())),
            Role::Assistant => {
                let uses = msg.tool_uses();
                if uses.is_empty() {
                    out.push(OaiMessage::text("assistant", msg.text()));
                    continue;
                }
                let calls = uses
                    .iter()
                    .enumerate()
                    .map(|(i, (id, name, input))| OaiToolCall {
                        index: i,
                        id: Some(id.to_string()),
                        r#type: Some("function".to_string()),
                        function: Some(OaiFunction {
                            name: Some(name.to_string()),
                            arguments: Some(input.to_string()),
                        }),
                    })
                    .collect();
                let text = msg.text();
                out.push(OaiMessage {
                    role: "assistant",
                    content: (!text.is_empty()).then_some(text),
                    tool_calls: Some(calls),
                    tool_call_id: None,
                });
            }
            Role::Tool => {
                for block in &msg.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = block
                    {
                        out.push(OaiMessage {
                            role: "tool",
                            content: Some(content.clone()),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                        });
                    }
                }
            }
        }
    }

    out
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Turns SSE chunks into `ModelDelta`s, assembling tool calls that arrive
/// as fragments keyed by index.
#[derive(Default)]
pub(crate) struct ChunkAssembler {
    calls: BTreeMap<usize, PartialCall>,
    pricing: Option<ModelPricing>,
}

impl ChunkAssembler {
    pub(crate) fn new(pricing: Option<ModelPricing>) -> Self {
        Self {
            calls: BTreeMap::new(),
            pricing,
        }
    }

    pub(crate) fn push(&mut self, event: &SseEvent) -> Vec<ModelDelta> {
        if event.is_done() {
            return self.flush_calls();
        }

        let chunk: ChunkBody = match serde_json::from_str(&event.data) {
            Ok(c) => c,
            Err(e) => {
                warn!(data = %event.data, error = %e, "Failed to parse SSE chunk");
                return Vec::new();
            }
        };

        let mut deltas = Vec::new();

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    deltas.push(ModelDelta::Text(text));
                }
            }
            for tc in choice.delta.tool_calls.unwrap_or_default() {
                let slot = self.calls.entry(tc.index).or_default();
                if let Some(id) = tc.id {
                    slot.id = id;
                }
                if let Some(func) = tc.function {
                    if let Some(name) = func.name {
                        slot.name.push_str(&name);
                    }
                    if let Some(args) = func.arguments {
                        slot.arguments.push_str(&args);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                deltas.extend(self.flush_calls());
                let stop = match reason.as_str() {
                    "tool_calls" | "function_call" => StopReason::ToolUse,
                    "length" => StopReason::MaxTokens,
                    "content_filter" => StopReason::StopSequence,
                    _ => StopReason::EndTurn,
                };
                deltas.push(ModelDelta::Stop(stop));
            }
        }

        if let Some(u) = chunk.usage {
            let mut usage = Usage::new(u.prompt_tokens, u.completion_tokens);
            usage.cost = u.cost.or_else(|| {
                self.pricing
                    .as_ref()
                    .map(|p| p.cost(u.prompt_tokens, u.completion_tokens))
            });
            deltas.push(ModelDelta::Usage(usage));
        }

        deltas
    }

    fn flush_calls(&mut self) -> Vec<ModelDelta> {
        std::mem::take(&mut self.calls)
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let input = if c.arguments.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&c.arguments)
                        .unwrap_or(serde_json::Value::String(c.arguments))
                };
                ModelDelta::ToolUse(ToolUseRequest {
                    id: c.id,
                    name: c.name,
                    input,
                })
            })
            .collect()
    }
}

impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream_invoke(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<ModelDelta>>>> {
        Box::pin(async move {
            let body = ChatRequest {
                messages: convert_messages(&request.messages),
                tools: convert_tools(&request.tools),
                model: request.model.clone(),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                stream: true,
                stream_options: StreamOptions {
                    include_usage: true,
                },
            };

            let mut req = self.http.post(&self.base_url).json(&body);
            if let Some(api_key) = &self.api_key {
                req = req.bearer_auth(api_key);
            }
            for (k, v) in &self.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            debug!(provider = %self.name, model = %request.model, messages = body.messages.len(), "Sending model request");

            let response = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    StrandError::ProviderRequest(format!("timeout: {}", e))
                } else {
                    StrandError::ProviderRequest(e.to_string())
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                let text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                let msg = format!("HTTP {}: {}", status.as_u16(), text);
                return Err(if status.as_u16() == 429 {
                    StrandError::ProviderRateLimited(msg)
                } else {
                    StrandError::ProviderRequest(msg)
                });
            }

            let events = SseStream::new(Box::pin(response.bytes_stream()));
            let assembler = ChunkAssembler::new(self.pricing.get(&request.model).cloned());

            let deltas = stream::unfold(
                (events, assembler, VecDeque::new(), false),
                |(mut events, mut asm, mut pending, mut done)| async move {
                    loop {
                        if let Some(delta) = pending.pop_front() {
                            return Some((Ok(delta), (events, asm, pending, done)));
                        }
                        if done {
                            return None;
                        }
                        match events.next().await {
                            Some(Ok(event)) => {
                                done = event.is_done();
                                pending.extend(asm.push(&event));
                            }
                            Some(Err(e)) => return Some((Err(e), (events, asm, pending, true))),
                            None => {
                                done = true;
                                pending.extend(asm.flush_calls());
                            }
                        }
                    }
                },
            );

            Ok(deltas.boxed())
        })
    }
}
