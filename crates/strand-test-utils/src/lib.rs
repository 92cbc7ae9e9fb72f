//! Mocks and fixtures shared by Strand's unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;

use strand_core::error::{Result, StrandError};
use strand_core::graph::{Edge, Graph, Node, NodeType, WorkflowDefinition, WorkflowTemplate};
use strand_core::traits::{ModelProvider, ModelResolver, Persistence, Retriever, Tool};
use strand_core::types::*;

/// One canned model reply.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub text: String,
    pub tool_uses: Vec<ToolUseRequest>,
    pub usage: Usage,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_uses: Vec::new(),
            usage: Usage::new(12, 6),
        }
    }

    pub fn tool_call(name: &str, input: serde_json::Value) -> Self {
        Self {
            text: String::new(),
            tool_uses: vec![ToolUseRequest {
                id: format!("call_{}", name),
                name: name.to_string(),
                input,
            }],
            usage: Usage::new(10, 4),
        }
    }
}

/// A model provider that replays scripted replies and records requests.
///
/// Text is streamed word by word; `chunk_delay` spaces the words out so
/// tests can cancel mid-stream.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: ScriptedReply,
    failures: Mutex<VecDeque<StrandError>>,
    chunk_delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: ScriptedReply::text("Hello from the scripted model."),
            failures: Mutex::new(VecDeque::new()),
            chunk_delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Reply used once the script is exhausted.
    pub fn always(reply: ScriptedReply) -> Self {
        Self {
            fallback: reply,
            ..Self::new()
        }
    }

    pub fn with_reply(self, reply: ScriptedReply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    /// Fail the next call with `err` (queued before any reply).
    pub fn with_failure(self, err: StrandError) -> Self {
        self.failures.lock().unwrap().push_back(err);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_reply(&self) -> ScriptedReply {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn stream_invoke(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<ModelDelta>>>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }

            let reply = self.next_reply();
            let mut deltas: Vec<ModelDelta> = reply
                .text
                .split_inclusive(' ')
                .map(|w| ModelDelta::Text(w.to_string()))
                .collect();
            let stop = if reply.tool_uses.is_empty() {
                StopReason::EndTurn
            } else {
                StopReason::ToolUse
            };
            deltas.extend(reply.tool_uses.into_iter().map(ModelDelta::ToolUse));
            deltas.push(ModelDelta::Stop(stop));
            deltas.push(ModelDelta::Usage(reply.usage));

            let delay = self.chunk_delay;
            let s = stream::iter(deltas).then(move |d| async move {
                if let (Some(delay), ModelDelta::Text(_)) = (delay, &d) {
                    tokio::time::sleep(delay).await;
                }
                Ok(d)
            });
            Ok(s.boxed())
        })
    }
}

/// Resolves every `(provider, model)` pair to one shared provider.
pub struct StaticResolver(pub Arc<dyn ModelProvider>);

impl ModelResolver for StaticResolver {
    fn resolve(&self, _provider: &str, _model: &str) -> Result<Arc<dyn ModelProvider>> {
        Ok(self.0.clone())
    }
}

/// A tool that counts invocations and echoes its input.
#[derive(Clone)]
pub struct CountingTool {
    name: String,
    count: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl CountingTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared counter; clone before registering the tool.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }
}

impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Echoes its input and counts invocations"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            self.count.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(ToolOutput::success(format!("{}: {}", self.name, input)))
        })
    }
}

/// A retriever over a fixed set of chunks, optionally failing.
#[derive(Default)]
pub struct StaticRetriever {
    chunks: Vec<DocumentChunk>,
    fail: bool,
    queries: Mutex<Vec<String>>,
}

impl StaticRetriever {
    pub fn new(chunks: Vec<DocumentChunk>) -> Self {
        Self {
            chunks,
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

pub fn chunk(document_id: &str, content: &str) -> DocumentChunk {
    DocumentChunk {
        document_id: document_id.to_string(),
        content: content.to_string(),
        score: 1.0,
        metadata: serde_json::Value::Null,
    }
}

impl Retriever for StaticRetriever {
    fn retrieve(
        &self,
        query: &str,
        _scope: &DocumentScope,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<DocumentChunk>>> {
        self.queries.lock().unwrap().push(query.to_string());
        Box::pin(async move {
            if self.fail {
                return Err(StrandError::Database("index offline".into()));
            }
            Ok(self.chunks.iter().take(limit).cloned().collect())
        })
    }
}

/// One `save_message` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedMessage {
    pub conversation_id: String,
    pub content: String,
    pub usage: UsageTotals,
}

/// In-memory `Persistence` with recorded writes.
#[derive(Default)]
pub struct MemoryPersistence {
    definitions: Mutex<HashMap<String, WorkflowDefinition>>,
    templates: Mutex<HashMap<String, WorkflowTemplate>>,
    saved: Mutex<Vec<SavedMessage>>,
    aggregates: Mutex<HashMap<String, (u64, f64)>>,
    fail_saves: bool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `save_message` fails.
    pub fn failing_saves() -> Self {
        Self {
            fail_saves: true,
            ..Default::default()
        }
    }

    pub fn with_definition(self, def: WorkflowDefinition) -> Self {
        self.put_definition(def);
        self
    }

    /// Insert or replace a definition in place.
    pub fn put_definition(&self, def: WorkflowDefinition) {
        self.definitions.lock().unwrap().insert(def.id.clone(), def);
    }

    pub fn with_template(self, template: WorkflowTemplate) -> Self {
        self.templates
            .lock()
            .unwrap()
            .insert(template.id.clone(), template);
        self
    }

    pub fn saved(&self) -> Vec<SavedMessage> {
        self.saved.lock().unwrap().clone()
    }

    pub fn aggregates(&self, conversation_id: &str) -> Option<(u64, f64)> {
        self.aggregates.lock().unwrap().get(conversation_id).copied()
    }
}

impl Persistence for MemoryPersistence {
    fn load_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let found = self.definitions.lock().unwrap().get(id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn load_template(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowTemplate>>> {
        let found = self.templates.lock().unwrap().get(id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn save_message(
        &self,
        conversation_id: &str,
        content: &str,
        usage: &UsageTotals,
    ) -> BoxFuture<'_, Result<MessageId>> {
        let record = SavedMessage {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            usage: usage.clone(),
        };
        Box::pin(async move {
            if self.fail_saves {
                return Err(StrandError::Database("disk full".into()));
            }
            let mut saved = self.saved.lock().unwrap();
            saved.push(record);
            Ok(MessageId(format!("msg-{}", saved.len())))
        })
    }

    fn update_conversation_aggregates(
        &self,
        conversation_id: &str,
        token_delta: u64,
        cost_delta: f64,
    ) -> BoxFuture<'_, Result<()>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let mut agg = self.aggregates.lock().unwrap();
            let entry = agg.entry(conversation_id).or_insert((0, 0.0));
            entry.0 += token_delta;
            entry.1 += cost_delta;
            Ok(())
        })
    }
}

// ── Graph fixtures ──────────────────────────────────────────────

/// `start -> answer(model) -> end`
pub fn plain_graph() -> Graph {
    Graph::new(
        vec![
            Node::start("start"),
            Node::new("answer", NodeType::Model, json!({})),
            Node::new("end", NodeType::End, serde_json::Value::Null),
        ],
        vec![Edge::always("start", "answer"), Edge::always("answer", "end")],
    )
}

/// `start -> lookup(tool: search) -> answer(model)`
pub fn tool_graph() -> Graph {
    Graph::new(
        vec![
            Node::start("start"),
            Node::new(
                "lookup",
                NodeType::Tool,
                json!({"calls": [{"tool": "search", "args": {"q": "{{topic}}"}}]}),
            ),
            Node::new("answer", NodeType::Model, json!({})),
        ],
        vec![Edge::always("start", "lookup"), Edge::always("lookup", "answer")],
    )
}

/// `start -> docs(retrieval) -> answer(model)`
pub fn retrieval_graph() -> Graph {
    Graph::new(
        vec![
            Node::start("start"),
            Node::new("docs", NodeType::Retrieval, json!({"top_k": 3})),
            Node::new("answer", NodeType::Model, json!({})),
        ],
        vec![Edge::always("start", "docs"), Edge::always("docs", "answer")],
    )
}

/// Two independent variable writers joined before an end node.
pub fn fan_out_graph() -> Graph {
    Graph::new(
        vec![
            Node::start("start"),
            Node::new("left", NodeType::Variable, json!({"set": {"left": "L"}})),
            Node::new("right", NodeType::Variable, json!({"set": {"right": "R"}})),
            Node::new("end", NodeType::End, serde_json::Value::Null),
        ],
        vec![
            Edge::always("start", "left"),
            Edge::always("start", "right"),
            Edge::always("left", "end"),
            Edge::always("right", "end"),
        ],
    )
}

pub fn tool_context() -> ToolContext {
    ToolContext {
        run_id: RunId::new(),
        user_id: "test-user".into(),
        conversation_id: Some("test-conversation".into()),
    }
}
