//! Builders shared by this crate's unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use strand_core::config::{EngineConfig, RunConfig};
use strand_core::error::{Result, StrandError};
use strand_core::event::EventBus;
use strand_core::graph::NodeType;
use strand_core::traits::{ModelProvider, Retriever, Tool, ToolHandle};
use strand_core::types::{ChatMessage, DocumentScope, RunId};
use strand_test_utils::ScriptedProvider;

use crate::context::Context;
use crate::env::RunEnv;
use crate::nodes::{ExecutorRegistry, NodeExecutor, PlannedNode};
use crate::prepare::BoundRetriever;
use crate::sink::{ChunkSink, StreamEvent};

pub(crate) struct EnvBuilder {
    config: RunConfig,
    engine: EngineConfig,
    model: Arc<dyn ModelProvider>,
    tools: Vec<ToolHandle>,
    retriever: Option<BoundRetriever>,
    executors: ExecutorRegistry,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
}

pub(crate) fn env() -> EnvBuilder {
    EnvBuilder {
        config: RunConfig::default(),
        engine: EngineConfig::default(),
        model: Arc::new(ScriptedProvider::new()),
        tools: Vec::new(),
        retriever: None,
        executors: ExecutorRegistry::standard(),
        bus: Arc::new(EventBus::default()),
        cancel: CancellationToken::new(),
    }
}

impl EnvBuilder {
    pub fn config(mut self, f: impl FnOnce(&mut RunConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn engine(mut self, f: impl FnOnce(&mut EngineConfig)) -> Self {
        f(&mut self.engine);
        self
    }

    pub fn model(mut self, model: Arc<dyn ModelProvider>) -> Self {
        self.model = model;
        self
    }

    pub fn tool(mut self, tool: impl Tool) -> Self {
        self.tools.push(ToolHandle::new(Arc::new(tool)));
        self
    }

    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(BoundRetriever::new(retriever, DocumentScope::default()));
        self
    }

    pub fn executor(mut self, node_type: NodeType, executor: impl NodeExecutor) -> Self {
        self.executors.register(node_type, Arc::new(executor));
        self
    }

    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn finish(self, sink: Option<ChunkSink>) -> RunEnv {
        RunEnv {
            run_id: RunId::from_string("test-run"),
            user_id: "u1".into(),
            conversation_id: Some("c1".into()),
            config: self.config,
            engine: self.engine,
            model: self.model,
            tools: self.tools,
            retriever: self.retriever,
            executors: Arc::new(self.executors),
            bus: self.bus,
            cancel: self.cancel,
            sink,
        }
    }

    pub fn build(self) -> RunEnv {
        self.finish(None)
    }

    pub fn build_streaming(self, capacity: usize) -> (RunEnv, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = ChunkSink::new(
            tx,
            self.cancel.clone(),
            self.bus.clone(),
            RunId::from_string("test-run"),
            "u1".into(),
        );
        (self.finish(Some(sink)), rx)
    }
}

/// A context holding one user message.
pub(crate) fn ctx(input: &str) -> Context {
    Context::new("u1", Some("c1".into())).with_messages(vec![ChatMessage::user(input)])
}

/// Counts invocations and otherwise does nothing.
#[derive(Clone, Default)]
pub(crate) struct CountingExecutor {
    count: Arc<AtomicUsize>,
}

impl CountingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl NodeExecutor for CountingExecutor {
    fn execute<'a>(
        &'a self,
        _node: &'a PlannedNode,
        _ctx: &'a mut Context,
        _env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Always fails with `NodeFailed`.
pub(crate) struct FailingExecutor {
    message: String,
}

impl FailingExecutor {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl NodeExecutor for FailingExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a PlannedNode,
        _ctx: &'a mut Context,
        _env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            Err(StrandError::NodeFailed {
                node_id: node.id.clone(),
                message: self.message.clone(),
            })
        })
    }
}
