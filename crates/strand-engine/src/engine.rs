//! The engine façade: one entry point per execution mode.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use strand_core::config::{expand_home, AppConfig, EngineConfig, LogConfig, RunConfig, RunConfigPatch, StrategyKind};
use strand_core::error::{Result, StrandError};
use strand_core::event::{spawn_subscriber, EventBus, Subscriber};
use strand_core::graph::{NodeType, Source};
use strand_core::traits::{ModelResolver, Persistence, Retriever, ToolResolver};
use strand_core::types::{ChatMessage, RunId, ToolPermissions};

use crate::context::Context;
use crate::env::RunEnv;
use crate::lifecycle::RunLifecycle;
use crate::middleware::{CacheStore, Invocation, MemoryCacheStore, Pipeline};
use crate::nodes::{ExecutorRegistry, NodeExecutor};
use crate::prepare::{PreparedGraph, Preparer};
use crate::result::{ResultProcessor, RunMeta, RunResult};
use crate::sink::{ChunkSink, StreamEvent};
use crate::strategy::StrategyFactory;
use crate::subscribers::RunLogger;

const STREAM_BUFFER: usize = 64;

/// Chunks of a streaming run, terminated by [`StreamEvent::Done`].
pub type RunStream = ReceiverStream<StreamEvent>;

/// One invocation of a workflow.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: Source,
    /// Overrides applied on top of the engine's defaults.
    pub config: RunConfigPatch,
    pub input: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub permissions: ToolPermissions,
    /// Prior conversation, oldest first.
    pub history: Vec<ChatMessage>,
    pub metadata: Map<String, Value>,
    /// Force a strategy instead of the configured default.
    pub strategy: Option<StrategyKind>,
}

impl RunRequest {
    pub fn new(source: Source, user_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            source,
            config: RunConfigPatch::default(),
            input: input.into(),
            user_id: user_id.into(),
            conversation_id: None,
            permissions: ToolPermissions::All,
            history: Vec::new(),
            metadata: Map::new(),
            strategy: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_config(mut self, config: RunConfigPatch) -> Self {
        self.config = config;
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_permissions(mut self, permissions: ToolPermissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Runs workflows. Cheap to share behind an `Arc`; all per-run state lives
/// in the run itself.
pub struct WorkflowEngine {
    defaults: RunConfig,
    engine: EngineConfig,
    log: Option<LogConfig>,
    preparer: Preparer,
    executors: Arc<ExecutorRegistry>,
    strategies: StrategyFactory,
    pipeline: Pipeline,
    results: ResultProcessor,
    bus: Arc<EventBus>,
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl WorkflowEngine {
    pub fn builder(config: AppConfig) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new(config)
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Start every registered subscriber on its own task.
    pub fn spawn_subscribers(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.subscribers
            .iter()
            .map(|s| spawn_subscriber(&self.bus, s.clone(), cancel.clone()))
            .collect()
    }

    /// Resolve a source without running it.
    pub async fn prepare(&self, source: &Source, config: &RunConfigPatch) -> Result<PreparedGraph> {
        let config = self.defaults.merged(config);
        self.preparer
            .prepare(source, &config, &ToolPermissions::All)
            .await
    }

    /// Run to completion. Always returns a result; failures are described in it.
    pub async fn run(&self, request: RunRequest, cancel: CancellationToken) -> RunResult {
        self.drive(request, RunId::new(), cancel, None).await
    }

    /// Run on a background task and stream chunks as they are generated.
    ///
    /// The stream ends with exactly one [`StreamEvent::Done`]. Dropping it
    /// cancels the run.
    pub fn run_streaming(self: &Arc<Self>, request: RunRequest, cancel: CancellationToken) -> RunStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = cancel.child_token();
        let run_id = RunId::new();
        let sink = ChunkSink::new(
            tx,
            cancel.clone(),
            self.bus.clone(),
            run_id.clone(),
            request.user_id.clone(),
        );
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.drive(request, run_id, cancel, Some(sink)).await;
        });
        ReceiverStream::new(rx)
    }

    async fn drive(
        &self,
        request: RunRequest,
        run_id: RunId,
        cancel: CancellationToken,
        sink: Option<ChunkSink>,
    ) -> RunResult {
        self.spawn_run_logger(&run_id);

        let config = self.defaults.merged(&request.config);
        let mut lifecycle = RunLifecycle::new(run_id.clone(), &request.user_id, self.bus.clone());
        let mut meta = RunMeta::new(run_id.clone(), &request.user_id, request.conversation_id.clone());
        meta.definition_id = request.source.definition_id().map(str::to_string);
        meta.template_id = request.source.template_id().map(str::to_string);

        if let Err(e) = lifecycle.started(request.source.label(), sink.is_some()) {
            error!(run_id = %run_id, error = %e, "Lifecycle error");
        }
        info!(
            run_id = %run_id,
            user_id = %request.user_id,
            source = request.source.label(),
            streaming = sink.is_some(),
            "Run started"
        );

        let prepared = match self
            .preparer
            .prepare(&request.source, &config, &request.permissions)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                let result = self.results.fail(&meta, &e, None, None).await;
                return self.finish(&mut lifecycle, sink.as_ref(), result).await;
            }
        };

        let strategy = self.strategies.select(request.strategy, &prepared.plan);
        meta.strategy = Some(strategy.kind());

        let transition = match lifecycle.running() {
            Ok(()) if sink.is_some() => lifecycle.streaming(),
            other => other,
        };
        if let Err(e) = transition {
            error!(run_id = %run_id, error = %e, "Lifecycle error");
        }

        let env = RunEnv {
            run_id: run_id.clone(),
            user_id: request.user_id.clone(),
            conversation_id: request.conversation_id.clone(),
            config: prepared.config.clone(),
            engine: self.engine.clone(),
            model: prepared.model.clone(),
            tools: prepared.tools.clone(),
            retriever: prepared.retriever.clone(),
            executors: self.executors.clone(),
            bus: self.bus.clone(),
            cancel,
            sink,
        };
        let ctx = initial_context(&request, &prepared, &self.engine);
        let inv = Invocation {
            plan: &prepared.plan,
            env: &env,
            strategy: strategy.as_ref(),
            graph_key: &prepared.graph_key,
        };

        let outcome = self.pipeline.run(&inv, ctx).await;
        let streamed = match &env.sink {
            Some(sink) => Some(sink.accumulated().await),
            None => None,
        };

        let result = match outcome {
            Ok(ctx) => self.results.complete(&meta, ctx, streamed).await,
            Err(failure) => {
                self.results
                    .fail(&meta, &failure.error, Some(*failure.context), streamed)
                    .await
            }
        };
        self.finish(&mut lifecycle, env.sink.as_ref(), result).await
    }

    async fn finish(
        &self,
        lifecycle: &mut RunLifecycle,
        sink: Option<&ChunkSink>,
        result: RunResult,
    ) -> RunResult {
        if let Err(e) = lifecycle.finish(&result) {
            error!(run_id = %result.execution_id, error = %e, "Lifecycle error");
        }
        if let Some(sink) = sink {
            sink.finish(result.clone()).await;
        }
        result
    }

    fn spawn_run_logger(&self, run_id: &RunId) {
        if let Some(log) = self.log.as_ref().filter(|l| l.enabled) {
            // Not tied to the run's token: it must still see the terminal event.
            RunLogger::new(expand_home(&log.log_dir), log.level).spawn(
                &self.bus,
                run_id.clone(),
                CancellationToken::new(),
            );
        }
    }
}

fn initial_context(request: &RunRequest, prepared: &PreparedGraph, engine: &EngineConfig) -> Context {
    let mut messages = request.history.clone();
    if !request.input.is_empty() {
        messages.push(ChatMessage::user(&request.input));
    }
    let mut ctx = Context::new(request.user_id.clone(), request.conversation_id.clone())
        .with_trace_capacity(engine.trace_capacity)
        .with_messages(messages);
    ctx.metadata = request.metadata.clone();
    for (name, value) in &prepared.variables {
        ctx.set_variable(name.clone(), value.clone());
    }
    ctx
}

/// Assembles a [`WorkflowEngine`] from config and collaborators.
pub struct WorkflowEngineBuilder {
    config: AppConfig,
    models: Option<Arc<dyn ModelResolver>>,
    tools: Option<Arc<dyn ToolResolver>>,
    retriever: Option<Arc<dyn Retriever>>,
    persistence: Option<Arc<dyn Persistence>>,
    cache: Option<Arc<dyn CacheStore>>,
    executors: ExecutorRegistry,
    bus: Option<Arc<EventBus>>,
    strategies: Option<StrategyFactory>,
    pipeline: Option<Pipeline>,
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl WorkflowEngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            models: None,
            tools: None,
            retriever: None,
            persistence: None,
            cache: None,
            executors: ExecutorRegistry::standard(),
            bus: None,
            strategies: None,
            pipeline: None,
            subscribers: Vec::new(),
        }
    }

    pub fn models(mut self, models: Arc<dyn ModelResolver>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolResolver>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn executor(mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) -> Self {
        self.executors.register(node_type, executor);
        self
    }

    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn strategies(mut self, strategies: StrategyFactory) -> Self {
        self.strategies = Some(strategies);
        self
    }

    /// Replace the pipeline built from `[middleware]`.
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn build(self) -> Result<WorkflowEngine> {
        let models = self
            .models
            .ok_or_else(|| StrandError::Config("no model resolver configured".into()))?;

        let mut preparer = Preparer::new(models);
        if let Some(p) = &self.persistence {
            preparer = preparer.with_persistence(p.clone());
        }
        if let Some(t) = self.tools {
            preparer = preparer.with_tools(t);
        }
        if let Some(r) = self.retriever {
            preparer = preparer.with_retriever(r);
        }

        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(EventBus::new(self.config.engine.event_capacity)));

        let mut results = ResultProcessor::new(bus.clone());
        if let Some(p) = self.persistence {
            results = results.with_persistence(p);
        }

        let pipeline = match self.pipeline {
            Some(p) => p,
            None => {
                let cache = self.cache.unwrap_or_else(|| {
                    Arc::new(MemoryCacheStore::new(self.config.middleware.cache.clone()))
                });
                Pipeline::from_config(&self.config.middleware, cache)
            }
        };

        let strategies = self
            .strategies
            .unwrap_or_else(|| StrategyFactory::new(self.config.engine.strategy));

        Ok(WorkflowEngine {
            defaults: self.config.defaults,
            engine: self.config.engine,
            log: self.config.log,
            preparer,
            executors: Arc::new(self.executors),
            strategies,
            pipeline,
            results,
            bus,
            subscribers: self.subscribers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use strand_test_utils::{plain_graph, ScriptedProvider, StaticResolver};

    fn dynamic(graph: strand_core::graph::Graph) -> Source {
        Source::Dynamic {
            nodes: graph.nodes,
            edges: graph.edges,
            config: Map::new(),
        }
    }

    fn engine(provider: Arc<ScriptedProvider>) -> WorkflowEngine {
        WorkflowEngine::builder(AppConfig::default())
            .models(Arc::new(StaticResolver(provider)))
            .build()
            .unwrap()
    }

    #[test]
    fn builder_needs_a_model_resolver() {
        assert!(WorkflowEngine::builder(AppConfig::default()).build().is_err());
    }

    #[tokio::test]
    async fn blocking_run_returns_reply() {
        let engine = engine(Arc::new(ScriptedProvider::new()));
        let result = engine
            .run(
                RunRequest::new(dynamic(plain_graph()), "u1", "hello"),
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.response, "Hello from the scripted model.");
        assert_eq!(result.strategy, Some(StrategyKind::Sequential));
    }

    #[tokio::test]
    async fn preparation_failure_still_yields_a_result() {
        let engine = engine(Arc::new(ScriptedProvider::new()));
        let mut rx = engine.bus().subscribe();
        let result = engine
            .run(
                RunRequest::new(Source::Definition { id: "missing".into() }, "u1", "hello"),
                CancellationToken::new(),
            )
            .await;
        assert!(!result.is_success());
        let report = result.error.unwrap();
        assert_eq!(report.stage, strand_core::error::Stage::Preparation);
        assert_eq!(result.definition_id.as_deref(), Some("missing"));

        let mut failed = 0;
        while let Ok(event) = rx.try_recv() {
            if event.kind == strand_core::event::EventKind::RunFailed {
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn streaming_run_ends_with_done() {
        let engine = Arc::new(engine(Arc::new(ScriptedProvider::new())));
        let stream = engine.run_streaming(
            RunRequest::new(dynamic(plain_graph()), "u1", "hello"),
            CancellationToken::new(),
        );
        let events: Vec<StreamEvent> = stream.collect().await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk(c) => Some(c.delta.as_str()),
                StreamEvent::Done(_) => None,
            })
            .collect();
        assert_eq!(text, "Hello from the scripted model.");
        match events.last() {
            Some(StreamEvent::Done(result)) => {
                assert!(result.is_success());
                assert_eq!(result.response, text);
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }
}
