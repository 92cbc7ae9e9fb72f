use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::{Result, StrandError};
use crate::graph::{WorkflowDefinition, WorkflowTemplate};
use crate::types::*;

/// Model provider: streaming chat completion.
pub trait ModelProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Stream deltas for a request. The stream ends after a `Usage` delta.
    fn stream_invoke(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<ModelDelta>>>>;

    /// Blocking invocation. Defaults to draining `stream_invoke`.
    fn invoke(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        Box::pin(async move {
            let mut stream = self.stream_invoke(request).await?;
            let mut response = ModelResponse::default();
            while let Some(delta) = stream.next().await {
                response.apply(delta?);
            }
            Ok(response)
        })
    }
}

/// Resolves a model provider for a `(provider, model)` pair.
pub trait ModelResolver: Send + Sync + 'static {
    fn resolve(&self, provider: &str, model: &str) -> Result<Arc<dyn ModelProvider>>;
}

/// A callable tool exposed to models and tool nodes.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in model tool calls and explicit tool nodes).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>>;

    /// Timeout in seconds for one invocation.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// A resolved tool with its per-call timeout enforced.
#[derive(Clone)]
pub struct ToolHandle {
    tool: Arc<dyn Tool>,
    timeout: Duration,
}

impl ToolHandle {
    pub fn new(tool: Arc<dyn Tool>) -> Self {
        let timeout = Duration::from_secs(tool.timeout_secs());
        Self { tool, timeout }
    }

    /// Cap the timeout at `limit` (e.g. the run's call timeout).
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = self.timeout.min(limit);
        self
    }

    pub fn name(&self) -> &str {
        self.tool.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.tool.name().to_string(),
            description: self.tool.description().to_string(),
            input_schema: self.tool.input_schema(),
        }
    }

    pub async fn invoke(&self, input: serde_json::Value, ctx: ToolContext) -> Result<ToolOutput> {
        match tokio::time::timeout(self.timeout, self.tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(StrandError::ToolTimeout {
                tool: self.tool.name().to_string(),
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandle")
            .field("name", &self.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Resolves the tools a run may use.
pub trait ToolResolver: Send + Sync + 'static {
    /// Tools in `allow_list` (all when `None`) that `permissions` grants.
    fn resolve_tools(
        &self,
        allow_list: Option<&[String]>,
        permissions: &ToolPermissions,
    ) -> Vec<ToolHandle>;
}

/// Document retrieval over a scope.
pub trait Retriever: Send + Sync + 'static {
    fn retrieve(
        &self,
        query: &str,
        scope: &DocumentScope,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<DocumentChunk>>>;
}

/// Storage for workflows, messages and conversation aggregates.
pub trait Persistence: Send + Sync + 'static {
    fn load_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>>;

    fn load_template(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowTemplate>>>;

    /// Persist the final assistant message of a run.
    fn save_message(
        &self,
        conversation_id: &str,
        content: &str,
        usage: &UsageTotals,
    ) -> BoxFuture<'_, Result<MessageId>>;

    fn update_conversation_aggregates(
        &self,
        conversation_id: &str,
        token_delta: u64,
        cost_delta: f64,
    ) -> BoxFuture<'_, Result<()>>;
}
