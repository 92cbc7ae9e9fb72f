use std::sync::Arc;
use std::time::Duration;

use strand_core::config::{EngineConfig, RunConfig};
use strand_core::event::{Event, EventBus, EventKind};
use strand_core::traits::{ModelProvider, ToolHandle};
use strand_core::types::{RunId, ToolContext};
use tokio_util::sync::CancellationToken;

use crate::nodes::ExecutorRegistry;
use crate::prepare::BoundRetriever;
use crate::sink::ChunkSink;

/// Read-only resources shared by every node of one run.
pub struct RunEnv {
    pub run_id: RunId,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub config: RunConfig,
    pub engine: EngineConfig,
    pub model: Arc<dyn ModelProvider>,
    pub tools: Vec<ToolHandle>,
    pub retriever: Option<BoundRetriever>,
    pub executors: Arc<ExecutorRegistry>,
    pub bus: Arc<EventBus>,
    pub cancel: CancellationToken,
    /// Present only for streaming runs.
    pub sink: Option<ChunkSink>,
}

impl RunEnv {
    pub fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        self.bus
            .publish(Event::new(kind, &self.run_id, &self.user_id, payload));
    }

    pub fn tool(&self, name: &str) -> Option<&ToolHandle> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.call_timeout_secs.max(1))
    }

    pub fn tool_context(&self) -> ToolContext {
        ToolContext {
            run_id: self.run_id.clone(),
            user_id: self.user_id.clone(),
            conversation_id: self.conversation_id.clone(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.sink.is_some()
    }
}
