//! The canonical run result and the processor that builds it.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use strand_core::config::StrategyKind;
use strand_core::error::{ErrorReport, StrandError};
use strand_core::event::{Event, EventBus, EventKind};
use strand_core::traits::Persistence;
use strand_core::types::{ChatMessage, MessageId, RunId, UsageTotals};

use crate::context::{Context, TraceEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Outcome of one run. Built exactly once, never modified afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub execution_id: RunId,
    pub status: RunStatus,
    /// Final assistant text. Partial content on failure, possibly empty.
    pub response: String,
    pub messages: Vec<ChatMessage>,
    pub duration_ms: u64,
    pub usage: UsageTotals,
    pub tool_calls: u32,
    /// Ordered error messages. Empty on success.
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    /// Non-fatal problems such as a failed save.
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
    #[serde(default)]
    pub cache_hit: bool,
}

/// Reply shape for chat clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatView {
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub response: String,
    pub tokens_used: u64,
    pub cost: f64,
    pub error: Option<String>,
}

/// Execution record shape for run history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionView {
    pub execution_id: String,
    pub status: RunStatus,
    pub user_id: String,
    pub definition_id: Option<String>,
    pub template_id: Option<String>,
    pub strategy: Option<StrategyKind>,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub model_calls: u32,
    pub tool_calls: u32,
    pub error_kind: Option<String>,
    pub stage: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub cache_hit: bool,
}

/// Detailed per-node view for debugging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceView {
    pub execution_id: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub trace: Vec<TraceEntry>,
    pub messages: Vec<ChatMessage>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn tokens_used(&self) -> u64 {
        self.usage.total_tokens()
    }

    pub fn to_chat_view(&self) -> ChatView {
        ChatView {
            message_id: self.message_id.as_ref().map(|m| m.0.clone()),
            conversation_id: self.conversation_id.clone(),
            response: self.response.clone(),
            tokens_used: self.tokens_used(),
            cost: self.usage.cost,
            error: self.error.as_ref().map(|e| e.user_message.clone()),
        }
    }

    pub fn to_execution_view(&self) -> ExecutionView {
        ExecutionView {
            execution_id: self.execution_id.to_string(),
            status: self.status,
            user_id: self.user_id.clone(),
            definition_id: self.definition_id.clone(),
            template_id: self.template_id.clone(),
            strategy: self.strategy,
            duration_ms: self.duration_ms,
            tokens_used: self.tokens_used(),
            input_tokens: self.usage.input_tokens,
            output_tokens: self.usage.output_tokens,
            cost: self.usage.cost,
            model_calls: self.usage.model_calls,
            tool_calls: self.tool_calls,
            error_kind: self.error.as_ref().map(|e| e.kind.to_string()),
            stage: self.error.as_ref().map(|e| e.stage.to_string()),
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
            cache_hit: self.cache_hit,
        }
    }

    pub fn to_trace_view(&self) -> TraceView {
        TraceView {
            execution_id: self.execution_id.to_string(),
            status: self.status,
            duration_ms: self.duration_ms,
            trace: self.trace.clone(),
            messages: self.messages.clone(),
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Bookkeeping a run carries from start to the result processor.
#[derive(Debug, Clone)]
pub struct RunMeta {
    pub run_id: RunId,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub definition_id: Option<String>,
    pub template_id: Option<String>,
    pub strategy: Option<StrategyKind>,
    pub started: Instant,
}

impl RunMeta {
    pub fn new(run_id: RunId, user_id: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            run_id,
            user_id: user_id.into(),
            conversation_id,
            definition_id: None,
            template_id: None,
            strategy: None,
            started: Instant::now(),
        }
    }
}

/// Builds [`RunResult`]s and owns the only write path for the assistant
/// message and conversation aggregates.
#[derive(Clone)]
pub struct ResultProcessor {
    persistence: Option<Arc<dyn Persistence>>,
    bus: Arc<EventBus>,
}

impl ResultProcessor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            persistence: None,
            bus,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Result of a successful run. `streamed` is the accumulated stream text,
    /// used when the context holds no assistant reply.
    pub async fn complete(&self, meta: &RunMeta, ctx: Context, streamed: Option<String>) -> RunResult {
        let response = ctx
            .produced_reply()
            .filter(|r| !r.is_empty())
            .or(streamed)
            .unwrap_or_default();
        let mut result = self.build(meta, ctx, RunStatus::Completed, response, None);

        if let Some(conversation_id) = result.conversation_id.clone() {
            self.persist(&mut result, &conversation_id, true).await;
        }

        info!(
            run_id = %result.execution_id,
            duration_ms = result.duration_ms,
            tokens = result.tokens_used(),
            tool_calls = result.tool_calls,
            warnings = result.warnings.len(),
            "Run completed"
        );
        result
    }

    /// Result of a failed run. `ctx` is the context at the point of failure,
    /// absent when the run failed before execution started.
    pub async fn fail(
        &self,
        meta: &RunMeta,
        error: &StrandError,
        ctx: Option<Context>,
        streamed: Option<String>,
    ) -> RunResult {
        let ctx = ctx.unwrap_or_else(|| Context::new(meta.user_id.clone(), meta.conversation_id.clone()));
        let response = streamed
            .filter(|s| !s.is_empty())
            .or_else(|| ctx.produced_reply())
            .unwrap_or_default();
        let mut result = self.build(meta, ctx, RunStatus::Failed, response, Some(error));

        if let Some(conversation_id) = result.conversation_id.clone() {
            self.persist(&mut result, &conversation_id, false).await;
        }

        warn!(
            run_id = %result.execution_id,
            kind = %error.kind(),
            stage = %error.stage(),
            error = %error,
            "Run failed"
        );
        result
    }

    fn build(
        &self,
        meta: &RunMeta,
        ctx: Context,
        status: RunStatus,
        response: String,
        error: Option<&StrandError>,
    ) -> RunResult {
        let cache_hit = ctx
            .metadata
            .get("cache_hit")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        RunResult {
            execution_id: meta.run_id.clone(),
            status,
            response,
            duration_ms: meta.started.elapsed().as_millis() as u64,
            usage: ctx.usage().clone(),
            tool_calls: ctx.tool_calls,
            errors: error.map(|e| vec![e.to_string()]).unwrap_or_default(),
            error: error.map(StrandError::report),
            warnings: Vec::new(),
            message_id: None,
            user_id: meta.user_id.clone(),
            conversation_id: meta.conversation_id.clone(),
            definition_id: meta.definition_id.clone(),
            template_id: meta.template_id.clone(),
            strategy: meta.strategy,
            trace: ctx.trace(),
            cache_hit,
            messages: ctx.messages,
        }
    }

    /// Save the reply (successful runs only) and add usage to the
    /// conversation. Failures become warnings.
    async fn persist(&self, result: &mut RunResult, conversation_id: &str, save_reply: bool) {
        let Some(persistence) = &self.persistence else {
            return;
        };

        if save_reply {
            match persistence
                .save_message(conversation_id, &result.response, &result.usage)
                .await
            {
                Ok(id) => {
                    self.publish(
                        result,
                        EventKind::MessageSaved,
                        json!({ "conversation_id": conversation_id, "message_id": id.0 }),
                    );
                    result.message_id = Some(id);
                }
                Err(e) => self.persistence_failed(result, "save_message", e),
            }
        }

        let tokens = result.tokens_used();
        if tokens == 0 && result.usage.cost == 0.0 {
            return;
        }
        if let Err(e) = persistence
            .update_conversation_aggregates(conversation_id, tokens, result.usage.cost)
            .await
        {
            self.persistence_failed(result, "update_conversation_aggregates", e);
        }
    }

    fn persistence_failed(&self, result: &mut RunResult, operation: &str, error: StrandError) {
        warn!(run_id = %result.execution_id, operation, error = %error, "Persistence failed");
        let report = error.report();
        self.publish(
            result,
            EventKind::PersistenceFailed,
            json!({ "operation": operation, "kind": report.kind, "stage": report.stage, "error": report.message }),
        );
        result.warnings.push(format!("{operation}: {error}"));
    }

    fn publish(&self, result: &RunResult, kind: EventKind, payload: serde_json::Value) {
        self.bus
            .publish(Event::new(kind, &result.execution_id, &result.user_id, payload));
    }
}
