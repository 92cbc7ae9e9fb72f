use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info};

use strand_core::error::Result;
use strand_core::graph::NodeType;
use strand_core::template::{display_value, render};
use strand_core::types::ChatMessage;

use super::{kind_mismatch, NodeExecutor, NodeKind, PlannedNode};
use crate::context::Context;
use crate::env::RunEnv;

/// Turns a recorded upstream failure into a fallback reply.
///
/// Clears the error state, stores the failure message in a variable and
/// appends the rendered fallback as the assistant's answer.
pub struct ErrorHandlerExecutor;

impl NodeExecutor for ErrorHandlerExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a PlannedNode,
        ctx: &'a mut Context,
        _env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let NodeKind::ErrorHandler(config) = &node.kind else {
                return Err(kind_mismatch(node, NodeType::ErrorHandler));
            };
            let Some(state) = ctx.take_error_state() else {
                debug!(node_id = %node.id, "No upstream failure to handle");
                return Ok(());
            };

            info!(node_id = %node.id, failed_node = %state.node_id, kind = %state.kind, "Handling upstream failure");
            let reply = render(&config.fallback, |key| match key {
                "error" => Some(state.message.clone()),
                "error_kind" | "errorKind" => Some(state.kind.to_string()),
                "failed_node" | "failedNode" => Some(state.node_id.clone()),
                other => ctx.lookup(other).map(|v| display_value(&v)),
            });
            ctx.messages.push(ChatMessage::assistant_text(reply));
            ctx.set_variable(config.variable.clone(), Value::String(state.message));
            Ok(())
        })
    }
}
