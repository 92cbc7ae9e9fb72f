use futures::future::BoxFuture;
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::graph::NodeType;

use super::config::OnLimit;
use super::{kind_mismatch, NodeExecutor, NodeKind, PlannedNode};
use crate::context::Context;
use crate::env::RunEnv;

/// Decides whether a loop body runs again.
///
/// Records the decision under `conditional_results[node_id]` and counts
/// iterations in `loop_counters[node_id]`. The walker runs the body and
/// enforces `max_iterations` independently as a hard ceiling.
pub struct LoopExecutor;

impl NodeExecutor for LoopExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a PlannedNode,
        ctx: &'a mut Context,
        _env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let NodeKind::Loop { config, predicate } = &node.kind else {
                return Err(kind_mismatch(node, NodeType::Loop));
            };

            let done = ctx.loop_counter(&node.id);
            let holds = predicate
                .as_ref()
                .map_or(true, |p| p.evaluate(&|k: &str| ctx.lookup(k)));

            let again = if !holds {
                false
            } else if done >= config.max_iterations {
                if config.on_limit == OnLimit::Fail {
                    return Err(StrandError::LoopLimitExceeded {
                        node_id: node.id.clone(),
                        max_iterations: config.max_iterations,
                    });
                }
                false
            } else {
                ctx.set_loop_counter(&node.id, done + 1);
                true
            };

            debug!(node_id = %node.id, iteration = done, again, "Loop decision");
            ctx.set_conditional_result(&node.id, again);
            Ok(())
        })
    }
}
