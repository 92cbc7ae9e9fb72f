use futures::future::BoxFuture;
use tracing::debug;

use strand_core::config::StrategyKind;

use super::{settle, ExecutionFailure, ExecutionStrategy, Outcome};
use crate::context::Context;
use crate::env::RunEnv;
use crate::plan::Plan;
use crate::walk::Walker;

/// The sequential walk, after re-checking that the graph is acyclic apart
/// from loop back edges. Used for branching and looping graphs.
pub struct DagStrategy;

impl ExecutionStrategy for DagStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Graph
    }

    fn execute<'a>(
        &'a self,
        plan: &'a Plan,
        env: &'a RunEnv,
        mut ctx: Context,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            if let Err(e) = plan.verify_acyclic() {
                return Err(ExecutionFailure::new(e, ctx));
            }
            debug!(
                run_id = %env.run_id,
                nodes = plan.len(),
                back_edges = plan.back_edge_count(),
                "Graph execution"
            );
            let result = Walker::new(plan, env).run(&mut ctx).await;
            settle(result, ctx)
        })
    }
}
