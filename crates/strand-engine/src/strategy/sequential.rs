use futures::future::BoxFuture;
use tracing::debug;

use strand_core::config::StrategyKind;

use super::{settle, ExecutionStrategy, Outcome};
use crate::context::Context;
use crate::env::RunEnv;
use crate::plan::Plan;
use crate::walk::Walker;

/// One node at a time in topological order, following edge conditions.
pub struct SequentialStrategy;

impl ExecutionStrategy for SequentialStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sequential
    }

    fn execute<'a>(
        &'a self,
        plan: &'a Plan,
        env: &'a RunEnv,
        mut ctx: Context,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            debug!(run_id = %env.run_id, nodes = plan.len(), "Sequential execution");
            let result = Walker::new(plan, env).run(&mut ctx).await;
            settle(result, ctx)
        })
    }
}
