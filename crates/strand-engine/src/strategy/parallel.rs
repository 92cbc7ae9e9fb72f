use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use tokio::sync::Semaphore;
use tracing::debug;

use strand_core::config::StrategyKind;
use strand_core::error::{Result, StrandError};

use super::{settle, ExecutionFailure, ExecutionStrategy, Outcome, SequentialStrategy};
use crate::context::Context;
use crate::env::RunEnv;
use crate::plan::Plan;
use crate::walk::Walker;

/// Runs each level of mutually independent nodes concurrently on clones of
/// the context, then joins their declared writes back in level order.
///
/// Falls back to the sequential walk when the graph loops or branches.
pub struct ParallelStrategy;

impl ExecutionStrategy for ParallelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Parallel
    }

    fn execute<'a>(
        &'a self,
        plan: &'a Plan,
        env: &'a RunEnv,
        mut ctx: Context,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            if plan.has_loops() || plan.has_conditional_routing() {
                debug!(run_id = %env.run_id, "Graph branches or loops, running sequentially");
                return SequentialStrategy.execute(plan, env, ctx).await;
            }

            let walker = Walker::new(plan, env);
            let permits = Arc::new(Semaphore::new(env.engine.max_parallel.max(1)));

            for level in plan.levels() {
                let result = if level.len() > 1 && independent(plan, level) {
                    run_level(&walker, plan, level, &permits, &mut ctx).await
                } else {
                    run_in_order(&walker, level, &mut ctx).await
                };
                if let Err(e) = result {
                    return Err(ExecutionFailure::new(e, ctx));
                }
            }
            settle(Ok(()), ctx)
        })
    }
}

fn independent(plan: &Plan, level: &[usize]) -> bool {
    level.iter().enumerate().all(|(i, &a)| {
        level[i + 1..]
            .iter()
            .all(|&b| plan.node(a).kind.independent_of(&plan.node(b).kind))
    })
}

async fn run_in_order(walker: &Walker<'_>, level: &[usize], ctx: &mut Context) -> Result<()> {
    for &idx in level {
        walker.run_node(idx, ctx, None).await?;
    }
    Ok(())
}

async fn run_level(
    walker: &Walker<'_>,
    plan: &Plan,
    level: &[usize],
    permits: &Semaphore,
    ctx: &mut Context,
) -> Result<()> {
    debug!(branches = level.len(), "Running level concurrently");
    let base = ctx.clone();
    let mut branches: Vec<Context> = level.iter().map(|_| base.clone()).collect();

    // First failure drops the remaining branch futures
    let futures = level
        .iter()
        .zip(branches.iter_mut())
        .map(|(&idx, branch)| async move {
            let _permit = permits
                .acquire()
                .await
                .map_err(|e| StrandError::Internal(format!("branch limiter closed: {}", e)))?;
            walker.run_node(idx, branch, None).await
        });
    try_join_all(futures).await?;

    for (&idx, branch) in level.iter().zip(&branches) {
        for field in plan.node(idx).kind.writes() {
            ctx.copy_field(branch, &field);
        }
        ctx.absorb_branch(&base, branch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx, env};
    use serde_json::json;
    use std::time::Duration;
    use strand_core::graph::{Edge, Graph, Node, NodeType};
    use strand_test_utils::fan_out_graph;

    fn node_order(c: &Context) -> Vec<String> {
        c.trace().into_iter().map(|t| t.node_id).collect()
    }

    #[tokio::test]
    async fn matches_sequential_on_independent_graph() {
        let plan = Plan::build(&fan_out_graph()).unwrap();
        let env = env().build();

        let seq = SequentialStrategy
            .execute(&plan, &env, ctx("hello"))
            .await
            .unwrap();
        let par = ParallelStrategy
            .execute(&plan, &env, ctx("hello"))
            .await
            .unwrap();

        assert_eq!(par.variables(), seq.variables());
        assert_eq!(par.variable("left"), Some(&json!("L")));
        assert_eq!(par.variable("right"), Some(&json!("R")));
        assert_eq!(par.messages, seq.messages);
        assert_eq!(par.tool_calls, seq.tool_calls);
        assert_eq!(par.usage(), seq.usage());
        assert_eq!(node_order(&par), node_order(&seq));
    }

    #[tokio::test(start_paused = true)]
    async fn branches_overlap_in_time() {
        let graph = Graph::new(
            vec![
                Node::start("start"),
                Node::new("a", NodeType::Delay, json!({"ms": 1000})),
                Node::new("b", NodeType::Delay, json!({"ms": 1000})),
                Node::new("end", NodeType::End, json!(null)),
            ],
            vec![
                Edge::always("start", "a"),
                Edge::always("start", "b"),
                Edge::always("a", "end"),
                Edge::always("b", "end"),
            ],
        );
        let plan = Plan::build(&graph).unwrap();
        let env = env().build();

        let start = tokio::time::Instant::now();
        ParallelStrategy
            .execute(&plan, &env, ctx("go"))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn conflicting_writers_run_in_order() {
        let graph = Graph::new(
            vec![
                Node::start("start"),
                Node::new("a", NodeType::Variable, json!({"set": {"x": "a"}})),
                Node::new("b", NodeType::Variable, json!({"set": {"x": "b"}})),
            ],
            vec![Edge::always("start", "a"), Edge::always("start", "b")],
        );
        let plan = Plan::build(&graph).unwrap();
        assert!(!independent(&plan, &plan.levels()[1]));

        let env = env().build();
        let out = ParallelStrategy
            .execute(&plan, &env, ctx("go"))
            .await
            .unwrap();
        assert_eq!(out.variable("x"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn branch_failure_fails_the_run() {
        let graph = Graph::new(
            vec![
                Node::start("start"),
                Node::new("ok", NodeType::Variable, json!({"set": {"a": 1}})),
                Node::new("broken", NodeType::Tool, json!({"calls": [{"tool": "missing"}]})),
            ],
            vec![Edge::always("start", "ok"), Edge::always("start", "broken")],
        );
        let plan = Plan::build(&graph).unwrap();
        let env = env().build();
        let failure = ParallelStrategy
            .execute(&plan, &env, ctx("go"))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, StrandError::ToolNotFound(_)));
    }
}
