//! Graph walk shared by the sequential and DAG strategies.
//!
//! Nodes run one at a time in topological order. A node runs only when one
//! of its incoming forward edges was traversed; everything else on a dead
//! path is skipped. Loop nodes drive their body as a nested walk.

use std::collections::HashSet;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, info, warn};

use strand_core::error::{Result, StrandError};
use strand_core::event::EventKind;
use strand_core::graph::NodeType;

use crate::context::{Context, ErrorState, TraceEntry, TraceStatus};
use crate::env::RunEnv;
use crate::nodes::config::OnLimit;
use crate::nodes::NodeKind;
use crate::plan::{EdgeRule, LoopBody, Plan, PlanEdge};

pub struct Walker<'a> {
    plan: &'a Plan,
    env: &'a RunEnv,
}

impl<'a> Walker<'a> {
    pub fn new(plan: &'a Plan, env: &'a RunEnv) -> Self {
        Self { plan, env }
    }

    /// Walk the whole graph from its entry node.
    pub async fn run(&self, ctx: &mut Context) -> Result<()> {
        self.walk_scope(self.plan.entry(), self.plan.top_order(), ctx)
            .await
    }

    fn walk_scope<'s>(
        &'s self,
        entry: usize,
        order: &'s [usize],
        ctx: &'s mut Context,
    ) -> BoxFuture<'s, Result<()>> {
        Box::pin(async move {
            let mut active: HashSet<usize> = HashSet::from([entry]);

            for &idx in order {
                if !active.contains(&idx) {
                    self.skip(idx, ctx);
                    continue;
                }

                let outcome = match self.plan.loop_body(idx) {
                    Some(body) => self.run_loop(idx, body, ctx).await,
                    None => self.run_node(idx, ctx, None).await,
                };

                let succeeded = match outcome {
                    Ok(()) => true,
                    Err(StrandError::Cancelled) => return Err(StrandError::Cancelled),
                    Err(err) if self.plan.has_failure_route(idx) => {
                        let node = self.plan.node(idx);
                        info!(node_id = %node.id, error = %err, "Routing node failure to handler");
                        ctx.set_error_state(ErrorState {
                            node_id: node.id.clone(),
                            kind: err.kind(),
                            message: err.to_string(),
                        });
                        false
                    }
                    Err(err) => return Err(err),
                };

                for edge in self.plan.successors(idx) {
                    if traverse(self.plan, edge, succeeded, ctx) {
                        active.insert(edge.target);
                    }
                }
            }
            Ok(())
        })
    }

    async fn run_loop(&self, idx: usize, body: &'a LoopBody, ctx: &mut Context) -> Result<()> {
        let node = self.plan.node(idx);
        let NodeKind::Loop { config, .. } = &node.kind else {
            return self.run_node(idx, ctx, None).await;
        };

        ctx.set_loop_counter(&node.id, 0);
        let mut iterations: u32 = 0;
        loop {
            self.run_node(idx, ctx, Some(iterations)).await?;
            if ctx.conditional_result(&node.id) != Some(true) {
                break;
            }
            if iterations >= config.max_iterations {
                match config.on_limit {
                    OnLimit::Stop => {
                        warn!(node_id = %node.id, max = config.max_iterations, "Loop reached its iteration ceiling");
                        break;
                    }
                    OnLimit::Fail => {
                        return Err(StrandError::LoopLimitExceeded {
                            node_id: node.id.clone(),
                            max_iterations: config.max_iterations,
                        })
                    }
                }
            }
            iterations += 1;
            debug!(node_id = %node.id, iteration = iterations, "Entering loop body");
            self.walk_scope(body.entry, &body.order, ctx).await?;
        }

        debug!(node_id = %node.id, iterations, "Loop finished");
        Ok(())
    }

    /// Run a single node, recording its trace entry and events.
    pub(crate) async fn run_node(
        &self,
        idx: usize,
        ctx: &mut Context,
        iteration: Option<u32>,
    ) -> Result<()> {
        if self.env.cancel.is_cancelled() {
            return Err(StrandError::Cancelled);
        }

        let node = self.plan.node(idx);
        let node_type = node.kind.node_type();

        if !feature_enabled(self.env, node_type) {
            debug!(node_id = %node.id, node_type = %node_type, "Node disabled by run config");
            ctx.record_trace(TraceEntry {
                node_id: node.id.clone(),
                node_type,
                status: TraceStatus::Disabled,
                elapsed_ms: 0,
                iteration,
                note: None,
            });
            self.env.publish(
                EventKind::NodeSkipped,
                json!({ "node_id": node.id, "node_type": node_type, "reason": "disabled" }),
            );
            return Ok(());
        }

        let executor = self.env.executors.get(node_type)?;
        debug!(node_id = %node.id, node_type = %node_type, "Executing node");
        self.env.publish(
            EventKind::NodeStarted,
            json!({ "node_id": node.id, "node_type": node_type, "iteration": iteration }),
        );

        let start = Instant::now();
        let result = executor.execute(node, ctx, self.env).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => {
                debug!(node_id = %node.id, elapsed_ms, "Node completed");
                ctx.record_trace(TraceEntry {
                    node_id: node.id.clone(),
                    node_type,
                    status: TraceStatus::Completed,
                    elapsed_ms,
                    iteration,
                    note: None,
                });
                self.env.publish(
                    EventKind::NodeCompleted,
                    json!({ "node_id": node.id, "node_type": node_type, "elapsed_ms": elapsed_ms }),
                );
            }
            Err(err) => {
                ctx.record_trace(TraceEntry {
                    node_id: node.id.clone(),
                    node_type,
                    status: TraceStatus::Failed,
                    elapsed_ms,
                    iteration,
                    note: Some(err.to_string()),
                });
                // The run reports cancellation once, as its terminal event
                if matches!(err, StrandError::Cancelled) {
                    debug!(node_id = %node.id, elapsed_ms, "Node cancelled");
                    self.env.publish(
                        EventKind::NodeSkipped,
                        json!({ "node_id": node.id, "node_type": node_type, "reason": "cancelled" }),
                    );
                } else {
                    warn!(node_id = %node.id, elapsed_ms, error = %err, "Node failed");
                    self.env.publish(
                        EventKind::NodeFailed,
                        json!({
                            "node_id": node.id,
                            "node_type": node_type,
                            "elapsed_ms": elapsed_ms,
                            "kind": err.kind(),
                            "error": err.to_string(),
                        }),
                    );
                }
            }
        }
        result
    }

    fn skip(&self, idx: usize, ctx: &mut Context) {
        let node = self.plan.node(idx);
        let node_type = node.kind.node_type();
        debug!(node_id = %node.id, "Skipping node on untaken path");
        ctx.record_trace(TraceEntry {
            node_id: node.id.clone(),
            node_type,
            status: TraceStatus::Skipped,
            elapsed_ms: 0,
            iteration: None,
            note: None,
        });
        self.env.publish(
            EventKind::NodeSkipped,
            json!({ "node_id": node.id, "node_type": node_type, "reason": "inactive" }),
        );
    }
}

/// Feature flags gate tool, retrieval and memory nodes.
pub(crate) fn feature_enabled(env: &RunEnv, node_type: NodeType) -> bool {
    match node_type {
        NodeType::Tool => env.config.enable_tools,
        NodeType::Retrieval => env.config.enable_retrieval,
        NodeType::Memory => env.config.enable_memory,
        _ => true,
    }
}

fn traverse(plan: &Plan, edge: &PlanEdge, succeeded: bool, ctx: &Context) -> bool {
    let source = &plan.node(edge.source).id;
    match &edge.rule {
        EdgeRule::Always | EdgeRule::OnSuccess => succeeded,
        EdgeRule::OnFailure => !succeeded,
        EdgeRule::IfTrue => succeeded && ctx.conditional_result(source) == Some(true),
        EdgeRule::IfFalse => succeeded && ctx.conditional_result(source) == Some(false),
        EdgeRule::Expr(condition) => succeeded && condition.evaluate(&|k: &str| ctx.lookup(k)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx, env, CountingExecutor, FailingExecutor};
    use serde_json::json;
    use strand_core::graph::{Edge, Graph, Node};

    fn loop_graph(config: serde_json::Value) -> Graph {
        Graph::new(
            vec![
                Node::start("start"),
                Node::new("repeat", NodeType::Loop, config),
                Node::new("work", NodeType::Delay, json!({"ms": 0})),
                Node::new("end", NodeType::End, json!(null)),
            ],
            vec![
                Edge::always("start", "repeat"),
                Edge::always("work", "repeat"),
                Edge::always("repeat", "end"),
            ],
        )
    }

    #[tokio::test]
    async fn loop_never_exceeds_max_iterations() {
        for max in [1u32, 3, 5] {
            let counter = CountingExecutor::new();
            let plan = Plan::build(&loop_graph(
                json!({"body": "work", "max_iterations": max}),
            ))
            .unwrap();
            let env = env().executor(NodeType::Delay, counter.clone()).build();
            let mut c = ctx("go");
            Walker::new(&plan, &env).run(&mut c).await.unwrap();
            assert_eq!(counter.count(), max as usize);
            assert_eq!(c.loop_counter("repeat"), max);
        }
    }

    #[tokio::test]
    async fn loop_stops_when_predicate_fails() {
        let counter = CountingExecutor::new();
        let plan = Plan::build(&loop_graph(
            json!({"body": "work", "max_iterations": 10, "condition": "loop.repeat < 2"}),
        ))
        .unwrap();
        let env = env().executor(NodeType::Delay, counter.clone()).build();
        let mut c = ctx("go");
        Walker::new(&plan, &env).run(&mut c).await.unwrap();
        assert_eq!(counter.count(), 2);
    }

    #[tokio::test]
    async fn loop_limit_can_fail_the_run() {
        let plan = Plan::build(&loop_graph(json!({
            "body": "work",
            "max_iterations": 2,
            "condition": "input == \"go\"",
            "on_limit": "fail"
        })))
        .unwrap();
        let env = env().build();
        let mut c = ctx("go");
        let err = Walker::new(&plan, &env).run(&mut c).await.unwrap_err();
        assert!(matches!(err, StrandError::LoopLimitExceeded { max_iterations: 2, .. }));
    }

    #[tokio::test]
    async fn conditional_edges_pick_one_branch() {
        let graph = Graph::new(
            vec![
                Node::start("start"),
                Node::new("check", NodeType::Conditional, json!({"condition": "input contains \"refund\""})),
                Node::new("yes", NodeType::Variable, json!({"set": {"route": "refund"}})),
                Node::new("no", NodeType::Variable, json!({"set": {"route": "other"}})),
            ],
            vec![
                Edge::always("start", "check"),
                Edge::if_true("check", "yes"),
                Edge::if_false("check", "no"),
            ],
        );
        let plan = Plan::build(&graph).unwrap();
        let env = env().build();

        let mut c = ctx("I want a refund");
        Walker::new(&plan, &env).run(&mut c).await.unwrap();
        assert_eq!(c.variable("route"), Some(&json!("refund")));
        let skipped: Vec<String> = c
            .trace()
            .into_iter()
            .filter(|e| e.status == TraceStatus::Skipped)
            .map(|e| e.node_id)
            .collect();
        assert_eq!(skipped, vec!["no"]);
    }

    #[tokio::test]
    async fn failure_edges_route_to_error_handler() {
        let graph = Graph::new(
            vec![
                Node::start("start"),
                Node::new("fetch", NodeType::Delay, json!(null)),
                Node::new("recover", NodeType::ErrorHandler, json!({"fallback": "Fell back: {{error}}"})),
                Node::new("after", NodeType::Variable, json!({"set": {"ok": true}})),
            ],
            vec![
                Edge::always("start", "fetch"),
                Edge::on_failure("fetch", "recover"),
                Edge::always("fetch", "after"),
            ],
        );
        let plan = Plan::build(&graph).unwrap();
        let env = env()
            .executor(NodeType::Delay, FailingExecutor::new("upstream down"))
            .build();

        let mut c = ctx("hi");
        Walker::new(&plan, &env).run(&mut c).await.unwrap();
        assert!(c.response().unwrap().contains("upstream down"));
        assert!(c.error_state().is_none());
        assert!(c.variable("ok").is_none());
    }

    #[tokio::test]
    async fn failure_without_route_propagates() {
        let plan = Plan::build(&Graph::new(
            vec![Node::start("start"), Node::new("fetch", NodeType::Delay, json!(null))],
            vec![Edge::always("start", "fetch")],
        ))
        .unwrap();
        let env = env()
            .executor(NodeType::Delay, FailingExecutor::new("boom"))
            .build();
        let mut c = ctx("hi");
        let err = Walker::new(&plan, &env).run(&mut c).await.unwrap_err();
        assert!(matches!(err, StrandError::NodeFailed { .. }));
        assert_eq!(c.trace().last().unwrap().status, TraceStatus::Failed);
    }

    #[tokio::test]
    async fn disabled_nodes_are_not_executed() {
        let counter = CountingExecutor::new();
        let plan = Plan::build(&strand_test_utils::tool_graph()).unwrap();
        let env = env()
            .config(|c| c.enable_tools = false)
            .executor(NodeType::Tool, counter.clone())
            .build();
        let mut c = ctx("hi");
        Walker::new(&plan, &env).run(&mut c).await.unwrap();
        assert_eq!(counter.count(), 0);
        assert!(c
            .trace()
            .iter()
            .any(|e| e.node_id == "lookup" && e.status == TraceStatus::Disabled));
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_next_node() {
        let plan = Plan::build(&strand_test_utils::plain_graph()).unwrap();
        let env = env().build();
        env.cancel.cancel();
        let mut c = ctx("hi");
        let err = Walker::new(&plan, &env).run(&mut c).await.unwrap_err();
        assert!(matches!(err, StrandError::Cancelled));
    }
}
