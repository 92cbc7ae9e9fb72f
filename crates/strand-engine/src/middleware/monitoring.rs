use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, warn};

use strand_core::event::EventKind;

use super::{Invocation, Middleware, Next};
use crate::context::Context;
use crate::strategy::Outcome;

/// Publishes execution started and finished events with wall-clock duration.
///
/// The finished event carries `status: completed | failed`.
pub struct MonitoringMiddleware;

impl Middleware for MonitoringMiddleware {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    fn handle<'a>(
        &'a self,
        inv: &'a Invocation<'a>,
        ctx: Context,
        next: Next<'a>,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let env = inv.env;
            env.publish(
                EventKind::ExecutionStarted,
                json!({
                    "graph_key": inv.graph_key,
                    "strategy": inv.strategy.kind(),
                    "nodes": inv.plan.len(),
                    "streaming": env.is_streaming(),
                }),
            );

            let start = Instant::now();
            let outcome = next.run(ctx).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match &outcome {
                Ok(ctx) => {
                    info!(
                        run_id = %env.run_id,
                        duration_ms,
                        tokens = ctx.usage().total_tokens(),
                        tool_calls = ctx.tool_calls,
                        "Execution completed"
                    );
                    env.publish(
                        EventKind::ExecutionFinished,
                        json!({
                            "status": "completed",
                            "duration_ms": duration_ms,
                            "input_tokens": ctx.usage().input_tokens,
                            "output_tokens": ctx.usage().output_tokens,
                            "cost": ctx.usage().cost,
                            "tool_calls": ctx.tool_calls,
                        }),
                    );
                }
                Err(failure) => {
                    // RunFailed is the run's failure event; this only records timing
                    warn!(run_id = %env.run_id, duration_ms, error = %failure.error, "Execution failed");
                    let usage = failure.context.usage();
                    env.publish(
                        EventKind::ExecutionFinished,
                        json!({
                            "status": "failed",
                            "duration_ms": duration_ms,
                            "input_tokens": usage.input_tokens,
                            "output_tokens": usage.output_tokens,
                            "cost": usage.cost,
                            "tool_calls": failure.context.tool_calls,
                            "kind": failure.error.kind(),
                        }),
                    );
                }
            }
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::plan::Plan;
    use crate::strategy::SequentialStrategy;
    use crate::testing::{ctx, env, FailingExecutor};
    use strand_core::error::StrandError;
    use strand_core::graph::NodeType;
    use std::sync::Arc;
    use strand_core::event::EventBus;
    use strand_test_utils::plain_graph;

    #[tokio::test]
    async fn publishes_started_and_finished() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let env = env().bus(bus).build();
        let plan = Plan::build(&plain_graph()).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "dynamic:abc",
        };

        Pipeline::new()
            .with(Arc::new(MonitoringMiddleware))
            .run(&inv, ctx("hi"))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.kind.category() == strand_core::event::EventCategory::Execution {
                events.push(event);
            }
        }
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::ExecutionStarted, EventKind::ExecutionFinished]);
        assert_eq!(events[1].payload["status"], "completed");
    }

    #[tokio::test]
    async fn failed_execution_publishes_no_failure_event() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let env = env()
            .bus(bus)
            .executor(NodeType::Model, FailingExecutor::new("boom"))
            .build();
        let plan = Plan::build(&plain_graph()).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "dynamic:abc",
        };

        let failure = Pipeline::new()
            .with(Arc::new(MonitoringMiddleware))
            .run(&inv, ctx("hi"))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, StrandError::NodeFailed { .. }));

        let mut finished = None;
        while let Ok(event) = rx.try_recv() {
            if event.kind.category() == strand_core::event::EventCategory::Execution {
                assert!(!event.kind.as_str().ends_with(".failed"));
                if event.kind == EventKind::ExecutionFinished {
                    finished = Some(event);
                }
            }
        }
        assert_eq!(finished.unwrap().payload["status"], "failed");
    }
}
