use std::collections::HashSet;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::warn;

use strand_core::config::ValidationConfig;
use strand_core::error::StrandError;
use strand_core::event::EventKind;
use strand_core::types::Role;

use super::{Invocation, Middleware, Next};
use crate::context::Context;
use crate::strategy::{ExecutionFailure, Outcome};

/// Checks context shape before and after execution.
///
/// In strict mode a violation fails the run with `ValidationFailed`;
/// otherwise each violation is logged and published as a warning.
pub struct ValidationMiddleware {
    config: ValidationConfig,
}

impl ValidationMiddleware {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    fn report(&self, inv: &Invocation<'_>, phase: &str, problems: &[String]) -> bool {
        if problems.is_empty() {
            return true;
        }
        for problem in problems {
            warn!(run_id = %inv.env.run_id, phase, problem = %problem, "Context validation");
            inv.env.publish(
                EventKind::ValidationWarning,
                json!({ "phase": phase, "problem": problem, "strict": self.config.strict }),
            );
        }
        !self.config.strict
    }
}

pub fn check_input(ctx: &Context) -> Vec<String> {
    let mut problems = Vec::new();
    if ctx.user_id.trim().is_empty() {
        problems.push("user id is empty".to_string());
    }
    if ctx.messages.is_empty() {
        problems.push("message history is empty".to_string());
    }
    if ctx.tool_calls != 0 {
        problems.push(format!("tool call counter starts at {}", ctx.tool_calls));
    }
    problems
}

pub fn check_output(ctx: &Context, max_tool_calls: u32) -> Vec<String> {
    let mut problems = Vec::new();
    if ctx.tool_calls > max_tool_calls {
        problems.push(format!(
            "{} tool calls exceed the budget of {}",
            ctx.tool_calls, max_tool_calls
        ));
    }

    let mut requested: HashSet<&str> = HashSet::new();
    for msg in &ctx.messages {
        if msg.role == Role::Assistant {
            requested.extend(msg.tool_uses().into_iter().map(|(id, _, _)| id));
        }
        for id in msg.tool_result_ids() {
            if !requested.contains(id) {
                problems.push(format!("tool result {id} has no matching request"));
            }
        }
    }

    if let Some(state) = ctx.error_state() {
        problems.push(format!(
            "unhandled failure left by node {}: {}",
            state.node_id, state.message
        ));
    }
    problems
}

impl Middleware for ValidationMiddleware {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn handle<'a>(
        &'a self,
        inv: &'a Invocation<'a>,
        ctx: Context,
        next: Next<'a>,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let problems = check_input(&ctx);
            if !self.report(inv, "input", &problems) {
                let err = StrandError::ValidationFailed(problems.join("; "));
                return Err(ExecutionFailure::new(err, ctx));
            }

            let done = next.run(ctx).await?;

            let problems = check_output(&done, inv.env.config.max_tool_calls);
            if !self.report(inv, "output", &problems) {
                let err = StrandError::ValidationFailed(problems.join("; "));
                return Err(ExecutionFailure::new(err, done));
            }
            Ok(done)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ErrorState;
    use crate::middleware::Pipeline;
    use crate::plan::Plan;
    use crate::strategy::SequentialStrategy;
    use crate::testing::{ctx, env};
    use std::sync::Arc;
    use strand_core::error::ErrorKind;
    use strand_core::event::EventBus;
    use strand_core::types::ChatMessage;
    use strand_test_utils::{plain_graph, ScriptedProvider};

    #[test]
    fn input_checks() {
        assert!(check_input(&ctx("hi")).is_empty());

        let mut bad = Context::new("", None);
        bad.tool_calls = 2;
        assert_eq!(check_input(&bad).len(), 3);
    }

    #[test]
    fn orphan_tool_results_and_leftover_errors_are_flagged() {
        let mut c = ctx("hi");
        c.messages.push(ChatMessage::tool_result("nope", "x", false));
        c.set_error_state(ErrorState {
            node_id: "fetch".into(),
            kind: ErrorKind::ToolFailed,
            message: "boom".into(),
        });
        c.tool_calls = 9;
        let problems = check_output(&c, 8);
        assert_eq!(problems.len(), 3);
    }

    #[tokio::test]
    async fn strict_mode_rejects_without_running() {
        let provider = Arc::new(ScriptedProvider::new());
        let env = env().model(provider.clone()).build();
        let plan = Plan::build(&plain_graph()).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "k",
        };
        let pipeline = Pipeline::new().with(Arc::new(ValidationMiddleware::new(ValidationConfig {
            strict: true,
        })));

        let failure = pipeline.run(&inv, Context::new("u1", None)).await.unwrap_err();
        assert!(matches!(failure.error, StrandError::ValidationFailed(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn lax_mode_warns_and_continues() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let env = env().bus(bus).build();
        let plan = Plan::build(&plain_graph()).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "k",
        };
        let pipeline =
            Pipeline::new().with(Arc::new(ValidationMiddleware::new(ValidationConfig::default())));

        let mut input = ctx("hi");
        input.user_id = String::new();
        assert!(pipeline.run(&inv, input).await.is_ok());

        let mut warnings = 0;
        while let Ok(event) = rx.try_recv() {
            if event.kind == EventKind::ValidationWarning {
                warnings += 1;
            }
        }
        assert_eq!(warnings, 1);
    }
}
