use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{info, warn};

use strand_core::error::{Result, StrandError};
use strand_core::graph::NodeType;
use strand_core::traits::ToolHandle;
use strand_core::types::{ChatMessage, ToolOutput, ToolUseRequest};

use super::variable::resolve;
use super::{kind_mismatch, NodeExecutor, NodeKind, PlannedNode};
use crate::context::Context;
use crate::env::RunEnv;

/// Invokes tools, either the node's explicit `calls` or the tool uses the
/// last model reply left unanswered.
///
/// Every attempt counts against the run's `max_tool_calls`, checked before
/// the call is made.
pub struct ToolExecutor;

impl NodeExecutor for ToolExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a PlannedNode,
        ctx: &'a mut Context,
        env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let NodeKind::Tool(config) = &node.kind else {
                return Err(kind_mismatch(node, NodeType::Tool));
            };

            let last = if config.calls.is_empty() {
                run_pending(node, ctx, env).await?
            } else {
                run_explicit(node, ctx, env).await?
            };

            if let (Some(var), Some(output)) = (&config.output_var, last) {
                ctx.set_variable(var.clone(), Value::String(output.content));
            }
            Ok(())
        })
    }
}

async fn run_explicit(
    node: &PlannedNode,
    ctx: &mut Context,
    env: &RunEnv,
) -> Result<Option<ToolOutput>> {
    let NodeKind::Tool(config) = &node.kind else {
        return Err(kind_mismatch(node, NodeType::Tool));
    };

    let requests: Vec<ToolUseRequest> = config
        .calls
        .iter()
        .enumerate()
        .map(|(i, call)| ToolUseRequest {
            id: format!("{}_{}", node.id, ctx.tool_calls as usize + i),
            name: call.tool.clone(),
            input: resolve(&call.args, ctx),
        })
        .collect();

    // Resolve everything up front so a missing tool fails before any call
    let handles = requests
        .iter()
        .map(|r| {
            env.tool(&r.name)
                .cloned()
                .ok_or_else(|| StrandError::ToolNotFound(r.name.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    ctx.messages
        .push(ChatMessage::assistant_with_tools("", &requests));

    let mut last = None;
    for (request, handle) in requests.into_iter().zip(handles) {
        let output = invoke(&node.id, handle, request.input, ctx, env).await?;
        ctx.messages.push(ChatMessage::tool_result(
            request.id,
            output.content.clone(),
            output.is_error,
        ));
        last = Some(output);
    }
    Ok(last)
}

async fn run_pending(
    node: &PlannedNode,
    ctx: &mut Context,
    env: &RunEnv,
) -> Result<Option<ToolOutput>> {
    let pending = ctx.pending_tool_uses();
    if pending.is_empty() {
        info!(node_id = %node.id, "No pending tool uses");
        return Ok(None);
    }

    let mut last = None;
    for request in pending {
        let output = match env.tool(&request.name) {
            None => {
                // The model asked for something it was never offered
                warn!(node_id = %node.id, tool = %request.name, "Model requested unknown tool");
                ToolOutput::error(format!("Unknown tool: {}", request.name))
            }
            Some(handle) => {
                match invoke(&node.id, handle.clone(), request.input, ctx, env).await {
                    Ok(output) => output,
                    Err(e @ (StrandError::Cancelled | StrandError::ToolBudgetExceeded { .. })) => {
                        return Err(e)
                    }
                    Err(e) => {
                        warn!(node_id = %node.id, tool = %request.name, error = %e, "Tool failed");
                        ToolOutput::error(e.to_string())
                    }
                }
            }
        };
        ctx.messages.push(ChatMessage::tool_result(
            request.id,
            output.content.clone(),
            output.is_error,
        ));
        last = Some(output);
    }
    Ok(last)
}

async fn invoke(
    node_id: &str,
    handle: ToolHandle,
    input: Value,
    ctx: &mut Context,
    env: &RunEnv,
) -> Result<ToolOutput> {
    let limit = env.config.max_tool_calls;
    if ctx.tool_calls >= limit {
        return Err(StrandError::ToolBudgetExceeded { limit });
    }
    ctx.tool_calls += 1;

    let handle = handle.with_timeout(env.call_timeout());
    let start = std::time::Instant::now();
    let output = tokio::select! {
        _ = env.cancel.cancelled() => return Err(StrandError::Cancelled),
        res = handle.invoke(input, env.tool_context()) => res?,
    };
    info!(
        node_id,
        tool = handle.name(),
        is_error = output.is_error,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Tool call completed"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx, env};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use strand_core::graph::Node;
    use strand_core::types::{ContentBlock, Role};
    use strand_test_utils::CountingTool;

    fn tool_node(config: Value) -> PlannedNode {
        PlannedNode {
            id: "lookup".into(),
            kind: NodeKind::from_node(&Node::new("lookup", NodeType::Tool, config)).unwrap(),
        }
    }

    #[tokio::test]
    async fn explicit_call_renders_args_and_records_result() {
        let tool = CountingTool::new("search");
        let count = tool.counter();
        let env = env().tool(tool).build();
        let mut c = ctx("hi");
        c.set_variable("topic", json!("rust"));
        c.set_variable("limit", json!(5));

        let n = tool_node(json!({
            "calls": [{"tool": "search", "args": {"q": "about {{topic}}", "n": "{{limit}}"}}],
            "output_var": "found"
        }));
        ToolExecutor.execute(&n, &mut c, &env).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(c.tool_calls, 1);
        let assistant = &c.messages[1];
        assert_eq!(assistant.role, Role::Assistant);
        let (_, name, input) = assistant.tool_uses()[0];
        assert_eq!(name, "search");
        assert_eq!(input, &json!({"q": "about rust", "n": 5}));
        assert_eq!(c.messages[2].role, Role::Tool);
        let found = c.variable("found").and_then(|v| v.as_str()).unwrap();
        assert!(found.starts_with("search:"));
    }

    #[tokio::test]
    async fn budget_is_enforced_before_the_extra_call() {
        let tool = CountingTool::new("ping");
        let count = tool.counter();
        let env = env().tool(tool).config(|c| c.max_tool_calls = 2).build();
        let mut c = ctx("hi");

        let n = tool_node(json!({"calls": [
            {"tool": "ping"}, {"tool": "ping"}, {"tool": "ping"}
        ]}));
        let err = ToolExecutor.execute(&n, &mut c, &env).await.unwrap_err();

        assert!(matches!(err, StrandError::ToolBudgetExceeded { limit: 2 }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(c.tool_calls, 2);
    }

    #[tokio::test]
    async fn unknown_explicit_tool_fails_without_calls() {
        let tool = CountingTool::new("ping");
        let count = tool.counter();
        let env = env().tool(tool).build();
        let mut c = ctx("hi");
        let n = tool_node(json!({"calls": [{"tool": "ping"}, {"tool": "shell"}]}));

        let err = ToolExecutor.execute(&n, &mut c, &env).await.unwrap_err();
        assert!(matches!(err, StrandError::ToolNotFound(name) if name == "shell"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pending_uses_become_results_even_when_unknown() {
        let env = env().tool(CountingTool::new("search")).build();
        let mut c = ctx("hi");
        c.messages.push(ChatMessage::assistant_with_tools(
            "",
            &[
                ToolUseRequest { id: "a".into(), name: "search".into(), input: json!({}) },
                ToolUseRequest { id: "b".into(), name: "missing".into(), input: json!({}) },
            ],
        ));

        ToolExecutor
            .execute(&tool_node(json!({})), &mut c, &env)
            .await
            .unwrap();

        assert_eq!(c.tool_calls, 1);
        let results: Vec<_> = c.messages[2..]
            .iter()
            .flat_map(|m| m.content.clone())
            .collect();
        assert!(matches!(&results[0], ContentBlock::ToolResult { tool_use_id, is_error: false, .. } if tool_use_id == "a"));
        assert!(matches!(&results[1], ContentBlock::ToolResult { tool_use_id, is_error: true, .. } if tool_use_id == "b"));
        assert!(c.pending_tool_uses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_is_reported_as_timeout() {
        let env = env()
            .tool(CountingTool::new("slow").with_delay(Duration::from_secs(30)))
            .config(|c| c.call_timeout_secs = 1)
            .build();
        let mut c = ctx("hi");
        let err = ToolExecutor
            .execute(&tool_node(json!({"calls": [{"tool": "slow"}]})), &mut c, &env)
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::ToolTimeout { timeout_secs: 1, .. }));
    }
}
