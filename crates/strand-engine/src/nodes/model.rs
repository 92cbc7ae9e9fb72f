use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info};

use strand_core::error::{Result, StrandError};
use strand_core::graph::NodeType;
use strand_core::types::{ChatMessage, ModelDelta, ModelRequest, ModelResponse};

use super::config::ModelConfig;
use super::{kind_mismatch, NodeExecutor, NodeKind, PlannedNode};
use crate::context::Context;
use crate::env::RunEnv;

/// Calls the run's model and appends its reply to history.
///
/// Streams through the run's chunk sink when there is one. Cancellation and
/// the per-call timeout keep whatever text already arrived as a partial
/// assistant message before failing.
pub struct ModelExecutor;

impl NodeExecutor for ModelExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a PlannedNode,
        ctx: &'a mut Context,
        env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let NodeKind::Model(config) = &node.kind else {
                return Err(kind_mismatch(node, NodeType::Model));
            };

            if let Some(prompt) = &config.prompt {
                let text = ctx.render(prompt);
                ctx.messages.push(ChatMessage::user(text));
            }

            let request = build_request(config, ctx, env);
            debug!(
                node_id = %node.id,
                model = %request.model,
                messages = request.messages.len(),
                tools = request.tools.len(),
                "Calling model"
            );

            let timeout = env.call_timeout();
            let mut partial = String::new();
            let outcome = tokio::select! {
                _ = env.cancel.cancelled() => Err(StrandError::Cancelled),
                res = tokio::time::timeout(timeout, call(env, &node.id, request, &mut partial)) => {
                    res.unwrap_or(Err(StrandError::ProviderTimeout {
                        timeout_secs: timeout.as_secs(),
                    }))
                }
            };

            let response = match outcome {
                Ok(r) => r,
                Err(err) => {
                    let interrupted = matches!(
                        err,
                        StrandError::Cancelled | StrandError::ProviderTimeout { .. }
                    );
                    if interrupted && !partial.is_empty() {
                        ctx.messages.push(ChatMessage::assistant_text(partial));
                    }
                    return Err(err);
                }
            };

            ctx.record_usage(&response.usage);
            info!(
                node_id = %node.id,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                tool_uses = response.tool_uses.len(),
                "Model call completed"
            );

            if let Some(var) = &config.output_var {
                ctx.set_variable(var.clone(), Value::String(response.text.clone()));
            }
            let message = if response.tool_uses.is_empty() {
                ChatMessage::assistant_text(response.text)
            } else {
                ChatMessage::assistant_with_tools(response.text, &response.tool_uses)
            };
            ctx.messages.push(message);
            Ok(())
        })
    }
}

async fn call(
    env: &RunEnv,
    node_id: &str,
    request: ModelRequest,
    partial: &mut String,
) -> Result<ModelResponse> {
    let Some(sink) = &env.sink else {
        return env.model.invoke(request).await;
    };

    let mut stream = env.model.stream_invoke(request).await?;
    let mut response = ModelResponse::default();
    while let Some(delta) = stream.next().await {
        let delta = delta?;
        if let ModelDelta::Text(text) = &delta {
            partial.push_str(text);
            sink.emit(node_id, text).await?;
        }
        response.apply(delta);
    }
    Ok(response)
}

fn build_request(config: &ModelConfig, ctx: &Context, env: &RunEnv) -> ModelRequest {
    let prompt = config
        .system_prompt
        .as_ref()
        .or(env.config.system_prompt.as_ref())
        .map(|p| ctx.render(p));
    let retrieved = ctx
        .retrieval_context
        .as_deref()
        .filter(|r| !r.trim().is_empty());

    let system = match (prompt, retrieved) {
        (Some(p), Some(r)) => Some(format!("{}\n\nRelevant context:\n{}", p, r)),
        (Some(p), None) => Some(p),
        (None, Some(r)) => Some(format!(
            "Use the following context when it is relevant to the question.\n\nRelevant context:\n{}",
            r
        )),
        (None, None) => None,
    };

    let mut messages = Vec::with_capacity(ctx.messages.len() + 1);
    if let Some(s) = system {
        messages.push(ChatMessage::system(s));
    }
    messages.extend(ctx.messages.iter().cloned());

    let tools = if env.config.enable_tools && config.use_tools {
        env.tools.iter().map(|t| t.definition()).collect()
    } else {
        Vec::new()
    };

    ModelRequest {
        model: env.config.model.clone(),
        messages,
        temperature: config.temperature.unwrap_or(env.config.temperature),
        max_tokens: config.max_tokens.unwrap_or(env.config.max_tokens),
        tools,
    }
}
