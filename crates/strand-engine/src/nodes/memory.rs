use std::sync::OnceLock;

use futures::future::BoxFuture;
use tiktoken_rs::CoreBPE;
use tracing::{info, warn};

use strand_core::error::{Result, StrandError};
use strand_core::graph::NodeType;
use strand_core::types::{ChatMessage, ModelRequest, Role};

use super::config::{MemoryConfig, MemoryMode};
use super::{kind_mismatch, NodeExecutor, NodeKind, PlannedNode};
use crate::context::Context;
use crate::env::RunEnv;

const SUMMARY_PROMPT: &str = "Summarize the following conversation concisely, preserving \
     key facts, names, numbers and decisions. Output only the summary.";

/// cl100k_base tokenizer, loaded once. `None` if the ranks failed to load.
fn tokenizer() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(error = %e, "cl100k tokenizer unavailable, estimating by length");
                None
            }
        })
        .as_ref()
}

pub fn estimate_tokens(text: &str) -> usize {
    match tokenizer() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.len().div_ceil(4),
    }
}

/// Content tokens plus 4 per message of framing.
pub fn estimate_message_tokens(msg: &ChatMessage) -> usize {
    let content = serde_json::to_string(&msg.content).unwrap_or_default();
    estimate_tokens(&content) + 4
}

/// Compacts long histories into a summary message plus the most recent tail.
pub struct MemoryExecutor;

impl NodeExecutor for MemoryExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a PlannedNode,
        ctx: &'a mut Context,
        env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let NodeKind::Memory(config) = &node.kind else {
                return Err(kind_mismatch(node, NodeType::Memory));
            };

            let window = config.window.unwrap_or(env.config.memory_window).max(1);
            let over_window = ctx.messages.len() > window;
            let over_budget = config.max_tokens.is_some_and(|max| {
                ctx.messages.iter().map(estimate_message_tokens).sum::<usize>() > max
            });
            if !over_window && !over_budget {
                return Ok(());
            }

            let keep = config.keep_last.unwrap_or(window / 2).max(1);
            let split = tail_start(&ctx.messages, keep);
            if split == 0 {
                return Ok(());
            }

            let head: Vec<ChatMessage> = ctx.messages[..split].to_vec();
            let summary = match config.mode {
                MemoryMode::Summarize => match summarize(config, &head, ctx, env).await {
                    Ok(text) => text,
                    Err(StrandError::Cancelled) => return Err(StrandError::Cancelled),
                    Err(e) => {
                        warn!(node_id = %node.id, error = %e, "Summary failed, truncating instead");
                        truncation_note(ctx, split)
                    }
                },
                MemoryMode::Truncate => truncation_note(ctx, split),
            };

            ctx.compact_history(
                split,
                ChatMessage::system(format!("Conversation summary: {}", summary)),
            );
            ctx.summary = Some(summary);

            info!(
                node_id = %node.id,
                compacted = split,
                kept = ctx.messages.len() - 1,
                "History compacted"
            );
            Ok(())
        })
    }
}

/// Index where the kept tail begins. Moves back so a tool result is never
/// separated from the assistant message that requested it.
fn tail_start(messages: &[ChatMessage], keep: usize) -> usize {
    let mut start = messages.len().saturating_sub(keep);
    while start > 0 && messages[start].role == Role::Tool {
        start -= 1;
    }
    start
}

fn truncation_note(ctx: &Context, dropped: usize) -> String {
    match &ctx.summary {
        Some(existing) => existing.clone(),
        None => format!("{} earlier messages were removed to save space.", dropped),
    }
}

async fn summarize(
    config: &MemoryConfig,
    head: &[ChatMessage],
    ctx: &mut Context,
    env: &RunEnv,
) -> Result<String> {
    let mut transcript = String::new();
    if let Some(previous) = &ctx.summary {
        transcript.push_str(&format!("Earlier summary: {}\n", previous));
    }
    for msg in head {
        let text = msg.text();
        if text.is_empty() {
            continue;
        }
        transcript.push_str(&format!("{:?}: {}\n", msg.role, text));
    }

    let instruction = config.summary_prompt.as_deref().unwrap_or(SUMMARY_PROMPT);
    let request = ModelRequest {
        model: env.config.model.clone(),
        messages: vec![ChatMessage::user(format!("{}\n\n{}", instruction, transcript))],
        temperature: 0.0,
        max_tokens: env.config.max_tokens,
        tools: Vec::new(),
    };

    let timeout = env.call_timeout();
    let response = tokio::select! {
        _ = env.cancel.cancelled() => return Err(StrandError::Cancelled),
        res = tokio::time::timeout(timeout, env.model.invoke(request)) => match res {
            Ok(r) => r?,
            Err(_) => return Err(StrandError::ProviderTimeout { timeout_secs: timeout.as_secs() }),
        },
    };
    ctx.record_usage(&response.usage);

    let text = response.text.trim().to_string();
    if text.is_empty() {
        return Err(StrandError::ProviderStream("empty summary".into()));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx, env};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use strand_core::graph::Node;
    use strand_core::types::ToolUseRequest;
    use strand_test_utils::{ScriptedProvider, ScriptedReply};

    fn node(config: Value) -> PlannedNode {
        PlannedNode {
            id: "memory".into(),
            kind: NodeKind::from_node(&Node::new("memory", NodeType::Memory, config)).unwrap(),
        }
    }

    fn long_history(turns: usize) -> Context {
        let mut c = ctx("turn 0");
        for i in 1..turns {
            c.messages.push(ChatMessage::assistant_text(format!("reply {}", i)));
            c.messages.push(ChatMessage::user(format!("turn {}", i)));
        }
        c
    }

    #[tokio::test]
    async fn short_history_is_untouched() {
        let provider = Arc::new(ScriptedProvider::new());
        let env = env().model(provider.clone()).build();
        let mut c = long_history(3);
        let before = c.messages.clone();

        MemoryExecutor
            .execute(&node(json!({"window": 10})), &mut c, &env)
            .await
            .unwrap();
        assert_eq!(c.messages, before);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn summarize_replaces_head_with_summary() {
        let provider = Arc::new(ScriptedProvider::always(ScriptedReply::text(
            "User counted turns.",
        )));
        let env = env().model(provider.clone()).build();
        let mut c = long_history(6);
        assert_eq!(c.messages.len(), 11);

        MemoryExecutor
            .execute(&node(json!({"window": 6, "keepLast": 4})), &mut c, &env)
            .await
            .unwrap();

        assert_eq!(c.messages.len(), 5);
        assert_eq!(c.messages[0].role, Role::System);
        assert_eq!(c.messages[0].text(), "Conversation summary: User counted turns.");
        assert_eq!(c.messages.last().unwrap().text(), "turn 5");
        assert_eq!(c.summary.as_deref(), Some("User counted turns."));
        assert_eq!(c.usage().model_calls, 1);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn truncate_mode_never_calls_the_model() {
        let provider = Arc::new(ScriptedProvider::new());
        let env = env().model(provider.clone()).build();
        let mut c = long_history(6);

        MemoryExecutor
            .execute(&node(json!({"mode": "truncate", "window": 4})), &mut c, &env)
            .await
            .unwrap();
        assert_eq!(provider.calls(), 0);
        assert_eq!(c.messages.len(), 3);
        assert!(c.summary.unwrap().contains("removed"));
    }

    #[tokio::test]
    async fn tail_keeps_tool_results_with_their_request() {
        let mut c = long_history(3);
        c.messages.push(ChatMessage::assistant_with_tools(
            "",
            &[ToolUseRequest { id: "t".into(), name: "search".into(), input: json!({}) }],
        ));
        c.messages.push(ChatMessage::tool_result("t", "found", false));
        assert_eq!(tail_start(&c.messages, 1), c.messages.len() - 2);
    }

    #[tokio::test]
    async fn failed_summary_falls_back_to_truncation() {
        let provider = Arc::new(
            ScriptedProvider::new().with_failure(StrandError::ProviderRequest("HTTP 400".into())),
        );
        let env = env().model(provider).build();
        let mut c = long_history(6);
        MemoryExecutor
            .execute(&node(json!({"window": 4})), &mut c, &env)
            .await
            .unwrap();
        assert_eq!(c.messages.len(), 3);
        assert!(c.summary.is_some());
    }

    #[test]
    fn token_estimate_is_positive() {
        assert!(estimate_tokens("hello world") >= 1);
        assert!(estimate_message_tokens(&ChatMessage::user("hi")) > 4);
    }
}
