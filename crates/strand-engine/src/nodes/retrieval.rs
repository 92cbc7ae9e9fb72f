use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info};

use strand_core::error::{Result, StrandError};
use strand_core::graph::NodeType;
use strand_core::types::Role;

use super::{kind_mismatch, NodeExecutor, NodeKind, PlannedNode};
use crate::context::Context;
use crate::env::RunEnv;

/// Fetches document chunks for the query and stores them as retrieval
/// context for later model nodes. History is left untouched.
pub struct RetrievalExecutor;

impl NodeExecutor for RetrievalExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a PlannedNode,
        ctx: &'a mut Context,
        env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let NodeKind::Retrieval(config) = &node.kind else {
                return Err(kind_mismatch(node, NodeType::Retrieval));
            };
            let Some(retriever) = &env.retriever else {
                return Err(StrandError::RetrievalUnavailable(
                    "no retriever is bound to this run".into(),
                ));
            };

            let query = match &config.query {
                Some(q) => ctx.render(q),
                None => ctx.last_text(Role::User).unwrap_or_default(),
            };
            debug!(node_id = %node.id, query = %query, top_k = config.top_k, "Retrieving");

            let timeout = env.call_timeout();
            let chunks = tokio::select! {
                _ = env.cancel.cancelled() => return Err(StrandError::Cancelled),
                res = tokio::time::timeout(timeout, retriever.retrieve(&query, config.top_k)) => {
                    match res {
                        Ok(Ok(chunks)) => chunks,
                        Ok(Err(e)) => return Err(StrandError::RetrievalUnavailable(e.to_string())),
                        Err(_) => {
                            return Err(StrandError::RetrievalUnavailable(format!(
                                "retriever timed out after {}s",
                                timeout.as_secs()
                            )))
                        }
                    }
                }
            };

            let joined = chunks
                .iter()
                .map(|c| c.content.trim())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            info!(node_id = %node.id, chunks = chunks.len(), "Retrieval completed");

            if let Some(var) = &config.output_var {
                ctx.set_variable(var.clone(), Value::String(joined.clone()));
            }
            ctx.retrieval_context = Some(joined);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx, env};
    use serde_json::json;
    use std::sync::Arc;
    use strand_core::graph::Node;
    use strand_test_utils::{chunk, StaticRetriever};

    fn node(config: Value) -> PlannedNode {
        PlannedNode {
            id: "docs".into(),
            kind: NodeKind::from_node(&Node::new("docs", NodeType::Retrieval, config)).unwrap(),
        }
    }

    #[tokio::test]
    async fn joins_top_k_chunks() {
        let retriever = Arc::new(StaticRetriever::new(vec![
            chunk("d1", "Oslo is the capital of Norway."),
            chunk("d2", "Bergen is rainy."),
            chunk("d3", "Tromsø is far north."),
        ]));
        let env = env().retriever(retriever.clone()).build();
        let mut c = ctx("capital of norway?");

        RetrievalExecutor
            .execute(&node(json!({"top_k": 2, "output_var": "docs"})), &mut c, &env)
            .await
            .unwrap();

        assert_eq!(
            c.retrieval_context.as_deref(),
            Some("Oslo is the capital of Norway.\n\nBergen is rainy.")
        );
        assert_eq!(retriever.queries(), vec!["capital of norway?".to_string()]);
        assert_eq!(c.messages.len(), 1);
        assert!(c.variable("docs").is_some());
    }

    #[tokio::test]
    async fn rendered_query_is_used() {
        let retriever = Arc::new(StaticRetriever::empty());
        let env = env().retriever(retriever.clone()).build();
        let mut c = ctx("ignored");
        c.set_variable("topic", json!("fjords"));

        RetrievalExecutor
            .execute(&node(json!({"query": "facts about {{topic}}"})), &mut c, &env)
            .await
            .unwrap();
        assert_eq!(retriever.queries(), vec!["facts about fjords".to_string()]);
    }

    #[tokio::test]
    async fn no_documents_is_empty_context() {
        let env = env().retriever(Arc::new(StaticRetriever::empty())).build();
        let mut c = ctx("anything");
        RetrievalExecutor
            .execute(&node(json!({})), &mut c, &env)
            .await
            .unwrap();
        assert_eq!(c.retrieval_context.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn failing_or_missing_retriever_is_unavailable() {
        let env_failing = env().retriever(Arc::new(StaticRetriever::failing())).build();
        let mut c = ctx("q");
        let err = RetrievalExecutor
            .execute(&node(json!({})), &mut c, &env_failing)
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::RetrievalUnavailable(msg) if msg.contains("index offline")));

        let env_missing = env().build();
        let err = RetrievalExecutor
            .execute(&node(json!({})), &mut c, &env_missing)
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::RetrievalUnavailable(_)));
        assert!(c.retrieval_context.is_none());
    }
}
