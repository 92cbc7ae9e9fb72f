use futures::future::BoxFuture;
use tracing::debug;

use strand_core::error::Result;
use strand_core::graph::NodeType;

use super::{kind_mismatch, NodeExecutor, NodeKind, PlannedNode};
use crate::context::Context;
use crate::env::RunEnv;

/// Evaluates a predicate and records it for `if_true` / `if_false` edges.
pub struct ConditionalExecutor;

impl NodeExecutor for ConditionalExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a PlannedNode,
        ctx: &'a mut Context,
        _env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let NodeKind::Conditional { config, predicate } = &node.kind else {
                return Err(kind_mismatch(node, NodeType::Conditional));
            };
            let outcome = predicate.evaluate(&|k: &str| ctx.lookup(k));
            debug!(node_id = %node.id, condition = %config.condition, outcome, "Evaluated condition");
            ctx.set_conditional_result(&node.id, outcome);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx, env};
    use serde_json::json;
    use strand_core::graph::Node;

    #[tokio::test]
    async fn records_outcome_under_node_id() {
        let node = PlannedNode {
            id: "route".into(),
            kind: NodeKind::from_node(&Node::new(
                "route",
                NodeType::Conditional,
                json!({"expr": "tier == \"gold\""}),
            ))
            .unwrap(),
        };
        let env = env().build();
        let mut c = ctx("hi");
        c.set_variable("tier", json!("gold"));
        ConditionalExecutor.execute(&node, &mut c, &env).await.unwrap();
        assert_eq!(c.conditional_result("route"), Some(true));

        c.set_variable("tier", json!("silver"));
        ConditionalExecutor.execute(&node, &mut c, &env).await.unwrap();
        assert_eq!(c.conditional_result("route"), Some(false));
    }
}
