use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::graph::NodeType;

use super::{kind_mismatch, NodeExecutor, NodeKind, PlannedNode};
use crate::context::Context;
use crate::env::RunEnv;

/// Sleeps without holding a worker, clamped to the engine's `max_delay_ms`.
pub struct DelayExecutor;

impl NodeExecutor for DelayExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a PlannedNode,
        _ctx: &'a mut Context,
        env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let NodeKind::Delay(config) = &node.kind else {
                return Err(kind_mismatch(node, NodeType::Delay));
            };
            let ms = config.duration_ms().min(env.engine.max_delay_ms);
            if ms == 0 {
                return Ok(());
            }
            debug!(node_id = %node.id, ms, "Delaying");
            tokio::select! {
                _ = env.cancel.cancelled() => Err(StrandError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx, env};
    use serde_json::json;
    use strand_core::graph::Node;
    use tokio::time::Instant;

    fn delay_node(ms: u64) -> PlannedNode {
        PlannedNode {
            id: "wait".into(),
            kind: NodeKind::from_node(&Node::new("wait", NodeType::Delay, json!({"ms": ms})))
                .unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_clamped() {
        let env = env().engine(|e| e.max_delay_ms = 50).build();
        let mut c = ctx("hi");
        let start = Instant::now();
        DelayExecutor
            .execute(&delay_node(10_000), &mut c, &env)
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_delay() {
        let env = env().build();
        let cancel = env.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let mut c = ctx("hi");
        let err = DelayExecutor
            .execute(&delay_node(30_000), &mut c, &env)
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::Cancelled));
    }
}
