use futures::future::BoxFuture;

use strand_core::error::Result;

use super::{NodeExecutor, PlannedNode};
use crate::context::Context;
use crate::env::RunEnv;

/// Start and end nodes only mark graph boundaries.
pub struct PassthroughExecutor;

impl NodeExecutor for PassthroughExecutor {
    fn execute<'a>(
        &'a self,
        _node: &'a PlannedNode,
        _ctx: &'a mut Context,
        _env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
