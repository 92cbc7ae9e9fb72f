//! Execution strategies: how a planned graph is driven over a context.

pub mod dag;
pub mod factory;
pub mod parallel;
pub mod sequential;

use futures::future::BoxFuture;

use strand_core::config::StrategyKind;
use strand_core::error::StrandError;

use crate::context::Context;
use crate::env::RunEnv;
use crate::plan::Plan;

pub use dag::DagStrategy;
pub use factory::StrategyFactory;
pub use parallel::ParallelStrategy;
pub use sequential::SequentialStrategy;

/// A failed execution together with the context as it stood when it failed,
/// so partial output and usage survive.
#[derive(Debug)]
pub struct ExecutionFailure {
    pub error: StrandError,
    pub context: Box<Context>,
}

impl ExecutionFailure {
    pub fn new(error: StrandError, context: Context) -> Self {
        Self {
            error,
            context: Box::new(context),
        }
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

pub type Outcome = std::result::Result<Context, ExecutionFailure>;

pub trait ExecutionStrategy: Send + Sync + 'static {
    fn kind(&self) -> StrategyKind;

    fn execute<'a>(
        &'a self,
        plan: &'a Plan,
        env: &'a RunEnv,
        ctx: Context,
    ) -> BoxFuture<'a, Outcome>;
}

/// Pair a walk result with the context it produced.
pub(crate) fn settle(result: strand_core::error::Result<()>, ctx: Context) -> Outcome {
    match result {
        Ok(()) => Ok(ctx),
        Err(e) => Err(ExecutionFailure::new(e, ctx)),
    }
}
