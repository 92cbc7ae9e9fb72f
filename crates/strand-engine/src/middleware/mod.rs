//! Ordered middleware around strategy execution.
//!
//! Each middleware receives the invocation, the context and a [`Next`]
//! continuation. Calling `next.run(ctx)` hands control to the rest of the
//! chain; the innermost step is the execution strategy itself.

pub mod caching;
pub mod monitoring;
pub mod rate_limit;
pub mod retry;
pub mod validation;

use std::sync::Arc;

use futures::future::BoxFuture;

use strand_core::config::{MiddlewareConfig, MiddlewareKind};

use crate::context::Context;
use crate::env::RunEnv;
use crate::plan::Plan;
use crate::strategy::{ExecutionStrategy, Outcome};

pub use caching::{CacheStore, CachingMiddleware, MemoryCacheStore};
pub use monitoring::MonitoringMiddleware;
pub use rate_limit::RateLimitMiddleware;
pub use retry::RetryMiddleware;
pub use validation::ValidationMiddleware;

/// One strategy execution as seen by the middleware chain.
pub struct Invocation<'a> {
    pub plan: &'a Plan,
    pub env: &'a RunEnv,
    pub strategy: &'a dyn ExecutionStrategy,
    /// Stable identity of the prepared graph.
    pub graph_key: &'a str,
}

pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn handle<'a>(
        &'a self,
        inv: &'a Invocation<'a>,
        ctx: Context,
        next: Next<'a>,
    ) -> BoxFuture<'a, Outcome>;
}

/// The remainder of the chain. Copy, so retry can call it repeatedly.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    inv: &'a Invocation<'a>,
}

impl<'a> Next<'a> {
    pub fn run(self, ctx: Context) -> BoxFuture<'a, Outcome> {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(
                self.inv,
                ctx,
                Next {
                    chain: rest,
                    inv: self.inv,
                },
            ),
            None => self
                .inv
                .strategy
                .execute(self.inv.plan, self.inv.env, ctx),
        }
    }
}

/// Middleware in the order they wrap execution, outermost first.
#[derive(Clone, Default)]
pub struct Pipeline {
    chain: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.chain.push(middleware);
        self
    }

    /// Build the chain named by `config.order`. State such as the cache and
    /// rate-limit windows lives in the constructed middleware, so one
    /// pipeline must be shared across runs.
    pub fn from_config(config: &MiddlewareConfig, cache: Arc<dyn CacheStore>) -> Self {
        let mut pipeline = Self::new();
        for kind in &config.order {
            let middleware: Arc<dyn Middleware> = match kind {
                MiddlewareKind::Monitoring => Arc::new(MonitoringMiddleware),
                MiddlewareKind::Cache => {
                    if !config.cache.enabled {
                        continue;
                    }
                    Arc::new(CachingMiddleware::new(cache.clone(), config.cache.clone()))
                }
                MiddlewareKind::Retry => Arc::new(RetryMiddleware::new(config.retry.clone())),
                MiddlewareKind::Validation => {
                    Arc::new(ValidationMiddleware::new(config.validation.clone()))
                }
                MiddlewareKind::RateLimit => {
                    Arc::new(RateLimitMiddleware::new(config.rate_limit.clone()))
                }
            };
            pipeline.chain.push(middleware);
        }
        pipeline
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.chain.iter().map(|m| m.name()).collect()
    }

    pub async fn run(&self, inv: &Invocation<'_>, ctx: Context) -> Outcome {
        Next {
            chain: &self.chain,
            inv,
        }
        .run(ctx)
        .await
    }
}
