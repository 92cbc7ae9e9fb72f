use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::time::Instant;
use tracing::warn;

use strand_core::config::{RateLimitConfig, RateLimitScope};
use strand_core::error::StrandError;
use strand_core::event::EventKind;

use super::{Invocation, Middleware, Next};
use crate::context::Context;
use crate::strategy::{ExecutionFailure, Outcome};

const GLOBAL_KEY: &str = "*";

/// Sliding-window request limit plus an optional in-flight cap.
///
/// Both are keyed per user or globally. A rejected invocation never reaches
/// the rest of the chain. Keys with no recent requests and nothing in flight
/// are dropped.
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    window: Duration,
    requests: DashMap<String, VecDeque<Instant>>,
    in_flight: DashMap<String, Arc<AtomicUsize>>,
    admitted: AtomicUsize,
}

/// Releases an in-flight slot on drop, removing the key once idle.
struct Slot<'a> {
    in_flight: &'a DashMap<String, Arc<AtomicUsize>>,
    key: String,
    counter: Arc<AtomicUsize>,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight
                .remove_if(&self.key, |_, c| c.load(Ordering::Acquire) == 0);
        }
    }
}

impl RateLimitMiddleware {
    /// Stale window keys are swept once every this many admissions.
    const SWEEP_EVERY: usize = 256;

    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            config,
            requests: DashMap::new(),
            in_flight: DashMap::new(),
            admitted: AtomicUsize::new(0),
        }
    }

    fn key(&self, inv: &Invocation<'_>) -> String {
        match self.config.scope {
            RateLimitScope::PerUser => inv.env.user_id.clone(),
            RateLimitScope::Global => GLOBAL_KEY.to_string(),
        }
    }

    /// Record a request in the window, or say why it is refused.
    fn admit(&self, key: &str) -> Result<(), String> {
        let now = Instant::now();
        if self.admitted.fetch_add(1, Ordering::Relaxed) % Self::SWEEP_EVERY == Self::SWEEP_EVERY - 1 {
            self.sweep(now);
        }

        let mut stamps = self.requests.entry(key.to_string()).or_default();
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }
        if stamps.len() >= self.config.max_requests {
            return Err(format!(
                "{} requests in the last {}s",
                stamps.len(),
                self.config.window_secs
            ));
        }
        stamps.push_back(now);
        Ok(())
    }

    /// Drop keys whose newest request has left the window.
    fn sweep(&self, now: Instant) {
        self.requests.retain(|_, stamps| {
            stamps
                .back()
                .is_some_and(|last| now.duration_since(*last) < self.window)
        });
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> (usize, usize) {
        (self.requests.len(), self.in_flight.len())
    }

    fn acquire(&self, key: &str) -> Result<Option<Slot<'_>>, String> {
        let Some(max) = self.config.max_concurrent else {
            return Ok(None);
        };
        // Increment under the entry lock so an idle key is never removed
        // between lookup and increment.
        let entry = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        let current = entry.load(Ordering::Acquire);
        if current >= max {
            let idle = current == 0;
            drop(entry);
            if idle {
                self.in_flight
                    .remove_if(key, |_, c| c.load(Ordering::Acquire) == 0);
            }
            return Err(format!("{current} runs already in flight"));
        }
        entry.fetch_add(1, Ordering::AcqRel);
        let counter = Arc::clone(&*entry);
        drop(entry);
        Ok(Some(Slot {
            in_flight: &self.in_flight,
            key: key.to_string(),
            counter,
        }))
    }

    fn reject(&self, inv: &Invocation<'_>, key: &str, reason: String, ctx: Context) -> Outcome {
        let scope = match self.config.scope {
            RateLimitScope::PerUser => format!("user:{key}"),
            RateLimitScope::Global => "global".to_string(),
        };
        warn!(run_id = %inv.env.run_id, scope = %scope, reason = %reason, "Rate limit exceeded");
        inv.env.publish(
            EventKind::RateLimited,
            json!({ "scope": scope, "reason": reason }),
        );
        Err(ExecutionFailure::new(
            StrandError::RateLimitExceeded { scope, reason },
            ctx,
        ))
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn handle<'a>(
        &'a self,
        inv: &'a Invocation<'a>,
        ctx: Context,
        next: Next<'a>,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let key = self.key(inv);
            let _slot = match self.acquire(&key) {
                Ok(slot) => slot,
                Err(reason) => return self.reject(inv, &key, reason, ctx),
            };
            if let Err(reason) = self.admit(&key) {
                return self.reject(inv, &key, reason, ctx);
            }
            next.run(ctx).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::plan::Plan;
    use crate::strategy::SequentialStrategy;
    use crate::testing::{ctx, env};
    use futures::future::join_all;
    use strand_core::graph::{Graph, Node, NodeType};
    use strand_test_utils::plain_graph;

    fn limiter(max_requests: usize, max_concurrent: Option<usize>) -> Arc<RateLimitMiddleware> {
        Arc::new(RateLimitMiddleware::new(RateLimitConfig {
            max_requests,
            window_secs: 60,
            max_concurrent,
            scope: RateLimitScope::PerUser,
        }))
    }

    #[tokio::test]
    async fn window_rejects_the_extra_request() {
        let env = env().build();
        let plan = Plan::build(&plain_graph()).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "k",
        };
        let pipeline = Pipeline::new().with(limiter(2, None));

        assert!(pipeline.run(&inv, ctx("a")).await.is_ok());
        assert!(pipeline.run(&inv, ctx("b")).await.is_ok());
        let failure = pipeline.run(&inv, ctx("c")).await.unwrap_err();
        assert!(matches!(
            failure.error,
            StrandError::RateLimitExceeded { ref scope, .. } if scope == "user:u1"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let env = env().build();
        let plan = Plan::build(&plain_graph()).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "k",
        };
        let pipeline = Pipeline::new().with(limiter(1, None));

        assert!(pipeline.run(&inv, ctx("a")).await.is_ok());
        assert!(pipeline.run(&inv, ctx("b")).await.is_err());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(pipeline.run(&inv, ctx("c")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cap_rejects_exactly_one() {
        let env = env().build();
        let graph = Graph::new(
            vec![
                Node::start("start"),
                Node::new("wait", NodeType::Delay, serde_json::json!({"ms": 500})),
            ],
            vec![strand_core::graph::Edge::always("start", "wait")],
        );
        let plan = Plan::build(&graph).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "k",
        };
        let pipeline = Pipeline::new().with(limiter(100, Some(3)));

        let results = join_all((0..4).map(|i| pipeline.run(&inv, ctx(&format!("q{i}"))))).await;
        let rejected = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(rejected, 1);

        // Slots are released once runs finish
        assert!(pipeline.run(&inv, ctx("again")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_keys_are_dropped() {
        let limiter = limiter(10, Some(2));
        let env = env().build();
        let plan = Plan::build(&plain_graph()).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "k",
        };
        let pipeline = Pipeline::new().with(limiter.clone());

        assert!(pipeline.run(&inv, ctx("a")).await.is_ok());
        // Nothing in flight once the run returns
        assert_eq!(limiter.tracked_keys(), (1, 0));

        limiter.admit("other").unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.admit("recent").unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        limiter.sweep(Instant::now());

        assert_eq!(limiter.tracked_keys(), (1, 0));
        assert!(limiter.requests.contains_key("recent"));
    }
}
