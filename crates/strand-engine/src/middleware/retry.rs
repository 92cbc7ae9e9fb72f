use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::warn;

use strand_core::config::RetryConfig;
use strand_core::error::StrandError;
use strand_core::event::EventKind;
use strand_core::types::UsageTotals;

use super::{Invocation, Middleware, Next};
use crate::context::Context;
use crate::strategy::{ExecutionFailure, Outcome};

/// Re-invokes the rest of the chain after retryable failures, with
/// exponential backoff and jitter.
///
/// A streaming attempt that already emitted chunks is never replayed. Usage
/// from failed attempts is carried into the final context.
pub struct RetryMiddleware {
    config: RetryConfig,
}

impl RetryMiddleware {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

pub(crate) fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn handle<'a>(
        &'a self,
        inv: &'a Invocation<'a>,
        ctx: Context,
        next: Next<'a>,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let env = inv.env;
            let max_retries = self.config.max_retries;
            let mut spent = UsageTotals::default();
            let mut attempt = 0;

            loop {
                let emitted_before = env.sink.as_ref().map(|s| s.emitted());
                let outcome = next.run(ctx.clone()).await;

                let failure = match outcome {
                    Ok(mut done) => {
                        done.absorb_usage(&spent);
                        return Ok(done);
                    }
                    Err(failure) => failure,
                };

                let streamed = env.sink.as_ref().map(|s| s.emitted()) != emitted_before;
                if !failure.error.is_retryable() || streamed || attempt >= max_retries {
                    return Err(carry_usage(failure, &spent));
                }

                spent.absorb(&failure.context.usage().since(ctx.usage()));
                let backoff = calculate_backoff(attempt, &self.config);
                attempt += 1;
                warn!(
                    run_id = %env.run_id,
                    attempt,
                    max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %failure.error,
                    "Retrying workflow execution"
                );
                env.publish(
                    EventKind::RetryScheduled,
                    json!({
                        "attempt": attempt,
                        "max_retries": max_retries,
                        "backoff_ms": backoff.as_millis() as u64,
                        "kind": failure.error.kind(),
                    }),
                );

                tokio::select! {
                    _ = env.cancel.cancelled() => {
                        return Err(carry_usage(
                            ExecutionFailure::new(StrandError::Cancelled, *failure.context),
                            &spent,
                        ));
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        })
    }
}

fn carry_usage(mut failure: ExecutionFailure, spent: &UsageTotals) -> ExecutionFailure {
    failure.context.absorb_usage(spent);
    failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::plan::Plan;
    use crate::strategy::SequentialStrategy;
    use crate::testing::{ctx, env};
    use std::sync::Arc;
    use strand_test_utils::{plain_graph, ScriptedProvider};

    fn config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = config();
        let first = calculate_backoff(0, &cfg).as_millis();
        assert!((80..=120).contains(&first));
        let capped = calculate_backoff(10, &cfg).as_millis();
        assert!((800..=1200).contains(&capped));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_provider_errors() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_failure(StrandError::ProviderRateLimited("429".into()))
                .with_failure(StrandError::ProviderTimeout { timeout_secs: 1 }),
        );
        let env = env().model(provider.clone()).build();
        let plan = Plan::build(&plain_graph()).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "k",
        };

        let out = Pipeline::new()
            .with(Arc::new(RetryMiddleware::new(config())))
            .run(&inv, ctx("hello"))
            .await
            .unwrap();
        assert_eq!(provider.calls(), 3);
        assert!(out.response().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_failure(StrandError::ProviderStream("reset".into()))
                .with_failure(StrandError::ProviderStream("reset".into()))
                .with_failure(StrandError::ProviderStream("reset".into())),
        );
        let env = env().model(provider.clone()).build();
        let plan = Plan::build(&plain_graph()).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "k",
        };

        let failure = Pipeline::new()
            .with(Arc::new(RetryMiddleware::new(config())))
            .run(&inv, ctx("hello"))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, StrandError::ProviderStream(_)));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let provider = Arc::new(
            ScriptedProvider::new().with_failure(StrandError::ProviderRequest("HTTP 400".into())),
        );
        let env = env().model(provider.clone()).build();
        let plan = Plan::build(&plain_graph()).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "k",
        };

        let result = Pipeline::new()
            .with(Arc::new(RetryMiddleware::new(config())))
            .run(&inv, ctx("hello"))
            .await;
        assert!(result.is_err());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_attempts_are_not_replayed() {
        let provider = Arc::new(ScriptedProvider::new().with_chunk_delay(
            std::time::Duration::from_secs(2),
        ));
        let (env, _rx) = env()
            .model(provider.clone())
            .config(|c| c.call_timeout_secs = 3)
            .build_streaming(64);
        let plan = Plan::build(&plain_graph()).unwrap();
        let inv = Invocation {
            plan: &plan,
            env: &env,
            strategy: &SequentialStrategy,
            graph_key: "k",
        };

        let failure = Pipeline::new()
            .with(Arc::new(RetryMiddleware::new(config())))
            .run(&inv, ctx("hello"))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, StrandError::ProviderTimeout { .. }));
        assert_eq!(provider.calls(), 1);
    }
}
