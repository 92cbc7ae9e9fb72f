use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use strand_core::config::CacheConfig;
use strand_core::event::EventKind;

use super::{Invocation, Middleware, Next};
use crate::context::Context;
use crate::prepare::hash_json;
use crate::strategy::{ExecutionFailure, Outcome};

/// Storage for completed contexts. Implementations must be safe for
/// concurrent get/put from many runs.
pub trait CacheStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<Context>;
    fn put(&self, key: &str, ctx: Context);
}

struct CacheEntry {
    ctx: Context,
    stored_at: Instant,
    seq: u64,
}

/// In-process cache with a TTL and an entry cap.
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    seq: AtomicU64,
}

impl MemoryCacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries.max(1),
            seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&self) {
        self.entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.seq)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Option<Context> {
        if let Some(entry) = self.entries.get(key) {
            if entry.stored_at.elapsed() < self.ttl {
                return Some(entry.ctx.clone());
            }
        }
        self.entries
            .remove_if(key, |_, e| e.stored_at.elapsed() >= self.ttl);
        None
    }

    fn put(&self, key: &str, ctx: Context) {
        if !self.entries.contains_key(key) {
            self.evict();
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                ctx,
                stored_at: Instant::now(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            },
        );
    }
}

/// Short-circuits execution when an identical invocation already succeeded.
///
/// The key covers graph identity, the user, the config fields that shape
/// output, message history and variables. Failures are never stored.
pub struct CachingMiddleware {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
}

impl CachingMiddleware {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }
}

pub fn cache_key(inv: &Invocation<'_>, ctx: &Context) -> String {
    let cfg = &inv.env.config;
    let messages: Vec<Value> = ctx
        .messages
        .iter()
        .map(|m| json!([m.role, m.text(), m.tool_uses().len(), m.tool_result_ids()]))
        .collect();
    hash_json(&json!({
        "graph": inv.graph_key,
        "user": ctx.user_id,
        "config": {
            "provider": cfg.provider,
            "model": cfg.model,
            "temperature": cfg.temperature,
            "max_tokens": cfg.max_tokens,
            "enable_tools": cfg.enable_tools,
            "enable_retrieval": cfg.enable_retrieval,
            "enable_memory": cfg.enable_memory,
            "allowed_tools": cfg.allowed_tools,
            "document_scope": cfg.document_scope,
            "memory_window": cfg.memory_window,
            "max_tool_calls": cfg.max_tool_calls,
            "system_prompt": cfg.system_prompt,
        },
        "tools": inv.env.tools.iter().map(|t| t.name()).collect::<Vec<_>>(),
        "messages": messages,
        "variables": ctx.variables(),
    }))
}

impl Middleware for CachingMiddleware {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn handle<'a>(
        &'a self,
        inv: &'a Invocation<'a>,
        ctx: Context,
        next: Next<'a>,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let env = inv.env;
            let key = cache_key(inv, &ctx);

            if let Some(mut cached) = self.store.get(&key) {
                debug!(run_id = %env.run_id, key = %key, "Cache hit");
                env.publish(EventKind::CacheHit, json!({ "key": key }));

                cached.user_id = ctx.user_id;
                cached.conversation_id = ctx.conversation_id;
                cached.metadata = ctx.metadata;
                cached.metadata.insert("cache_hit".into(), Value::Bool(true));
                cached.reset_usage();

                if let (Some(sink), Some(text)) = (&env.sink, cached.response()) {
                    if let Err(e) = sink.emit("cache", &text).await {
                        return Err(ExecutionFailure::new(e, cached));
                    }
                }
                return Ok(cached);
            }

            debug!(run_id = %env.run_id, key = %key, ttl_secs = self.config.ttl_secs, "Cache miss");
            env.publish(EventKind::CacheMiss, json!({ "key": key }));

            let outcome = next.run(ctx).await;
            if let Ok(done) = &outcome {
                self.store.put(&key, done.clone());
            }
            outcome
        })
    }
}
