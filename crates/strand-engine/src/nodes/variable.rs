use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use strand_core::error::Result;
use strand_core::graph::NodeType;
use strand_core::template::placeholders;

use super::{kind_mismatch, NodeExecutor, NodeKind, PlannedNode};
use crate::context::Context;
use crate::env::RunEnv;

/// Reads and writes named variables.
///
/// Applied in order: `copy`, `set`, `capture`, `unset`.
pub struct VariableExecutor;

impl NodeExecutor for VariableExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a PlannedNode,
        ctx: &'a mut Context,
        _env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let NodeKind::Variable(config) = &node.kind else {
                return Err(kind_mismatch(node, NodeType::Variable));
            };

            for (target, source) in &config.copy {
                let Some(key) = source.as_str() else { continue };
                match ctx.lookup(key) {
                    Some(value) => ctx.set_variable(target.clone(), value),
                    None => debug!(node_id = %node.id, source = key, "Copy source not set"),
                }
            }

            for (name, value) in &config.set {
                let resolved = resolve(value, ctx);
                ctx.set_variable(name.clone(), resolved);
            }

            if let Some(name) = &config.capture {
                let reply = ctx.response().unwrap_or_default();
                ctx.set_variable(name.clone(), Value::String(reply));
            }

            for name in &config.unset {
                ctx.remove_variable(name);
            }
            Ok(())
        })
    }
}

/// Render string values, recursing into arrays and objects. A string that
/// is exactly one placeholder takes the looked-up value with its JSON type.
pub(super) fn resolve(value: &Value, ctx: &Context) -> Value {
    match value {
        Value::String(text) => resolve_text(text, ctx).unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_text(text: &str, ctx: &Context) -> Option<Value> {
    let names = placeholders(text);
    if let [only] = names.as_slice() {
        let trimmed = text.trim();
        if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
            if let Some(v) = ctx.lookup(only) {
                return Some(v);
            }
        }
    }
    if names.is_empty() {
        None
    } else {
        Some(Value::String(ctx.render(text)))
    }
}
