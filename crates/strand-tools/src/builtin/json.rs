use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use strand_core::error::{Result, StrandError};
use strand_core::traits::Tool;
use strand_core::types::{ToolContext, ToolOutput};

pub struct JsonExtractTool;

#[derive(Deserialize)]
struct JsonExtractInput {
    /// A JSON value, or a string containing JSON.
    value: Value,
    path: String,
}

impl Tool for JsonExtractTool {
    fn name(&self) -> &str {
        "json_extract"
    }

    fn description(&self) -> &str {
        "Extract a field from a JSON value by dot path (e.g. 'items[0].name')."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "value": { "description": "JSON value or JSON-encoded string" },
                "path": { "type": "string", "description": "Dot path, e.g. 'items[0].name'" }
            },
            "required": ["value", "path"]
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn execute(&self, input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let p: JsonExtractInput =
                serde_json::from_value(input).map_err(|e| StrandError::ToolExecution {
                    tool: "json_extract".into(),
                    message: e.to_string(),
                })?;
            let value = match p.value {
                Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
                other => other,
            };
            Ok(match extract(&value, &p.path) {
                Some(Value::String(s)) => ToolOutput::success(s.clone()),
                Some(v) => ToolOutput::success(v.to_string()),
                None => ToolOutput::error(format!("path '{}' not found", p.path)),
            })
        })
    }
}

/// Walk `path` (`a.b[2].c`) through `value`.
pub fn extract<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for idx in indexes.split('[').filter(|s| !s.is_empty()) {
            let idx: usize = idx.trim_end_matches(']').parse().ok()?;
            current = current.get(idx)?;
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::types::RunId;

    #[test]
    fn extract_nested_paths() {
        let v = json!({"items": [{"name": "a"}, {"name": "b", "tags": [[1, 2]]}]});
        assert_eq!(extract(&v, "items[1].name"), Some(&json!("b")));
        assert_eq!(extract(&v, "items[1].tags[0][1]"), Some(&json!(2)));
        assert_eq!(extract(&v, "items[5].name"), None);
        assert_eq!(extract(&v, ""), Some(&v));
    }

    #[tokio::test]
    async fn tool_parses_string_json() {
        let ctx = ToolContext {
            run_id: RunId::new(),
            user_id: "u".into(),
            conversation_id: None,
        };
        let out = JsonExtractTool
            .execute(json!({"value": "{\"city\":\"Oslo\"}", "path": "city"}), ctx.clone())
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::success("Oslo"));

        let missing = JsonExtractTool
            .execute(json!({"value": {}, "path": "x"}), ctx)
            .await
            .unwrap();
        assert!(missing.is_error);
    }
}
