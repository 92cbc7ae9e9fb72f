use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;

use strand_core::error::Result;
use strand_core::traits::Tool;
use strand_core::types::{ToolContext, ToolOutput};

pub struct CurrentTimeTool;

impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Return the current UTC time in RFC 3339 format."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            Ok(ToolOutput::success(
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ))
        })
    }
}
