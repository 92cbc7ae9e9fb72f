use std::sync::OnceLock;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::traits::Tool;
use strand_core::types::{ToolContext, ToolOutput};

const DEFAULT_MAX_LENGTH: usize = 20_000;

pub struct HttpGetTool;

#[derive(Deserialize)]
struct HttpGetInput {
    url: String,
    #[serde(default)]
    max_length: Option<usize>,
}

fn client() -> Result<&'static reqwest::Client> {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    if let Some(c) = CLIENT.get() {
        return Ok(c);
    }
    let built = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("strand/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| fail(format!("failed to create HTTP client: {}", e)))?;
    Ok(CLIENT.get_or_init(|| built))
}

fn fail(message: String) -> StrandError {
    StrandError::ToolExecution {
        tool: "http_get".into(),
        message,
    }
}

impl Tool for HttpGetTool {
    fn name(&self) -> &str {
        "http_get"
    }

    fn description(&self) -> &str {
        "Fetch a URL with HTTP GET and return the response body, truncated to max_length characters."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "http(s) URL to fetch" },
                "max_length": { "type": "integer", "description": "Maximum characters to return (default: 20000)" }
            },
            "required": ["url"]
        })
    }

    fn timeout_secs(&self) -> u64 {
        45
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let params: HttpGetInput =
                serde_json::from_value(input).map_err(|e| fail(e.to_string()))?;
            if !(params.url.starts_with("http://") || params.url.starts_with("https://")) {
                return Ok(ToolOutput::error("only http and https URLs are supported"));
            }

            debug!(url = %params.url, "Fetching URL");
            let resp = client()?
                .get(&params.url)
                .send()
                .await
                .map_err(|e| fail(format!("request failed: {}", e)))?;

            let status = resp.status();
            if !status.is_success() {
                return Ok(ToolOutput::error(format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                )));
            }

            let body = resp
                .text()
                .await
                .map_err(|e| fail(format!("failed to read body: {}", e)))?;
            Ok(ToolOutput::success(truncate(
                body,
                params.max_length.unwrap_or(DEFAULT_MAX_LENGTH),
            )))
        })
    }
}

fn truncate(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}\n\n[truncated at {} chars]", &text[..cut], max_chars),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo".into(), 10), "héllo");
        assert!(truncate("héllo".into(), 2).starts_with("hé\n"));
    }
}
