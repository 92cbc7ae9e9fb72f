//! `{{name}}` placeholder rendering for prompts, tool arguments and
//! template instantiation.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}")
            .expect("placeholder pattern is a valid regex")
    })
}

/// Display a JSON value inside text: strings unquoted, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace every `{{name}}` with `lookup(name)`. Unknown names are left as-is.
pub fn render<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    placeholder_re()
        .replace_all(text, |caps: &Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Names referenced by placeholders in `text`, in order of appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    placeholder_re()
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Render placeholders in every string of a JSON value.
///
/// A string that consists of exactly one placeholder is replaced by the
/// parameter's value with its JSON type preserved.
pub fn render_value(value: &Value, params: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(caps) = placeholder_re().captures(trimmed) {
                if caps[0].len() == trimmed.len() {
                    if let Some(v) = params.get(&caps[1]) {
                        return v.clone();
                    }
                }
            }
            Value::String(render(s, |name| params.get(name).map(display_value)))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, params)).collect()),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), render_value(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_known_and_unknown() {
        let out = render("Hi {{ name }}, see {{missing}}", |k| {
            (k == "name").then(|| "Ada".to_string())
        });
        assert_eq!(out, "Hi Ada, see {{missing}}");
    }

    #[test]
    fn test_render_value_preserves_types() {
        let mut params = Map::new();
        params.insert("limit".into(), json!(5));
        params.insert("topic".into(), json!("rust"));

        let input = json!({"top_k": "{{limit}}", "query": "about {{topic}}", "tags": ["{{topic}}"]});
        let out = render_value(&input, &params);
        assert_eq!(out, json!({"top_k": 5, "query": "about rust", "tags": ["rust"]}));
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders("{{a}} and {{ b.c }}"), vec!["a", "b.c"]);
        assert!(placeholders("plain").is_empty());
    }
}
