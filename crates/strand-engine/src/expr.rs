//! Predicate expressions for `expr` edges, conditional nodes and loop nodes.
//!
//! Supported forms:
//! - `key == "value"`, `key != "value"`, `key contains "substr"`
//! - `key < 3`, `key > 3`, `key <= 3`, `key >= 3` (numeric)
//! - `exists key` / `key exists`, `!key`, bare `key` (truthiness)
//! - `a && b`, `a || b` (`&&` binds tighter)
//!
//! Keys are resolved through a lookup function, normally
//! [`Context::lookup`](crate::context::Context::lookup). A comparison against
//! a missing key is false.

use serde_json::Value;

use strand_core::template::display_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

/// A parsed predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare { key: String, op: Op, value: Literal },
    Exists(String),
    Truthy(String),
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

// Longest operators first so `<=` is not read as `<`.
const OPERATORS: &[(&str, Op)] = &[
    ("==", Op::Eq),
    ("!=", Op::Ne),
    ("<=", Op::Le),
    (">=", Op::Ge),
    ("<", Op::Lt),
    (">", Op::Gt),
    (" contains ", Op::Contains),
];

impl Condition {
    /// Parse an expression. Returns `None` when it is not well formed.
    pub fn parse(expr: &str) -> Option<Condition> {
        let expr = expr.trim();
        if expr.is_empty() {
            return None;
        }

        let any = split_outside_quotes(expr, "||");
        if any.len() > 1 {
            return any
                .into_iter()
                .map(Condition::parse)
                .collect::<Option<Vec<_>>>()
                .map(Condition::Any);
        }
        let all = split_outside_quotes(expr, "&&");
        if all.len() > 1 {
            return all
                .into_iter()
                .map(Condition::parse)
                .collect::<Option<Vec<_>>>()
                .map(Condition::All);
        }

        if let Some((key, op, value)) = parse_operator(expr) {
            return Some(Condition::Compare {
                key: key.to_string(),
                op,
                value: parse_literal(value),
            });
        }

        if let Some(rest) = expr.strip_prefix("exists ") {
            return valid_key(rest.trim()).map(|k| Condition::Exists(k.to_string()));
        }
        if let Some(rest) = expr.strip_suffix(" exists") {
            return valid_key(rest.trim()).map(|k| Condition::Exists(k.to_string()));
        }
        if let Some(rest) = expr.strip_prefix('!').or_else(|| expr.strip_prefix("not ")) {
            return Condition::parse(rest).map(|c| Condition::Not(Box::new(c)));
        }
        valid_key(expr).map(|k| Condition::Truthy(k.to_string()))
    }

    pub fn evaluate<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<Value>,
    {
        match self {
            Condition::Compare { key, op, value } => match lookup(key) {
                Some(actual) => compare(&actual, *op, value),
                None => false,
            },
            Condition::Exists(key) => lookup(key).is_some_and(|v| !v.is_null()),
            Condition::Truthy(key) => lookup(key).is_some_and(|v| truthy(&v)),
            Condition::Not(inner) => !inner.evaluate(lookup),
            Condition::All(parts) => parts.iter().all(|c| c.evaluate(lookup)),
            Condition::Any(parts) => parts.iter().any(|c| c.evaluate(lookup)),
        }
    }
}

/// Parse and evaluate in one step. Unparseable expressions are false.
pub fn evaluate_condition<F>(expr: &str, lookup: F) -> bool
where
    F: Fn(&str) -> Option<Value>,
{
    Condition::parse(expr).is_some_and(|c| c.evaluate(&lookup))
}

/// Find the leftmost operator outside quotes and split `key OP value`.
fn parse_operator(expr: &str) -> Option<(&str, Op, &str)> {
    let mut best: Option<(usize, &str, Op)> = None;
    for &(token, op) in OPERATORS {
        if let Some(pos) = find_outside_quotes(expr, token) {
            if best.map_or(true, |(p, t, _)| pos < p || (pos == p && token.len() > t.len())) {
                best = Some((pos, token, op));
            }
        }
    }
    let (pos, token, op) = best?;
    let key = valid_key(expr[..pos].trim())?;
    let value = expr[pos + token.len()..].trim();
    if value.is_empty() {
        return None;
    }
    Some((key, op, value))
}

fn valid_key(key: &str) -> Option<&str> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'));
    ok.then_some(key)
}

fn parse_literal(raw: &str) -> Literal {
    let raw = raw.trim();
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Literal::Str(raw[1..raw.len() - 1].to_string());
        }
    }
    match raw {
        "true" => Literal::Bool(true),
        "false" => Literal::Bool(false),
        "null" => Literal::Null,
        _ => raw
            .parse::<f64>()
            .map(Literal::Num)
            .unwrap_or_else(|_| Literal::Str(raw.to_string())),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(a) => Some(a.len() as f64),
        _ => None,
    }
}

fn compare(actual: &Value, op: Op, expected: &Literal) -> bool {
    match op {
        Op::Eq => equals(actual, expected),
        Op::Ne => !equals(actual, expected),
        Op::Contains => {
            let needle = literal_text(expected);
            match actual {
                Value::Array(items) => items.iter().any(|v| display_value(v) == needle),
                other => display_value(other).contains(&needle),
            }
        }
        Op::Lt | Op::Gt | Op::Le | Op::Ge => {
            let (Some(a), Literal::Num(b)) = (as_number(actual), expected) else {
                return false;
            };
            match op {
                Op::Lt => a < *b,
                Op::Gt => a > *b,
                Op::Le => a <= *b,
                _ => a >= *b,
            }
        }
    }
}

fn equals(actual: &Value, expected: &Literal) -> bool {
    match expected {
        Literal::Null => actual.is_null(),
        Literal::Bool(b) => actual.as_bool() == Some(*b) || display_value(actual) == b.to_string(),
        Literal::Num(n) => as_number(actual).is_some_and(|a| a == *n),
        Literal::Str(s) => display_value(actual) == *s,
    }
}

fn literal_text(lit: &Literal) -> String {
    match lit {
        Literal::Str(s) => s.clone(),
        Literal::Num(n) => n.to_string(),
        Literal::Bool(b) => b.to_string(),
        Literal::Null => String::new(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn find_outside_quotes(text: &str, token: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if text[i..].starts_with(token) => return Some(i),
            None => {}
        }
    }
    None
}

fn split_outside_quotes<'a>(text: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some(pos) = find_outside_quotes(rest, sep) {
        parts.push(&rest[..pos]);
        rest = &rest[pos + sep.len()..];
    }
    parts.push(rest);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn ctx(pairs: &[(&str, Value)]) -> impl Fn(&str) -> Option<Value> {
        let map: HashMap<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn test_condition_equals() {
        let c = ctx(&[("status", json!("success"))]);
        assert!(evaluate_condition(r#"status == "success""#, &c));
        assert!(!evaluate_condition(r#"status == "failure""#, &c));
        assert!(evaluate_condition(r#"status != "failure""#, &c));
    }

    #[test]
    fn test_condition_contains() {
        let c = ctx(&[
            ("output", json!("The file was created successfully.")),
            ("tags", json!(["a", "b"])),
        ]);
        assert!(evaluate_condition(r#"output contains "created""#, &c));
        assert!(!evaluate_condition(r#"output contains "deleted""#, &c));
        assert!(evaluate_condition(r#"tags contains "b""#, &c));
    }

    #[test]
    fn numeric_comparisons() {
        let c = ctx(&[("score", json!(7)), ("count", json!("3"))]);
        assert!(evaluate_condition("score > 5", &c));
        assert!(evaluate_condition("score >= 7", &c));
        assert!(!evaluate_condition("score < 7", &c));
        assert!(evaluate_condition("count <= 3", &c));
        assert!(evaluate_condition("score == 7", &c));
        assert!(!evaluate_condition(r#"score > "high""#, &c));
    }

    #[test]
    fn exists_and_truthiness() {
        let c = ctx(&[("flag", json!(true)), ("empty", json!("")), ("nil", Value::Null)]);
        assert!(evaluate_condition("exists flag", &c));
        assert!(evaluate_condition("flag exists", &c));
        assert!(!evaluate_condition("exists nil", &c));
        assert!(evaluate_condition("flag", &c));
        assert!(!evaluate_condition("empty", &c));
        assert!(evaluate_condition("!empty", &c));
    }

    #[test]
    fn conjunction_and_disjunction() {
        let c = ctx(&[("a", json!(1)), ("b", json!(0))]);
        assert!(evaluate_condition("a == 1 && b == 0", &c));
        assert!(!evaluate_condition("a == 1 && b == 1", &c));
        assert!(evaluate_condition("a == 2 || b == 0", &c));
    }

    #[test]
    fn operators_inside_quotes_are_literal() {
        let c = ctx(&[("op", json!("a<b"))]);
        assert!(evaluate_condition(r#"op == "a<b""#, &c));
    }

    #[test]
    fn test_condition_missing_key() {
        let c = ctx(&[]);
        assert!(!evaluate_condition(r#"missing == "value""#, &c));
        assert!(!evaluate_condition(r#"missing != "value""#, &c));
    }

    #[test]
    fn test_condition_invalid_expr() {
        assert!(Condition::parse("this is not valid").is_none());
        assert!(Condition::parse("== 3").is_none());
        assert!(Condition::parse("").is_none());
        assert!(!evaluate_condition("this is not valid", ctx(&[])));
    }
}
