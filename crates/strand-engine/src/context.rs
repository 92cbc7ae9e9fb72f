use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use strand_core::error::ErrorKind;
use strand_core::graph::NodeType;
use strand_core::template::{display_value, render};
use strand_core::types::{ChatMessage, Role, ToolUseRequest, Usage, UsageTotals};

const EMPTY_USAGE: UsageTotals = UsageTotals {
    input_tokens: 0,
    output_tokens: 0,
    cost: 0.0,
    model_calls: 0,
};

const DEFAULT_TRACE_CAPACITY: usize = 256;

/// An upstream failure captured for an error-handler node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorState {
    pub node_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Completed,
    Failed,
    /// Not on a traversed path.
    Skipped,
    /// Feature flag off for this node type.
    Disabled,
}

/// One node execution in the run trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub node_id: String,
    pub node_type: NodeType,
    pub status: TraceStatus,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Rarely used state, allocated on first write.
#[derive(Debug, Clone, Default)]
struct ContextExtras {
    variables: Map<String, Value>,
    loop_counters: HashMap<String, u32>,
    conditional_results: HashMap<String, bool>,
    error_state: Option<ErrorState>,
    trace: VecDeque<TraceEntry>,
    /// Entries ever recorded, including those evicted from `trace`.
    trace_recorded: u64,
    usage: UsageTotals,
}

/// A slice of [`Context`] a node executor reads or writes.
///
/// The bounded-parallel strategy only runs nodes concurrently when their
/// declared field sets do not overlap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextField {
    Messages,
    RetrievalContext,
    Summary,
    ToolCalls,
    Metadata,
    /// Every variable (e.g. prompt rendering).
    Variables,
    Variable(String),
    LoopCounters,
    ConditionalResults,
    ErrorState,
}

impl ContextField {
    pub fn conflicts_with(&self, other: &ContextField) -> bool {
        match (self, other) {
            (Self::Variables, Self::Variable(_)) | (Self::Variable(_), Self::Variables) => true,
            (Self::Variable(a), Self::Variable(b)) => same_name(a, b),
            (a, b) => a == b,
        }
    }
}

/// The mutable state of one run.
///
/// Exclusively owned by the executing strategy. Message history, identity and
/// metadata are always present; retrieval context, summary and the tool-call
/// counter appear once a node writes them; variables, loop counters,
/// conditional results, error state, the trace and usage totals live in a
/// lazily allocated side structure.
#[derive(Debug, Clone)]
pub struct Context {
    pub messages: Vec<ChatMessage>,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub retrieval_context: Option<String>,
    pub summary: Option<String>,
    pub tool_calls: u32,
    /// Index of the first message produced by this run.
    turn_start: usize,
    trace_capacity: usize,
    extras: Option<Box<ContextExtras>>,
}

impl Context {
    pub fn new(user_id: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            messages: Vec::new(),
            user_id: user_id.into(),
            conversation_id,
            metadata: Map::new(),
            retrieval_context: None,
            summary: None,
            tool_calls: 0,
            turn_start: 0,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            extras: None,
        }
    }

    /// Seed the history the run starts from. Anything appended later counts
    /// as the run's own output.
    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.turn_start = messages.len();
        self.messages = messages;
        self
    }

    pub fn with_trace_capacity(mut self, capacity: usize) -> Self {
        self.trace_capacity = capacity.max(1);
        self
    }

    /// Whether any rarely-used state has been written.
    pub fn has_extras(&self) -> bool {
        self.extras.is_some()
    }

    fn extras_mut(&mut self) -> &mut ContextExtras {
        self.extras.get_or_insert_with(Default::default)
    }

    // ── Variables ───────────────────────────────────────────────

    /// Look up a variable, accepting either snake_case or camelCase spelling.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        let vars = &self.extras.as_ref()?.variables;
        vars.get(name)
            .or_else(|| vars.get(&to_camel(name)))
            .or_else(|| vars.get(&to_snake(name)))
    }

    /// Set a variable. An existing entry under the other spelling is replaced.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let vars = &mut self.extras_mut().variables;
        let key = [to_camel(&name), to_snake(&name)]
            .into_iter()
            .find(|k| *k != name && vars.contains_key(k))
            .unwrap_or(name);
        vars.insert(key, value);
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Value> {
        let vars = &mut self.extras.as_mut()?.variables;
        vars.remove(name)
            .or_else(|| vars.remove(&to_camel(name)))
            .or_else(|| vars.remove(&to_snake(name)))
    }

    pub fn variables(&self) -> Map<String, Value> {
        self.extras
            .as_ref()
            .map(|e| e.variables.clone())
            .unwrap_or_default()
    }

    // ── Loop counters and conditional results ───────────────────

    pub fn loop_counter(&self, node_id: &str) -> u32 {
        self.extras
            .as_ref()
            .and_then(|e| e.loop_counters.get(node_id).copied())
            .unwrap_or(0)
    }

    pub fn set_loop_counter(&mut self, node_id: &str, value: u32) {
        self.extras_mut()
            .loop_counters
            .insert(node_id.to_string(), value);
    }

    pub fn conditional_result(&self, node_id: &str) -> Option<bool> {
        self.extras
            .as_ref()
            .and_then(|e| e.conditional_results.get(node_id).copied())
    }

    pub fn set_conditional_result(&mut self, node_id: &str, value: bool) {
        self.extras_mut()
            .conditional_results
            .insert(node_id.to_string(), value);
    }

    // ── Error state ─────────────────────────────────────────────

    pub fn error_state(&self) -> Option<&ErrorState> {
        self.extras.as_ref()?.error_state.as_ref()
    }

    pub fn set_error_state(&mut self, state: ErrorState) {
        self.extras_mut().error_state = Some(state);
    }

    pub fn take_error_state(&mut self) -> Option<ErrorState> {
        self.extras.as_mut()?.error_state.take()
    }

    // ── Trace ───────────────────────────────────────────────────

    /// Append a trace entry, evicting the oldest once capacity is reached.
    pub fn record_trace(&mut self, entry: TraceEntry) {
        let capacity = self.trace_capacity;
        let extras = self.extras_mut();
        if extras.trace.len() >= capacity {
            extras.trace.pop_front();
        }
        extras.trace.push_back(entry);
        extras.trace_recorded += 1;
    }

    pub fn trace(&self) -> Vec<TraceEntry> {
        self.extras
            .as_ref()
            .map(|e| e.trace.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn trace_recorded(&self) -> u64 {
        self.extras.as_ref().map_or(0, |e| e.trace_recorded)
    }

    // ── Usage ───────────────────────────────────────────────────

    pub fn usage(&self) -> &UsageTotals {
        self.extras.as_ref().map_or(&EMPTY_USAGE, |e| &e.usage)
    }

    pub fn record_usage(&mut self, usage: &Usage) {
        self.extras_mut().usage.record(usage);
    }

    pub fn absorb_usage(&mut self, totals: &UsageTotals) {
        if *totals != EMPTY_USAGE {
            self.extras_mut().usage.absorb(totals);
        }
    }

    pub fn reset_usage(&mut self) {
        if let Some(extras) = self.extras.as_mut() {
            extras.usage = UsageTotals::default();
        }
    }

    // ── History helpers ─────────────────────────────────────────

    pub fn last_text(&self, role: Role) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == role)
            .map(|m| m.text())
    }

    /// Final assistant reply, if the run produced one.
    pub fn response(&self) -> Option<String> {
        self.last_text(Role::Assistant)
    }

    pub fn turn_start(&self) -> usize {
        self.turn_start
    }

    /// Last non-empty assistant text appended since the run started.
    pub fn produced_reply(&self) -> Option<String> {
        self.messages
            .iter()
            .skip(self.turn_start)
            .rev()
            .find(|m| m.role == Role::Assistant && !m.text().is_empty())
            .map(|m| m.text())
    }

    /// Replace the first `split` messages with `summary`. The turn boundary
    /// moves with the kept tail; if the run's own output was compacted it
    /// lands right after the summary.
    pub fn compact_history(&mut self, split: usize, summary: ChatMessage) {
        let split = split.min(self.messages.len());
        let tail = self.messages.split_off(split);
        self.messages = Vec::with_capacity(tail.len() + 1);
        self.messages.push(summary);
        self.messages.extend(tail);
        self.turn_start = self.turn_start.saturating_sub(split) + 1;
    }

    /// Tool uses requested by the last assistant message that have no result yet.
    pub fn pending_tool_uses(&self) -> Vec<ToolUseRequest> {
        let Some(pos) = self.messages.iter().rposition(|m| m.role == Role::Assistant) else {
            return Vec::new();
        };
        let answered: Vec<&str> = self.messages[pos + 1..]
            .iter()
            .flat_map(|m| m.tool_result_ids())
            .collect();
        self.messages[pos]
            .tool_uses()
            .into_iter()
            .filter(|(id, _, _)| !answered.contains(id))
            .map(|(id, name, input)| ToolUseRequest {
                id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            })
            .collect()
    }

    // ── Lookups for expressions and prompt rendering ────────────

    /// Resolve a dotted key: variables first, then built-in run fields.
    ///
    /// Built-ins: `input`, `last_response`, `tool_calls`, `retrieval_context`,
    /// `summary`, `error`, `user_id`, `conversation_id`, `metadata.<key>` and
    /// `loop.<node_id>`.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        let (head, rest) = match key.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (key, None),
        };

        if let Some(v) = self.variable(head) {
            return match rest {
                Some(path) => walk_path(v, path).cloned(),
                None => Some(v.clone()),
            };
        }

        match (to_snake(head).as_str(), rest) {
            ("vars" | "variables", Some(path)) => self.lookup(path),
            ("metadata", Some(path)) => {
                let (k, sub) = path.split_once('.').unwrap_or((path, ""));
                let v = self.metadata.get(k)?;
                walk_path(v, sub).cloned()
            }
            ("loop", Some(node_id)) => Some(Value::from(self.loop_counter(node_id))),
            ("input" | "last_user_message", None) => self.last_text(Role::User).map(Value::String),
            ("last_response" | "response", None) => {
                self.last_text(Role::Assistant).map(Value::String)
            }
            ("tool_calls", None) => Some(Value::from(self.tool_calls)),
            ("retrieval_context", None) => self.retrieval_context.clone().map(Value::String),
            ("summary", None) => self.summary.clone().map(Value::String),
            ("error", None) => self.error_state().map(|e| Value::String(e.message.clone())),
            ("user_id", None) => Some(Value::String(self.user_id.clone())),
            ("conversation_id", None) => self.conversation_id.clone().map(Value::String),
            _ => None,
        }
    }

    /// Render `{{key}}` placeholders against [`Context::lookup`].
    pub fn render(&self, text: &str) -> String {
        render(text, |key| self.lookup(key).map(|v| display_value(&v)))
    }

    // ── Field transfer for parallel joins ───────────────────────

    /// Copy `field` from a branch context into `self`.
    pub fn copy_field(&mut self, from: &Context, field: &ContextField) {
        match field {
            ContextField::Messages => {
                self.messages = from.messages.clone();
                self.turn_start = from.turn_start;
            }
            ContextField::RetrievalContext => {
                self.retrieval_context = from.retrieval_context.clone()
            }
            ContextField::Summary => self.summary = from.summary.clone(),
            ContextField::ToolCalls => self.tool_calls = from.tool_calls,
            ContextField::Metadata => self.metadata = from.metadata.clone(),
            ContextField::Variables => {
                if let Some(e) = from.extras.as_ref() {
                    self.extras_mut().variables = e.variables.clone();
                }
            }
            ContextField::Variable(name) => match from.variable(name) {
                Some(v) => self.set_variable(name.clone(), v.clone()),
                None => {
                    self.remove_variable(name);
                }
            },
            ContextField::LoopCounters => {
                if let Some(e) = from.extras.as_ref() {
                    self.extras_mut().loop_counters = e.loop_counters.clone();
                }
            }
            ContextField::ConditionalResults => {
                if let Some(e) = from.extras.as_ref() {
                    self.extras_mut().conditional_results = e.conditional_results.clone();
                }
            }
            ContextField::ErrorState => {
                let state = from.error_state().cloned();
                match state {
                    Some(s) => self.set_error_state(s),
                    None => {
                        self.take_error_state();
                    }
                }
            }
        }
    }

    /// Absorb the usage and trace entries `branch` accumulated since `base`.
    pub fn absorb_branch(&mut self, base: &Context, branch: &Context) {
        self.absorb_usage(&branch.usage().since(base.usage()));
        let added = branch.trace_recorded().saturating_sub(base.trace_recorded()) as usize;
        if added > 0 {
            let trace = branch.trace();
            let skip = trace.len().saturating_sub(added);
            for entry in trace.into_iter().skip(skip) {
                self.record_trace(entry);
            }
        }
    }
}

fn walk_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match segment.parse::<usize>() {
            Ok(idx) if current.is_array() => current.get(idx)?,
            _ => current.get(segment)?,
        };
    }
    Some(current)
}

fn same_name(a: &str, b: &str) -> bool {
    a == b || to_snake(a) == to_snake(b)
}

/// `user_name` -> `userName`
pub fn to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// `userName` -> `user_name`
pub fn to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
