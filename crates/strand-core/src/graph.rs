//! Declarative workflow model: nodes, edges, sources, definitions and templates.
//!
//! Nodes carry their configuration as raw JSON. The engine resolves each
//! node into a typed executor config once, during preparation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StrandError};
use crate::template::render_value;

/// The closed set of node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Model,
    Tool,
    Retrieval,
    Conditional,
    Loop,
    Memory,
    Variable,
    Delay,
    #[serde(alias = "error-handler", alias = "errorHandler")]
    ErrorHandler,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Model => "model",
            Self::Tool => "tool",
            Self::Retrieval => "retrieval",
            Self::Conditional => "conditional",
            Self::Loop => "loop",
            Self::Memory => "memory",
            Self::Variable => "variable",
            Self::Delay => "delay",
            Self::ErrorHandler => "error_handler",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type,
            config,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::Start, Value::Null)
    }
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    Always,
    /// Traverse only if the source node succeeded.
    OnSuccess,
    /// Traverse only if the source node failed.
    OnFailure,
    /// Traverse if the source conditional node evaluated to true.
    IfTrue,
    /// Traverse if the source conditional node evaluated to false.
    IfFalse,
    /// Traverse if an expression holds against the run context.
    Expr { expr: String },
}

/// An edge connecting two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(alias = "sourceId", alias = "source_id", alias = "from")]
    pub source: String,
    #[serde(alias = "targetId", alias = "target_id", alias = "to")]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    pub fn when(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: Some(condition),
        }
    }

    pub fn on_failure(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::when(source, target, EdgeCondition::OnFailure)
    }

    pub fn if_true(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::when(source, target, EdgeCondition::IfTrue)
    }

    pub fn if_false(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::when(source, target, EdgeCondition::IfFalse)
    }

    pub fn expr(
        source: impl Into<String>,
        target: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self::when(source, target, EdgeCondition::Expr { expr: expr.into() })
    }

    /// Whether traversal depends on anything other than the source succeeding.
    pub fn is_conditional(&self) -> bool {
        !matches!(
            self.condition,
            None | Some(EdgeCondition::Always) | Some(EdgeCondition::OnSuccess)
        )
    }
}

/// Ordered nodes and edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Which workflow a run originates from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// A reusable template instantiated with parameter overrides.
    Template {
        id: String,
        #[serde(default, alias = "paramOverrides")]
        param_overrides: Map<String, Value>,
    },
    /// A persisted workflow definition.
    Definition { id: String },
    /// An ad-hoc graph supplied by the caller.
    Dynamic {
        nodes: Vec<Node>,
        #[serde(default)]
        edges: Vec<Edge>,
        /// Graph-level settings, seeded into the run's variables.
        #[serde(default)]
        config: Map<String, Value>,
    },
}

impl Source {
    pub fn template_id(&self) -> Option<&str> {
        match self {
            Self::Template { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn definition_id(&self) -> Option<&str> {
        match self {
            Self::Definition { id } => Some(id),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Template { .. } => "template",
            Self::Definition { .. } => "definition",
            Self::Dynamic { .. } => "dynamic",
        }
    }
}

/// A persisted workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub graph: Graph,
}

/// A reusable workflow template with parameter defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Graph whose node configs may contain `{{param}}` placeholders.
    pub graph: Graph,
    #[serde(default)]
    pub defaults: Map<String, Value>,
    /// Parameters that must have a non-null value after merging.
    #[serde(default)]
    pub required: Vec<String>,
}

/// A template rendered with concrete parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateInstance {
    pub graph: Graph,
    pub params: Map<String, Value>,
}

impl WorkflowTemplate {
    /// Merge `defaults ⊕ overrides` (overrides win) and render the graph.
    pub fn instantiate(&self, overrides: &Map<String, Value>) -> Result<TemplateInstance> {
        for key in overrides.keys() {
            if !self.defaults.contains_key(key) && !self.required.contains(key) {
                return Err(StrandError::TemplateParamsInvalid(format!(
                    "template '{}' has no parameter '{}'",
                    self.id, key
                )));
            }
        }

        let mut params = self.defaults.clone();
        for (k, v) in overrides {
            params.insert(k.clone(), v.clone());
        }

        for key in &self.required {
            if params.get(key).map_or(true, Value::is_null) {
                return Err(StrandError::TemplateParamsInvalid(format!(
                    "template '{}' requires parameter '{}'",
                    self.id, key
                )));
            }
        }

        let nodes = self
            .graph
            .nodes
            .iter()
            .map(|n| Node {
                id: n.id.clone(),
                node_type: n.node_type,
                config: render_value(&n.config, &params),
            })
            .collect();

        Ok(TemplateInstance {
            graph: Graph::new(nodes, self.graph.edges.clone()),
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> WorkflowTemplate {
        let mut defaults = Map::new();
        defaults.insert("tone".into(), json!("friendly"));
        defaults.insert("topic".into(), Value::Null);
        WorkflowTemplate {
            id: "greeter".into(),
            name: "Greeter".into(),
            graph: Graph::new(
                vec![
                    Node::start("start"),
                    Node::new(
                        "answer",
                        NodeType::Model,
                        json!({"system_prompt": "Be {{tone}} about {{topic}}."}),
                    ),
                ],
                vec![Edge::always("start", "answer")],
            ),
            defaults,
            required: vec!["topic".into()],
        }
    }

    #[test]
    fn test_instantiate_user_overrides_win() {
        let mut overrides = Map::new();
        overrides.insert("tone".into(), json!("terse"));
        overrides.insert("topic".into(), json!("Rust"));

        let inst = template().instantiate(&overrides).unwrap();
        assert_eq!(inst.params["tone"], json!("terse"));
        let node = inst.graph.node("answer").unwrap();
        assert_eq!(node.config["system_prompt"], json!("Be terse about Rust."));
    }

    #[test]
    fn test_instantiate_missing_required() {
        let err = template().instantiate(&Map::new()).unwrap_err();
        assert!(matches!(err, StrandError::TemplateParamsInvalid(_)));
    }

    #[test]
    fn test_instantiate_unknown_param() {
        let mut overrides = Map::new();
        overrides.insert("topic".into(), json!("Rust"));
        overrides.insert("colour".into(), json!("blue"));
        let err = template().instantiate(&overrides).unwrap_err();
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn test_edge_aliases_and_conditions() {
        let edge: Edge = serde_json::from_value(json!({
            "sourceId": "a",
            "targetId": "b",
            "condition": {"type": "expr", "expr": "status == \"ok\""}
        }))
        .unwrap();
        assert_eq!(edge.source, "a");
        assert_eq!(edge.target, "b");
        assert!(edge.is_conditional());
        assert!(!Edge::always("a", "b").is_conditional());
    }

    #[test]
    fn test_source_serialization() {
        let src: Source = serde_json::from_value(json!({
            "kind": "template",
            "id": "greeter",
            "paramOverrides": {"topic": "Rust"}
        }))
        .unwrap();
        assert_eq!(src.template_id(), Some("greeter"));
        assert_eq!(src.label(), "template");

        let node: Node =
            serde_json::from_value(json!({"id": "h", "type": "error-handler"})).unwrap();
        assert_eq!(node.node_type, NodeType::ErrorHandler);
        assert!(node.config.is_null());
    }
}
