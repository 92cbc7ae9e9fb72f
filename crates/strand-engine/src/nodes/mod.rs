//! Node executors: one per [`NodeType`], dispatched through [`ExecutorRegistry`].
//!
//! Each node's raw JSON config is resolved into a [`NodeKind`] once, during
//! planning. Executors mutate the run [`Context`] in place and touch only the
//! fields their kind declares in [`NodeKind::writes`].

pub mod conditional;
pub mod config;
pub mod delay;
pub mod error_handler;
pub mod loop_node;
pub mod memory;
pub mod model;
pub mod passthrough;
pub mod retrieval;
pub mod tool;
pub mod variable;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use strand_core::error::{Result, StrandError};
use strand_core::graph::{Node, NodeType};
use strand_core::template::placeholders;

use crate::context::{Context, ContextField};
use crate::env::RunEnv;
use crate::expr::Condition;
use config::*;

/// A node with its config resolved.
#[derive(Debug, Clone)]
pub struct PlannedNode {
    pub id: String,
    pub kind: NodeKind,
}

/// Typed node configuration, one variant per [`NodeType`].
#[derive(Debug, Clone)]
pub enum NodeKind {
    Start,
    End,
    Model(ModelConfig),
    Tool(ToolConfig),
    Retrieval(RetrievalConfig),
    Conditional {
        config: ConditionalConfig,
        predicate: Condition,
    },
    Loop {
        config: LoopConfig,
        predicate: Option<Condition>,
    },
    Memory(MemoryConfig),
    Variable(VariableConfig),
    Delay(DelayConfig),
    ErrorHandler(ErrorHandlerConfig),
}

impl NodeKind {
    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(match node.node_type {
            NodeType::Start => NodeKind::Start,
            NodeType::End => NodeKind::End,
            NodeType::Model => NodeKind::Model(parse(node)?),
            NodeType::Tool => NodeKind::Tool(parse(node)?),
            NodeType::Retrieval => NodeKind::Retrieval(parse(node)?),
            NodeType::Conditional => {
                let config: ConditionalConfig = parse_required(node)?;
                let predicate = parse_predicate(node, &config.condition)?;
                NodeKind::Conditional { config, predicate }
            }
            NodeType::Loop => {
                let config: LoopConfig = parse_required(node)?;
                if config.max_iterations == 0 {
                    return Err(StrandError::GraphInvalid(format!(
                        "loop '{}' needs max_iterations of at least 1",
                        node.id
                    )));
                }
                let predicate = config
                    .condition
                    .as_deref()
                    .map(|c| parse_predicate(node, c))
                    .transpose()?;
                NodeKind::Loop { config, predicate }
            }
            NodeType::Memory => NodeKind::Memory(parse(node)?),
            NodeType::Variable => NodeKind::Variable(parse(node)?),
            NodeType::Delay => NodeKind::Delay(parse(node)?),
            NodeType::ErrorHandler => NodeKind::ErrorHandler(parse(node)?),
        })
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Start => NodeType::Start,
            NodeKind::End => NodeType::End,
            NodeKind::Model(_) => NodeType::Model,
            NodeKind::Tool(_) => NodeType::Tool,
            NodeKind::Retrieval(_) => NodeType::Retrieval,
            NodeKind::Conditional { .. } => NodeType::Conditional,
            NodeKind::Loop { .. } => NodeType::Loop,
            NodeKind::Memory(_) => NodeType::Memory,
            NodeKind::Variable(_) => NodeType::Variable,
            NodeKind::Delay(_) => NodeType::Delay,
            NodeKind::ErrorHandler(_) => NodeType::ErrorHandler,
        }
    }

    /// Context fields this node may read.
    pub fn reads(&self) -> Vec<ContextField> {
        use ContextField as F;
        match self {
            NodeKind::Start | NodeKind::End | NodeKind::Delay(_) => vec![],
            NodeKind::Model(_) => vec![F::Messages, F::RetrievalContext, F::Summary, F::Variables],
            NodeKind::Tool(_) => vec![F::Messages, F::Variables, F::ToolCalls],
            NodeKind::Retrieval(_) => vec![F::Messages, F::Variables],
            NodeKind::Conditional { .. } => vec![F::Variables, F::Messages, F::ToolCalls],
            NodeKind::Loop { .. } => vec![F::Variables, F::LoopCounters],
            NodeKind::Memory(_) => vec![F::Messages, F::Summary],
            NodeKind::Variable(cfg) => {
                let mut reads: Vec<ContextField> = cfg
                    .copy
                    .values()
                    .filter_map(|v| v.as_str())
                    .map(|s| F::Variable(s.split('.').next().unwrap_or(s).to_string()))
                    .collect();
                let templated = cfg
                    .set
                    .values()
                    .filter_map(|v| v.as_str())
                    .any(|s| !placeholders(s).is_empty());
                if templated {
                    reads.extend([F::Variables, F::Messages]);
                }
                if cfg.capture.is_some() {
                    reads.push(F::Messages);
                }
                reads
            }
            NodeKind::ErrorHandler(_) => vec![F::ErrorState],
        }
    }

    /// Context fields this node may write. Usage totals and the trace are
    /// accumulators and are merged separately.
    pub fn writes(&self) -> Vec<ContextField> {
        use ContextField as F;
        let out_var = |v: &Option<String>| v.iter().map(|n| F::Variable(n.clone())).collect::<Vec<_>>();
        match self {
            NodeKind::Start | NodeKind::End | NodeKind::Delay(_) => vec![],
            NodeKind::Model(cfg) => [vec![F::Messages], out_var(&cfg.output_var)].concat(),
            NodeKind::Tool(cfg) => {
                [vec![F::Messages, F::ToolCalls], out_var(&cfg.output_var)].concat()
            }
            NodeKind::Retrieval(cfg) => {
                [vec![F::RetrievalContext], out_var(&cfg.output_var)].concat()
            }
            NodeKind::Conditional { .. } => vec![F::ConditionalResults],
            NodeKind::Loop { .. } => vec![F::LoopCounters, F::ConditionalResults],
            NodeKind::Memory(_) => vec![F::Messages, F::Summary],
            NodeKind::Variable(cfg) => cfg
                .set
                .keys()
                .chain(cfg.copy.keys())
                .chain(cfg.capture.iter())
                .chain(cfg.unset.iter())
                .map(|k| F::Variable(k.clone()))
                .collect(),
            NodeKind::ErrorHandler(cfg) => vec![
                F::Messages,
                F::ErrorState,
                F::Variable(cfg.variable.clone()),
            ],
        }
    }

    /// Whether two nodes can run concurrently on clones of one context.
    pub fn independent_of(&self, other: &NodeKind) -> bool {
        let (a_reads, a_writes) = (self.reads(), self.writes());
        let (b_reads, b_writes) = (other.reads(), other.writes());
        let clash = |writes: &[ContextField], touched: &[ContextField]| {
            writes
                .iter()
                .any(|w| touched.iter().any(|t| w.conflicts_with(t)))
        };
        !clash(&a_writes, &b_reads)
            && !clash(&a_writes, &b_writes)
            && !clash(&b_writes, &a_reads)
    }
}

fn parse_predicate(node: &Node, expr: &str) -> Result<Condition> {
    Condition::parse(expr).ok_or_else(|| {
        StrandError::GraphInvalid(format!(
            "node '{}' has an unparseable condition: {}",
            node.id, expr
        ))
    })
}

/// Runs one node type against the run context.
pub trait NodeExecutor: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        node: &'a PlannedNode,
        ctx: &'a mut Context,
        env: &'a RunEnv,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Executors keyed by node type.
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// A registry with the built-in executor for every node type.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(NodeType::Start, Arc::new(passthrough::PassthroughExecutor));
        registry.register(NodeType::End, Arc::new(passthrough::PassthroughExecutor));
        registry.register(NodeType::Model, Arc::new(model::ModelExecutor));
        registry.register(NodeType::Tool, Arc::new(tool::ToolExecutor));
        registry.register(NodeType::Retrieval, Arc::new(retrieval::RetrievalExecutor));
        registry.register(NodeType::Conditional, Arc::new(conditional::ConditionalExecutor));
        registry.register(NodeType::Loop, Arc::new(loop_node::LoopExecutor));
        registry.register(NodeType::Memory, Arc::new(memory::MemoryExecutor));
        registry.register(NodeType::Variable, Arc::new(variable::VariableExecutor));
        registry.register(NodeType::Delay, Arc::new(delay::DelayExecutor));
        registry.register(
            NodeType::ErrorHandler,
            Arc::new(error_handler::ErrorHandlerExecutor),
        );
        registry
    }

    /// Register an executor, replacing the one for `node_type`.
    pub fn register(&mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(node_type, executor);
    }

    pub fn with(mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) -> Self {
        self.register(node_type, executor);
        self
    }

    pub fn get(&self, node_type: NodeType) -> Result<&Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).ok_or_else(|| {
            StrandError::Internal(format!("no executor registered for {} nodes", node_type))
        })
    }

    pub fn supports(&self, node_type: NodeType) -> bool {
        self.executors.contains_key(&node_type)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Error for an executor handed a node of another kind.
pub(crate) fn kind_mismatch(node: &PlannedNode, expected: NodeType) -> StrandError {
    StrandError::Internal(format!(
        "node '{}' is a {} node, not {}",
        node.id,
        node.kind.node_type(),
        expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kind(node_type: NodeType, config: serde_json::Value) -> NodeKind {
        NodeKind::from_node(&Node::new("n", node_type, config)).unwrap()
    }

    #[test]
    fn variable_writers_on_distinct_names_are_independent() {
        let left = kind(NodeType::Variable, json!({"set": {"left": "L"}}));
        let right = kind(NodeType::Variable, json!({"set": {"right": "R"}}));
        assert!(left.independent_of(&right));

        let also_left = kind(NodeType::Variable, json!({"set": {"left": "X"}}));
        assert!(!left.independent_of(&also_left));
    }

    #[test]
    fn model_depends_on_retrieval() {
        let model = kind(NodeType::Model, json!({}));
        let retrieval = kind(NodeType::Retrieval, json!({}));
        assert!(!model.independent_of(&retrieval));
        assert!(!model.independent_of(&model));
    }

    #[test]
    fn templated_variable_reads_all_variables() {
        let reader = kind(NodeType::Variable, json!({"set": {"greeting": "hi {{name}}"}}));
        let writer = kind(NodeType::Variable, json!({"set": {"name": "ada"}}));
        assert!(!reader.independent_of(&writer));
    }

    #[test]
    fn bad_conditions_fail_planning() {
        let err = NodeKind::from_node(&Node::new(
            "c",
            NodeType::Conditional,
            json!({"condition": "== nothing"}),
        ))
        .unwrap_err();
        assert!(matches!(err, StrandError::GraphInvalid(_)));

        let err = NodeKind::from_node(&Node::new(
            "l",
            NodeType::Loop,
            json!({"body": "b", "max_iterations": 0}),
        ))
        .unwrap_err();
        assert!(matches!(err, StrandError::GraphInvalid(_)));
    }

    #[test]
    fn standard_registry_covers_every_type() {
        let registry = ExecutorRegistry::standard();
        for t in [
            NodeType::Start,
            NodeType::End,
            NodeType::Model,
            NodeType::Tool,
            NodeType::Retrieval,
            NodeType::Conditional,
            NodeType::Loop,
            NodeType::Memory,
            NodeType::Variable,
            NodeType::Delay,
            NodeType::ErrorHandler,
        ] {
            assert!(registry.supports(t), "missing {}", t);
        }
    }
}
