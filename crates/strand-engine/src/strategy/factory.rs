use std::sync::Arc;

use tracing::debug;

use strand_core::config::StrategyKind;
use strand_core::graph::NodeType;

use super::{DagStrategy, ExecutionStrategy, ParallelStrategy, SequentialStrategy};
use crate::plan::Plan;

/// Picks the strategy for a plan.
#[derive(Clone)]
pub struct StrategyFactory {
    default: StrategyKind,
    sequential: Arc<dyn ExecutionStrategy>,
    dag: Arc<dyn ExecutionStrategy>,
    parallel: Arc<dyn ExecutionStrategy>,
}

impl StrategyFactory {
    pub fn new(default: StrategyKind) -> Self {
        Self {
            default,
            sequential: Arc::new(SequentialStrategy),
            dag: Arc::new(DagStrategy),
            parallel: Arc::new(ParallelStrategy),
        }
    }

    /// `requested` wins over the configured default. `Auto` picks by shape:
    /// loops or branching use the graph walk, plain tool-free graphs with
    /// independent nodes run in parallel, everything else runs sequentially.
    pub fn select(&self, requested: Option<StrategyKind>, plan: &Plan) -> Arc<dyn ExecutionStrategy> {
        let kind = match requested.unwrap_or(self.default) {
            StrategyKind::Auto => auto_kind(plan),
            forced => forced,
        };
        debug!(strategy = ?kind, "Selected execution strategy");
        match kind {
            StrategyKind::Graph => self.dag.clone(),
            StrategyKind::Parallel => self.parallel.clone(),
            StrategyKind::Sequential | StrategyKind::Auto => self.sequential.clone(),
        }
    }
}

impl Default for StrategyFactory {
    fn default() -> Self {
        Self::new(StrategyKind::Auto)
    }
}

fn auto_kind(plan: &Plan) -> StrategyKind {
    if plan.has_loops() || plan.has_conditional_routing() {
        return StrategyKind::Graph;
    }
    let fans_out = plan.levels().iter().any(|level| {
        level.len() > 1
            && level.iter().enumerate().all(|(i, &a)| {
                level[i + 1..]
                    .iter()
                    .all(|&b| plan.node(a).kind.independent_of(&plan.node(b).kind))
            })
    });
    if fans_out && !plan.has_type(NodeType::Tool) {
        StrategyKind::Parallel
    } else {
        StrategyKind::Sequential
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::graph::{Edge, Graph, Node};
    use strand_test_utils::{fan_out_graph, plain_graph, tool_graph};

    fn kind_for(graph: Graph, requested: Option<StrategyKind>) -> StrategyKind {
        let plan = Plan::build(&graph).unwrap();
        StrategyFactory::default().select(requested, &plan).kind()
    }

    #[test]
    fn auto_selection_by_shape() {
        assert_eq!(kind_for(plain_graph(), None), StrategyKind::Sequential);
        assert_eq!(kind_for(tool_graph(), None), StrategyKind::Sequential);
        assert_eq!(kind_for(fan_out_graph(), None), StrategyKind::Parallel);

        let looping = Graph::new(
            vec![
                Node::start("start"),
                Node::new("repeat", NodeType::Loop, json!({"body": "work", "max_iterations": 2})),
                Node::new("work", NodeType::Delay, json!({"ms": 0})),
            ],
            vec![Edge::always("start", "repeat"), Edge::always("work", "repeat")],
        );
        assert_eq!(kind_for(looping, None), StrategyKind::Graph);
    }

    #[test]
    fn request_overrides_default() {
        assert_eq!(
            kind_for(fan_out_graph(), Some(StrategyKind::Sequential)),
            StrategyKind::Sequential
        );
        let plan = Plan::build(&plain_graph()).unwrap();
        let forced = StrategyFactory::new(StrategyKind::Graph).select(None, &plan);
        assert_eq!(forced.kind(), StrategyKind::Graph);
    }
}
