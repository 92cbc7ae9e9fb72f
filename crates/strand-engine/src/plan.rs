//! Graph validation and execution planning.
//!
//! A [`Plan`] is built once per run during preparation. It resolves node
//! configs, finds the unique entry node, checks reachability, carves out loop
//! bodies and computes a deterministic topological order over the forward
//! graph (all edges except loop back edges).

use std::collections::{BTreeSet, HashMap, VecDeque};

use strand_core::error::{Result, StrandError};
use strand_core::graph::{EdgeCondition, Graph, NodeType};

use crate::expr::Condition;
use crate::nodes::{NodeKind, PlannedNode};

/// Resolved traversal rule of an edge.
#[derive(Debug, Clone)]
pub enum EdgeRule {
    Always,
    OnSuccess,
    OnFailure,
    IfTrue,
    IfFalse,
    Expr(Condition),
}

#[derive(Debug, Clone)]
pub struct PlanEdge {
    pub source: usize,
    pub target: usize,
    pub rule: EdgeRule,
    /// The edge from a loop node into its body entry. Only the loop walks it.
    pub body_link: bool,
}

/// The body of one loop node.
#[derive(Debug, Clone)]
pub struct LoopBody {
    pub entry: usize,
    /// Every node inside the body, nested loop bodies included.
    pub members: BTreeSet<usize>,
    /// Nodes owned directly by this loop, in topological order.
    pub order: Vec<usize>,
}

/// A validated, ordered graph ready to walk.
#[derive(Debug, Clone)]
pub struct Plan {
    nodes: Vec<PlannedNode>,
    index: HashMap<String, usize>,
    edges: Vec<PlanEdge>,
    /// Forward edge indices leaving each node.
    outgoing: Vec<Vec<usize>>,
    back_edges: usize,
    entry: usize,
    loops: HashMap<usize, LoopBody>,
    top_order: Vec<usize>,
    levels: Vec<Vec<usize>>,
}

impl Plan {
    pub fn build(graph: &Graph) -> Result<Plan> {
        if graph.nodes.is_empty() {
            return Err(invalid("graph has no nodes"));
        }

        let mut index = HashMap::with_capacity(graph.nodes.len());
        let mut nodes = Vec::with_capacity(graph.nodes.len());
        for (i, node) in graph.nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                return Err(invalid("node ids must not be empty"));
            }
            if index.insert(node.id.clone(), i).is_some() {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
            nodes.push(PlannedNode {
                id: node.id.clone(),
                kind: NodeKind::from_node(node)?,
            });
        }
        let n = nodes.len();

        let mut edges = Vec::with_capacity(graph.edges.len());
        for edge in &graph.edges {
            let lookup = |id: &str| {
                index.get(id).copied().ok_or_else(|| {
                    invalid(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, id
                    ))
                })
            };
            let source = lookup(&edge.source)?;
            let target = lookup(&edge.target)?;
            let rule = match &edge.condition {
                None | Some(EdgeCondition::Always) => EdgeRule::Always,
                Some(EdgeCondition::OnSuccess) => EdgeRule::OnSuccess,
                Some(EdgeCondition::OnFailure) => EdgeRule::OnFailure,
                Some(EdgeCondition::IfTrue) => EdgeRule::IfTrue,
                Some(EdgeCondition::IfFalse) => EdgeRule::IfFalse,
                Some(EdgeCondition::Expr { expr }) => {
                    EdgeRule::Expr(Condition::parse(expr).ok_or_else(|| {
                        invalid(format!(
                            "edge {} -> {} has an unparseable expression: {}",
                            edge.source, edge.target, expr
                        ))
                    })?)
                }
            };
            edges.push(PlanEdge {
                source,
                target,
                rule,
                body_link: false,
            });
        }

        // Every loop reaches its body entry through a body link, explicit or implied.
        let mut loop_entries = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            let NodeKind::Loop { config, .. } = &node.kind else {
                continue;
            };
            let body = *index.get(&config.body).ok_or_else(|| {
                invalid(format!(
                    "loop '{}' names unknown body node '{}'",
                    node.id, config.body
                ))
            })?;
            if body == i {
                return Err(invalid(format!("loop '{}' cannot be its own body", node.id)));
            }
            match edges.iter_mut().find(|e| e.source == i && e.target == body) {
                Some(e) => e.body_link = true,
                None => edges.push(PlanEdge {
                    source: i,
                    target: body,
                    rule: EdgeRule::Always,
                    body_link: true,
                }),
            }
            loop_entries.insert(i, body);
        }

        let entry = find_entry(&nodes, &edges)?;
        check_reachable(&nodes, &edges, entry)?;

        // Loop bodies and back edges
        let mut members_of: HashMap<usize, BTreeSet<usize>> = HashMap::new();
        for (&l, &body_entry) in &loop_entries {
            let members = collect_body(n, &edges, l, body_entry);
            for e in &edges {
                if !members.contains(&e.target) || members.contains(&e.source) {
                    continue;
                }
                if e.source != l || !e.body_link {
                    return Err(invalid(format!(
                        "node '{}' in the body of loop '{}' is entered from outside the loop via '{}'",
                        nodes[e.target].id, nodes[l].id, nodes[e.source].id
                    )));
                }
            }
            members_of.insert(l, members);
        }
        check_nesting(&nodes, &members_of)?;

        let is_back = |e: &PlanEdge| {
            members_of
                .get(&e.target)
                .is_some_and(|m| m.contains(&e.source))
        };
        let back_edges = edges.iter().filter(|e| is_back(e)).count();

        let mut outgoing = vec![Vec::new(); n];
        for (i, e) in edges.iter().enumerate() {
            if !is_back(e) {
                outgoing[e.source].push(i);
            }
        }

        let topo = topological_order(n, &edges, &outgoing).map_err(|stuck| {
            let names: Vec<&str> = stuck.iter().map(|&i| nodes[i].id.as_str()).collect();
            invalid(format!(
                "cycle through [{}]; cycles must pass through a loop node's body",
                names.join(", ")
            ))
        })?;

        // Innermost owning loop of each node
        let mut owner: Vec<Option<usize>> = vec![None; n];
        for (node, slot) in owner.iter_mut().enumerate() {
            *slot = members_of
                .iter()
                .filter(|(_, m)| m.contains(&node))
                .min_by_key(|(_, m)| m.len())
                .map(|(&l, _)| l);
        }

        let loops = members_of
            .into_iter()
            .map(|(l, members)| {
                let order = topo.iter().copied().filter(|&i| owner[i] == Some(l)).collect();
                let body = LoopBody {
                    entry: loop_entries[&l],
                    members,
                    order,
                };
                (l, body)
            })
            .collect();

        let top_order: Vec<usize> = topo.iter().copied().filter(|&i| owner[i].is_none()).collect();
        let levels = levels_of(&top_order, &edges, &outgoing);

        Ok(Plan {
            nodes,
            index,
            edges,
            outgoing,
            back_edges,
            entry,
            loops,
            top_order,
            levels,
        })
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn node(&self, idx: usize) -> &PlannedNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[PlannedNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Forward edges leaving `idx`, body links excluded.
    pub fn successors(&self, idx: usize) -> impl Iterator<Item = &PlanEdge> {
        self.outgoing[idx]
            .iter()
            .map(|&e| &self.edges[e])
            .filter(|e| !e.body_link)
    }

    pub fn has_failure_route(&self, idx: usize) -> bool {
        self.successors(idx)
            .any(|e| matches!(e.rule, EdgeRule::OnFailure))
    }

    pub fn loop_body(&self, idx: usize) -> Option<&LoopBody> {
        self.loops.get(&idx)
    }

    /// Top-level nodes (outside every loop body) in topological order.
    pub fn top_order(&self) -> &[usize] {
        &self.top_order
    }

    /// Top-level nodes grouped by depth from the entry. Nodes in one level
    /// never depend on each other.
    pub fn levels(&self) -> &[Vec<usize>] {
        &self.levels
    }

    pub fn has_loops(&self) -> bool {
        !self.loops.is_empty()
    }

    pub fn back_edge_count(&self) -> usize {
        self.back_edges
    }

    pub fn has_type(&self, node_type: NodeType) -> bool {
        self.nodes.iter().any(|n| n.kind.node_type() == node_type)
    }

    /// Whether any edge depends on more than the source succeeding, or a
    /// conditional node steers the walk.
    pub fn has_conditional_routing(&self) -> bool {
        self.has_type(NodeType::Conditional)
            || self
                .edges
                .iter()
                .any(|e| !matches!(e.rule, EdgeRule::Always | EdgeRule::OnSuccess))
    }

    /// Re-check that the forward graph is acyclic.
    pub fn verify_acyclic(&self) -> Result<()> {
        topological_order(self.nodes.len(), &self.edges, &self.outgoing)
            .map(|_| ())
            .map_err(|_| invalid("forward graph contains a cycle"))
    }
}

fn invalid(msg: impl Into<String>) -> StrandError {
    StrandError::GraphInvalid(msg.into())
}

fn find_entry(nodes: &[PlannedNode], edges: &[PlanEdge]) -> Result<usize> {
    let mut has_incoming = vec![false; nodes.len()];
    for e in edges {
        has_incoming[e.target] = true;
    }
    let roots: Vec<usize> = (0..nodes.len()).filter(|&i| !has_incoming[i]).collect();
    match roots.as_slice() {
        [entry] => Ok(*entry),
        [] => Err(invalid("graph has no entry node (every node has an incoming edge)")),
        many => {
            let names: Vec<&str> = many.iter().map(|&i| nodes[i].id.as_str()).collect();
            Err(invalid(format!(
                "graph must have exactly one entry node, found {}: {}",
                many.len(),
                names.join(", ")
            )))
        }
    }
}

fn check_reachable(nodes: &[PlannedNode], edges: &[PlanEdge], entry: usize) -> Result<()> {
    let mut seen = vec![false; nodes.len()];
    let mut queue = VecDeque::from([entry]);
    seen[entry] = true;
    while let Some(cur) = queue.pop_front() {
        for e in edges.iter().filter(|e| e.source == cur) {
            if !seen[e.target] {
                seen[e.target] = true;
                queue.push_back(e.target);
            }
        }
    }
    match seen.iter().position(|s| !s) {
        Some(i) => Err(invalid(format!(
            "node '{}' is unreachable from entry '{}'",
            nodes[i].id, nodes[entry].id
        ))),
        None => Ok(()),
    }
}

/// Nodes reachable from `body_entry` without passing through `loop_idx`.
fn collect_body(n: usize, edges: &[PlanEdge], loop_idx: usize, body_entry: usize) -> BTreeSet<usize> {
    let mut members = BTreeSet::new();
    let mut queue = VecDeque::from([body_entry]);
    let mut seen = vec![false; n];
    seen[body_entry] = true;
    while let Some(cur) = queue.pop_front() {
        members.insert(cur);
        for e in edges.iter().filter(|e| e.source == cur && e.target != loop_idx) {
            if !seen[e.target] {
                seen[e.target] = true;
                queue.push_back(e.target);
            }
        }
    }
    members
}

fn check_nesting(nodes: &[PlannedNode], members_of: &HashMap<usize, BTreeSet<usize>>) -> Result<()> {
    for (&a, ma) in members_of {
        for (&b, mb) in members_of {
            if a >= b || ma.is_disjoint(mb) || ma.is_subset(mb) || mb.is_subset(ma) {
                continue;
            }
            return Err(invalid(format!(
                "bodies of loops '{}' and '{}' overlap without nesting",
                nodes[a].id, nodes[b].id
            )));
        }
    }
    Ok(())
}

/// Kahn's algorithm; ties go to the earliest declared node. On a cycle,
/// returns the nodes that could not be ordered.
fn topological_order(
    n: usize,
    edges: &[PlanEdge],
    outgoing: &[Vec<usize>],
) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let mut indegree = vec![0usize; n];
    for out in outgoing {
        for &e in out {
            indegree[edges[e].target] += 1;
        }
    }
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(cur) = ready.pop_first() {
        order.push(cur);
        for &e in &outgoing[cur] {
            let t = edges[e].target;
            indegree[t] -= 1;
            if indegree[t] == 0 {
                ready.insert(t);
            }
        }
    }
    if order.len() == n {
        Ok(order)
    } else {
        Err((0..n).filter(|&i| indegree[i] > 0).collect())
    }
}

fn levels_of(order: &[usize], edges: &[PlanEdge], outgoing: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let in_scope: BTreeSet<usize> = order.iter().copied().collect();
    let mut depth: HashMap<usize, usize> = HashMap::new();
    for &node in order {
        let d = *depth.entry(node).or_insert(0);
        for &e in &outgoing[node] {
            let t = edges[e].target;
            if in_scope.contains(&t) {
                let slot = depth.entry(t).or_insert(0);
                *slot = (*slot).max(d + 1);
            }
        }
    }
    let max = depth.values().copied().max().unwrap_or(0);
    let mut levels = vec![Vec::new(); max + 1];
    for &node in order {
        levels[depth[&node]].push(node);
    }
    for level in &mut levels {
        level.sort_unstable();
    }
    levels
}
