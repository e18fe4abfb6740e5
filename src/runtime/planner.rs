/// Execution planning: DAG leveling into partitions
///
/// Builds a petgraph DAG from the workflow's nodes and edges, then levels it
/// Kahn-style: each pass takes every unassigned node whose dependencies all
/// sit on earlier levels. A level is split into at most
/// `max_partitions_per_level` contiguous partitions that may run
/// concurrently; levels run strictly in order.
///
/// A pass that assigns nothing while nodes remain means a cycle. Leveling stops
/// there and the plan carries a diagnostic naming the unresolved nodes; the
/// partial plan is still returned.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::PlanError;
use crate::workflow::catalog::NodeCatalog;
use crate::workflow::types::{Edge, Node};

/// Nodes of one level that run sequentially, in discovery order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPartition {
    pub id: String,
    pub level: usize,
    pub nodes: Vec<Node>,
    /// Edges with both endpoints inside this partition
    pub edges: Vec<Edge>,
    /// Upstream node ids outside this partition that must already have run
    pub external_dependencies: Vec<String>,
    /// Sum of the catalog cost weights of the nodes
    pub estimated_cost: u32,
    pub estimated_duration_ms: u64,
}

impl WorkflowPartition {
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }
}

/// Non-fatal finding attached to a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanDiagnostic {
    /// These nodes sit on or behind a cycle and were not scheduled
    CyclicDependency { unresolved: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub workflow_id: String,
    pub partitions: Vec<WorkflowPartition>,
    /// Partition ids level by level
    pub execution_order: Vec<Vec<String>>,
    /// Sum over levels of the slowest partition in the level
    pub total_estimated_duration_ms: u64,
    /// Every edge of the workflow, kept for input assembly
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub diagnostics: Vec<PlanDiagnostic>,
}

impl ExecutionPlan {
    pub fn partition(&self, id: &str) -> Option<&WorkflowPartition> {
        self.partitions.iter().find(|p| p.id == id)
    }

    pub fn level_count(&self) -> usize {
        self.execution_order.len()
    }

    pub fn scheduled_node_count(&self) -> usize {
        self.partitions.iter().map(|p| p.nodes.len()).sum()
    }

    /// Node ids feeding `node_id`, in edge order
    pub fn upstream_of(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == node_id)
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Node ids that could not be leveled
    pub fn unresolved_nodes(&self) -> Vec<&str> {
        self.diagnostics
            .iter()
            .flat_map(|d| match d {
                PlanDiagnostic::CyclicDependency { unresolved } => unresolved.iter().map(String::as_str),
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

#[derive(Debug)]
struct WorkflowGraph {
    graph: DiGraph<Node, ()>,
    node_id_to_index: HashMap<String, NodeIndex>,
}

/// Turns node/edge lists into execution plans
#[derive(Debug, Clone)]
pub struct Planner {
    catalog: Arc<NodeCatalog>,
    max_partitions_per_level: usize,
}

impl Planner {
    pub fn new(catalog: Arc<NodeCatalog>, max_partitions_per_level: usize) -> Self {
        Self {
            catalog,
            max_partitions_per_level: max_partitions_per_level.max(1),
        }
    }

    pub fn catalog(&self) -> &Arc<NodeCatalog> {
        &self.catalog
    }

    /// Validate the graph and level it into partitions
    pub fn create_execution_plan(
        &self,
        workflow_id: &str,
        nodes: &[Node],
        edges: &[Edge],
    ) -> Result<ExecutionPlan, PlanError> {
        if workflow_id.trim().is_empty() {
            return Err(PlanError::EmptyWorkflowId);
        }

        tracing::debug!("📊 Planning '{}' with {} nodes and {} edges", workflow_id, nodes.len(), edges.len());
        let specs = nodes
            .iter()
            .map(|node| self.catalog.resolve(node).map(|spec| (node.id.clone(), spec)))
            .collect::<Result<HashMap<_, _>, _>>()?;
        let graph = build_graph(nodes, edges)?;

        let (levels, unresolved) = level_nodes(&graph);
        let mut partitions = Vec::new();
        let mut execution_order = Vec::with_capacity(levels.len());
        let mut total_estimated_duration_ms = 0;

        for (level, members) in levels.iter().enumerate() {
            let chunk_count = self.max_partitions_per_level.min(members.len());
            let chunk_size = members.len().div_ceil(chunk_count);
            let mut level_ids = Vec::with_capacity(chunk_count);
            let mut slowest = 0;

            for (index, chunk) in members.chunks(chunk_size).enumerate() {
                let chunk_nodes: Vec<Node> = chunk.iter().map(|&idx| graph.graph[idx].clone()).collect();
                let inside: HashSet<&str> = chunk_nodes.iter().map(|n| n.id.as_str()).collect();

                let mut external_dependencies = Vec::new();
                for &idx in chunk {
                    for dep in graph.graph.neighbors_directed(idx, Direction::Incoming) {
                        let dep_id = &graph.graph[dep].id;
                        if !inside.contains(dep_id.as_str()) && !external_dependencies.contains(dep_id) {
                            external_dependencies.push(dep_id.clone());
                        }
                    }
                }

                let internal_edges = edges
                    .iter()
                    .filter(|e| inside.contains(e.from.as_str()) && inside.contains(e.to.as_str()))
                    .cloned()
                    .collect();

                let (estimated_cost, estimated_duration_ms) = chunk_nodes.iter().fold((0u32, 0u64), |(cost, ms), n| {
                    let spec = &specs[&n.id];
                    (
                        cost + spec.cost_weight,
                        ms + spec.estimated_duration.as_millis() as u64,
                    )
                });
                slowest = slowest.max(estimated_duration_ms);

                let id = format!("{}:L{}P{}", workflow_id, level, index);
                level_ids.push(id.clone());
                partitions.push(WorkflowPartition {
                    id,
                    level,
                    nodes: chunk_nodes,
                    edges: internal_edges,
                    external_dependencies,
                    estimated_cost,
                    estimated_duration_ms,
                });
            }

            total_estimated_duration_ms += slowest;
            execution_order.push(level_ids);
        }

        let mut diagnostics = Vec::new();
        if !unresolved.is_empty() {
            let unresolved: Vec<String> = unresolved.iter().map(|&idx| graph.graph[idx].id.clone()).collect();
            tracing::warn!(
                "🔁 Cyclic dependency in '{}': {} node(s) left unscheduled {:?}",
                workflow_id,
                unresolved.len(),
                unresolved
            );
            diagnostics.push(PlanDiagnostic::CyclicDependency { unresolved });
        }

        tracing::info!(
            "📋 Planned '{}': {} levels, {} partitions, ~{}ms",
            workflow_id,
            execution_order.len(),
            partitions.len(),
            total_estimated_duration_ms
        );

        Ok(ExecutionPlan {
            workflow_id: workflow_id.to_string(),
            partitions,
            execution_order,
            total_estimated_duration_ms,
            edges: edges.to_vec(),
            diagnostics,
        })
    }
}

fn build_graph(nodes: &[Node], edges: &[Edge]) -> Result<WorkflowGraph, PlanError> {
    let mut graph = DiGraph::new();
    let mut node_id_to_index = HashMap::new();

    for node in nodes {
        if node_id_to_index.contains_key(&node.id) {
            return Err(PlanError::DuplicateNode(node.id.clone()));
        }
        let index = graph.add_node(node.clone());
        node_id_to_index.insert(node.id.clone(), index);
    }

    for edge in edges {
        let lookup = |id: &String| {
            node_id_to_index.get(id).copied().ok_or_else(|| PlanError::UnknownEdgeEndpoint {
                from: edge.from.clone(),
                to: edge.to.clone(),
                missing: id.clone(),
            })
        };
        let (from, to) = (lookup(&edge.from)?, lookup(&edge.to)?);
        graph.add_edge(from, to, ());
    }

    Ok(WorkflowGraph {
        graph,
        node_id_to_index,
    })
}

/// Topological leveling; returns the levels and the nodes left over by a cycle
fn level_nodes(graph: &WorkflowGraph) -> (Vec<Vec<NodeIndex>>, Vec<NodeIndex>) {
    let mut remaining: Vec<NodeIndex> = graph.graph.node_indices().collect();
    let mut assigned: HashSet<NodeIndex> = HashSet::with_capacity(remaining.len());
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<NodeIndex>, Vec<NodeIndex>) = remaining.iter().copied().partition(|&idx| {
            graph
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .all(|dep| assigned.contains(&dep))
        });

        if ready.is_empty() {
            return (levels, blocked);
        }
        assigned.extend(ready.iter().copied());
        levels.push(ready);
        remaining = blocked;
    }

    debug_assert_eq!(assigned.len(), graph.node_id_to_index.len());
    (levels, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(max_partitions: usize) -> Planner {
        Planner::new(Arc::new(NodeCatalog::with_builtins()), max_partitions)
    }

    fn nodes(ids: &[&str]) -> Vec<Node> {
        ids.iter().map(|id| Node::new(*id, "transform")).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<Edge> {
        pairs.iter().map(|(a, b)| Edge::new(*a, *b)).collect()
    }

    fn level_of(plan: &ExecutionPlan, node_id: &str) -> usize {
        plan.partitions
            .iter()
            .find(|p| p.node_ids().any(|id| id == node_id))
            .map(|p| p.level)
            .unwrap()
    }

    #[test]
    fn test_diamond_levels() {
        let plan = planner(1)
            .create_execution_plan(
                "wf",
                &nodes(&["A", "B", "C", "D"]),
                &edges(&[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")]),
            )
            .unwrap();

        assert_eq!(plan.level_count(), 3);
        let members: Vec<Vec<&str>> = plan.partitions.iter().map(|p| p.node_ids().collect()).collect();
        assert_eq!(members, vec![vec!["A"], vec!["B", "C"], vec!["D"]]);
        assert_eq!(plan.partitions[2].external_dependencies, ["B", "C"]);
        assert_eq!(plan.total_estimated_duration_ms, 100 + 200 + 100);
        assert!(plan.is_complete());
    }

    #[test]
    fn test_budget_splits_levels_without_changing_them() {
        let plan = planner(2)
            .create_execution_plan(
                "wf",
                &nodes(&["A", "B", "C", "D", "E"]),
                &edges(&[("A", "B"), ("A", "C"), ("A", "D"), ("B", "E"), ("C", "E"), ("D", "E")]),
            )
            .unwrap();

        assert_eq!(plan.level_count(), 3);
        assert_eq!(plan.execution_order[1].len(), 2);
        let level1: Vec<Vec<&str>> = plan.execution_order[1]
            .iter()
            .map(|id| plan.partition(id).unwrap().node_ids().collect())
            .collect();
        assert_eq!(level1, vec![vec!["B", "C"], vec!["D"]]);
        assert_eq!(plan.total_estimated_duration_ms, 100 + 200 + 100);
    }

    #[test]
    fn test_every_node_after_its_dependencies() {
        let ids = ["a", "b", "c", "d", "e", "f", "g"];
        let links = [("a", "c"), ("b", "c"), ("c", "e"), ("d", "e"), ("a", "f"), ("e", "g"), ("f", "g")];
        let plan = planner(3).create_execution_plan("wf", &nodes(&ids), &edges(&links)).unwrap();

        for (from, to) in links {
            assert!(level_of(&plan, to) > level_of(&plan, from), "{from} -> {to}");
        }
        let mut seen: Vec<&str> = plan.partitions.iter().flat_map(|p| p.node_ids()).collect();
        seen.sort();
        assert_eq!(seen, ids);
    }

    #[test]
    fn test_cycle_yields_partial_plan_with_diagnostic() {
        let plan = planner(4)
            .create_execution_plan(
                "wf",
                &nodes(&["root", "x", "y", "tail"]),
                &edges(&[("root", "x"), ("x", "y"), ("y", "x"), ("y", "tail")]),
            )
            .unwrap();

        assert_eq!(plan.level_count(), 1);
        assert_eq!(plan.scheduled_node_count(), 1);
        assert_eq!(plan.unresolved_nodes(), ["x", "y", "tail"]);
        assert!(!plan.is_complete());
    }

    #[test]
    fn test_programmer_errors_are_rejected() {
        let p = planner(2);
        assert_eq!(
            p.create_execution_plan(" ", &nodes(&["a"]), &[]).unwrap_err(),
            PlanError::EmptyWorkflowId
        );
        assert_eq!(
            p.create_execution_plan("wf", &nodes(&["a", "a"]), &[]).unwrap_err(),
            PlanError::DuplicateNode("a".into())
        );
        assert!(matches!(
            p.create_execution_plan("wf", &[Node::new("a", "quantum")], &[]).unwrap_err(),
            PlanError::UnknownNodeType { .. }
        ));
        assert!(matches!(
            p.create_execution_plan("wf", &nodes(&["a"]), &edges(&[("a", "ghost")])).unwrap_err(),
            PlanError::UnknownEdgeEndpoint { missing, .. } if missing == "ghost"
        ));
    }

    #[test]
    fn test_empty_graph_is_an_empty_plan() {
        let plan = planner(2).create_execution_plan("wf", &[], &[]).unwrap();
        assert_eq!(plan.level_count(), 0);
        assert_eq!(plan.total_estimated_duration_ms, 0);
    }
}
