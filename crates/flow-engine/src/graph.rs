//! Directed graph view over a definition's explicit successor edges

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::definition::FlowNode;
use crate::NodeId;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Empty definition: no nodes defined")]
    EmptyDefinition,

    #[error("Duplicate node ID: {0}")]
    DuplicateNode(NodeId),

    #[error("Missing successor: node {node} points to {successor} which does not exist")]
    MissingSuccessor { node: NodeId, successor: NodeId },
}

/// Graph of static nodes, built from `next_node_ids` / `next_node_id`.
///
/// Cycles are allowed; [`FlowGraph::cycle`] reports one for diagnostics.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    graph: DiGraph<NodeId, ()>,
    index_of: HashMap<NodeId, NodeIndex>,
}

impl FlowGraph {
    pub fn build(nodes: &[FlowNode]) -> Result<Self, GraphError> {
        if nodes.is_empty() {
            return Err(GraphError::EmptyDefinition);
        }

        let mut graph = DiGraph::new();
        let mut index_of = HashMap::new();

        for node in nodes {
            if index_of.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode(node.id));
            }
            let idx = graph.add_node(node.id);
            index_of.insert(node.id, idx);
        }

        for node in nodes {
            let from = index_of[&node.id];
            for successor in node.explicit_successors() {
                let to = index_of.get(&successor).ok_or(GraphError::MissingSuccessor {
                    node: node.id,
                    successor,
                })?;
                graph.add_edge(from, *to, ());
            }
        }

        Ok(Self { graph, index_of })
    }

    /// Nodes with an explicit edge into `id`.
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: NodeId, direction: Direction) -> Vec<NodeId> {
        let Some(idx) = self.index_of.get(&id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut result: Vec<NodeId> = self
            .graph
            .neighbors_directed(*idx, direction)
            .map(|n| self.graph[n])
            .filter(|n| seen.insert(*n))
            .collect();
        result.sort_unstable();
        result
    }

    pub fn has_path(&self, from: NodeId, to: NodeId) -> bool {
        match (self.index_of.get(&from), self.index_of.get(&to)) {
            (Some(a), Some(b)) => petgraph::algo::has_path_connecting(&self.graph, *a, *b, None),
            _ => false,
        }
    }

    /// One cycle rendered as `a -> b -> a`, if the graph has any.
    pub fn cycle(&self) -> Option<String> {
        if !petgraph::algo::is_cyclic_directed(&self.graph) {
            return None;
        }

        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        for idx in self.graph.node_indices() {
            if let Some(cycle) = self.find_cycle(idx, &mut visited, &mut stack) {
                return Some(
                    cycle
                        .iter()
                        .map(|n| self.graph[*n].to_string())
                        .collect::<Vec<_>>()
                        .join(" -> "),
                );
            }
        }
        None
    }

    fn find_cycle(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        if let Some(pos) = stack.iter().position(|n| *n == node) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        if !visited.insert(node) {
            return None;
        }

        stack.push(node);
        for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(cycle) = self.find_cycle(next, visited, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        None
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}
