//! Graph resolution — turns nodes and edges into an execution plan.
//!
//! Uses dependency counting (Kahn's algorithm). Nodes whose in-degree drops
//! to zero in the same round form one level; every node within a level is
//! independent of the others and may run concurrently.

use std::collections::{HashMap, HashSet};

use flowrun_core::error::{FlowError, Result};
use flowrun_core::types::Graph;

/// Resolved ordering information for one graph.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    order: Vec<String>,
    levels: Vec<Vec<String>>,
    predecessors: HashMap<String, Vec<String>>,
    successors: HashMap<String, Vec<String>>,
}

impl ExecutionPlan {
    /// A linear order in which every predecessor precedes its dependents.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Nodes grouped into waves of mutually independent nodes.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Direct predecessors in edge declaration order, without duplicates.
    ///
    /// Position `i` here is what `{{i+1}}` refers to.
    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct successors in edge declaration order, without duplicates.
    pub fn successors(&self, id: &str) -> &[String] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn in_degree(&self, id: &str) -> usize {
        self.predecessors(id).len()
    }

    /// Nodes with no incoming edges.
    pub fn roots(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.in_degree(id) == 0)
            .map(String::as_str)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Validate the graph and compute its execution plan.
///
/// Fails with [`FlowError::GraphCycle`] naming every node that could not be
/// ordered; nothing has run at that point.
pub fn resolve_plan(graph: &Graph) -> Result<ExecutionPlan> {
    graph.validate()?;

    let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
    let mut successors: HashMap<String, Vec<String>> = HashMap::new();
    let mut seen_edges: HashSet<(&str, &str)> = HashSet::new();

    for node in &graph.nodes {
        predecessors.entry(node.id.clone()).or_default();
        successors.entry(node.id.clone()).or_default();
    }

    for edge in &graph.edges {
        // Multiple edges between the same pair (different ports) count once.
        if !seen_edges.insert((edge.source.as_str(), edge.target.as_str())) {
            continue;
        }
        predecessors
            .entry(edge.target.clone())
            .or_default()
            .push(edge.source.clone());
        successors
            .entry(edge.source.clone())
            .or_default()
            .push(edge.target.clone());
    }

    let mut in_degree: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), predecessors[&n.id].len()))
        .collect();

    // Declaration index keeps every wave deterministic.
    let rank: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut current: Vec<&str> = graph
        .nodes
        .iter()
        .filter(|n| in_degree[n.id.as_str()] == 0)
        .map(|n| n.id.as_str())
        .collect();

    let mut order = Vec::with_capacity(graph.nodes.len());
    let mut levels = Vec::new();

    while !current.is_empty() {
        let mut next: Vec<&str> = Vec::new();
        for id in &current {
            for succ in &successors[*id] {
                if let Some(degree) = in_degree.get_mut(succ.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(succ.as_str());
                    }
                }
            }
        }
        next.sort_by_key(|id| rank[id]);

        order.extend(current.iter().map(|s| s.to_string()));
        levels.push(current.iter().map(|s| s.to_string()).collect());
        current = next;
    }

    if order.len() < graph.nodes.len() {
        let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
        let nodes = graph
            .nodes
            .iter()
            .filter(|n| !placed.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect();
        return Err(FlowError::GraphCycle { nodes });
    }

    Ok(ExecutionPlan {
        order,
        levels,
        predecessors,
        successors,
    })
}
