//! Dependency graph over service declarations.
//!
//! Pure functions: build the graph, find a cycle, and compute the order in which
//! services must be started so every dependency comes before its dependents.

use std::collections::{HashMap, HashSet};

use crate::error::GraphError;
use crate::service::ServiceConfig;

/// Nodes in input order, and each node's dependencies in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    pub nodes: Vec<String>,
    pub edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }
}

/// Builds the graph. Repeated ids and repeated dependencies are kept once.
pub fn build_graph(services: &[ServiceConfig]) -> DependencyGraph {
    let mut graph = DependencyGraph::default();
    for service in services {
        if graph.edges.contains_key(&service.id) {
            continue;
        }
        let mut deps: Vec<String> = Vec::with_capacity(service.depends_on.len());
        for dep in &service.depends_on {
            if !deps.contains(dep) {
                deps.push(dep.clone());
            }
        }
        graph.nodes.push(service.id.clone());
        graph.edges.insert(service.id.clone(), deps);
    }
    graph
}

/// Finds the first cycle reachable by a depth-first search that visits nodes in
/// input order and dependencies in declaration order.
///
/// The returned path starts at the node the back-edge points to and ends with
/// that same node, e.g. `a -> b -> c -> a`.
pub fn detect_cycle(graph: &DependencyGraph) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut stack = Vec::new();
    for node in &graph.nodes {
        if visited.contains(node.as_str()) {
            continue;
        }
        if let Some(cycle) = visit_for_cycle(graph, node, &mut visited, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit_for_cycle<'g>(
    graph: &'g DependencyGraph,
    node: &'g str,
    visited: &mut HashSet<&'g str>,
    stack: &mut Vec<&'g str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    stack.push(node);
    for dep in graph.dependencies(node) {
        if let Some(pos) = stack.iter().position(|on_stack| *on_stack == dep.as_str()) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(|id| id.to_string()).collect();
            cycle.push(dep.clone());
            return Some(cycle);
        }
        if !visited.contains(dep.as_str()) {
            if let Some(cycle) = visit_for_cycle(graph, dep, visited, stack) {
                return Some(cycle);
            }
        }
    }
    stack.pop();
    None
}

/// Orders services so that every dependency precedes its dependents.
///
/// Fails with the discovered cycle before doing any ordering work.
pub fn topological_sort(services: &[ServiceConfig]) -> Result<Vec<&ServiceConfig>, GraphError> {
    let graph = build_graph(services);
    if let Some(cycle) = detect_cycle(&graph) {
        return Err(GraphError::Cycle(cycle));
    }
    for id in &graph.nodes {
        for dep in graph.dependencies(id) {
            if !graph.contains(dep) {
                return Err(GraphError::UnknownDependency {
                    service: id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let by_id: HashMap<&str, &ServiceConfig> = services
        .iter()
        .rev()
        .map(|service| (service.id.as_str(), service))
        .collect();
    let mut visited = HashSet::new();
    let mut order = Vec::with_capacity(graph.nodes.len());
    for id in &graph.nodes {
        visit_post_order(&graph, id, &mut visited, &mut order);
    }
    Ok(order
        .into_iter()
        .filter_map(|id| by_id.get(id).copied())
        .collect())
}

fn visit_post_order<'g>(
    graph: &'g DependencyGraph,
    node: &'g str,
    visited: &mut HashSet<&'g str>,
    order: &mut Vec<&'g str>,
) {
    if !visited.insert(node) {
        return;
    }
    for dep in graph.dependencies(node) {
        visit_post_order(graph, dep, visited, order);
    }
    order.push(node);
}

/// Returns the ids of `subset` in start order.
///
/// Ids in `subset` that are not configured are dropped.
pub fn start_order<S: AsRef<str>>(
    subset: &[S],
    services: &[ServiceConfig],
) -> Result<Vec<String>, GraphError> {
    let order: Vec<String> = topological_sort(services)?
        .into_iter()
        .map(|service| service.id.clone())
        .collect();
    Ok(filter_order(&order, subset))
}

/// Filters a precomputed full order down to `subset`, keeping relative order.
pub fn filter_order<S: AsRef<str>>(order: &[String], subset: &[S]) -> Vec<String> {
    let wanted: HashSet<&str> = subset.iter().map(AsRef::as_ref).collect();
    order
        .iter()
        .filter(|id| wanted.contains(id.as_str()))
        .cloned()
        .collect()
}
