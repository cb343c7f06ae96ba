//! Dependency graph over components, keyed by insertion index.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use super::ComponentId;

/// Directed graph where an edge `a -> b` means `b` depends on `a`, either
/// through an input column produced by `a` or a requirement on filter `a`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<ComponentId>,
    index: HashMap<ComponentId, usize>,
    dependents: Vec<Vec<usize>>,
    dependencies: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new(nodes: impl IntoIterator<Item = ComponentId>) -> Self {
        let mut graph = Self::default();
        for node in nodes {
            graph.add_node(node);
        }
        graph
    }

    pub fn add_node(&mut self, node: ComponentId) {
        if self.index.contains_key(&node) {
            return;
        }
        self.index.insert(node, self.nodes.len());
        self.nodes.push(node);
        self.dependents.push(Vec::new());
        self.dependencies.push(Vec::new());
    }

    /// Record that `downstream` depends on `upstream`. Unknown nodes are ignored.
    pub fn add_edge(&mut self, upstream: ComponentId, downstream: ComponentId) {
        let (Some(&from), Some(&to)) = (self.index.get(&upstream), self.index.get(&downstream))
        else {
            return;
        };
        if !self.dependents[from].contains(&to) {
            self.dependents[from].push(to);
            self.dependencies[to].push(from);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of a node.
    pub fn dependencies_of(&self, node: ComponentId) -> Vec<ComponentId> {
        self.index
            .get(&node)
            .map(|&i| self.dependencies[i].iter().map(|&d| self.nodes[d]).collect())
            .unwrap_or_default()
    }

    /// Every node that transitively depends on `node`.
    pub fn descendants(&self, node: ComponentId) -> HashSet<ComponentId> {
        self.reach(node, &self.dependents)
    }

    /// Every node `node` transitively depends on.
    pub fn ancestors(&self, node: ComponentId) -> HashSet<ComponentId> {
        self.reach(node, &self.dependencies)
    }

    /// True if `candidate` is (transitively) upstream of `node`.
    pub fn is_ancestor(&self, candidate: ComponentId, node: ComponentId) -> bool {
        self.ancestors(node).contains(&candidate)
    }

    fn reach(&self, node: ComponentId, edges: &[Vec<usize>]) -> HashSet<ComponentId> {
        let mut seen = HashSet::new();
        let Some(&start) = self.index.get(&node) else {
            return seen;
        };

        let mut stack = edges[start].clone();
        while let Some(next) = stack.pop() {
            if seen.insert(self.nodes[next]) {
                stack.extend(edges[next].iter().copied());
            }
        }
        seen
    }

    /// Nodes in dependency order, ties broken by insertion order.
    ///
    /// Returns a node on a cycle if the graph is not acyclic.
    pub fn topological_order(&self) -> Result<Vec<ComponentId>, ComponentId> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(next)) = ready.pop() {
            order.push(self.nodes[next]);
            for &dependent in &self.dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let stuck = in_degree
                .iter()
                .position(|d| *d > 0)
                .map(|i| self.nodes[i])
                .unwrap_or(self.nodes[0]);
            Err(stuck)
        }
    }

    pub fn is_acyclic(&self) -> bool {
        self.topological_order().is_ok()
    }
}
