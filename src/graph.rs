//! The dependency graph and its traversals.
//!
//! A directed acyclic graph of [`TaskNode`]s with edges pointing from a
//! task to each of its direct requirements. The representation is a plain
//! adjacency list keyed by qualified name: topological sorting is an
//! iterative depth-first postorder, cycle detection a three-color
//! visitation, and descendant/ancestor queries are reachability walks in
//! the respective edge direction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::ArcStr;
use crate::error::GraphError;
use crate::node::TaskNode;

#[derive(Default)]
pub struct Graph {
    nodes: HashMap<ArcStr, Arc<TaskNode>>,
    edges_out: HashMap<ArcStr, Vec<ArcStr>>,
    edges_in: HashMap<ArcStr, Vec<ArcStr>>,
    /// Insertion order, kept for deterministic iteration.
    order: Vec<ArcStr>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.nodes.contains_key(qualified_name)
    }

    pub fn get(&self, qualified_name: &str) -> Option<&Arc<TaskNode>> {
        self.nodes.get(qualified_name)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<TaskNode>> {
        self.order.iter().filter_map(|key| self.nodes.get(key))
    }

    /// Insert a node; a node already present is left untouched.
    pub fn add_node(&mut self, node: Arc<TaskNode>) {
        let key = node.qualified_name_arc();
        if self.nodes.contains_key(&key) {
            return;
        }

        self.order.push(key.clone());
        self.edges_out.insert(key.clone(), Vec::new());
        self.edges_in.insert(key.clone(), Vec::new());
        self.nodes.insert(key, node);
    }

    /// Record that `parent` requires `child`. Both must already be nodes.
    /// Duplicate edges collapse into one.
    pub fn add_edge(&mut self, parent: &TaskNode, child: &TaskNode) {
        let parent = parent.qualified_name_arc();
        let child = child.qualified_name_arc();

        debug_assert!(self.nodes.contains_key(&parent));
        debug_assert!(self.nodes.contains_key(&child));

        let out = self.edges_out.entry(parent.clone()).or_default();
        if out.contains(&child) {
            return;
        }

        out.push(child.clone());
        self.edges_in.entry(child).or_default().push(parent);
    }

    /// Direct requirements of a node, in edge insertion order.
    pub fn requirements(&self, node: &TaskNode) -> Vec<Arc<TaskNode>> {
        self.edges_out
            .get(node.qualified_name())
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| self.nodes.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents of a node, in edge insertion order.
    pub fn dependents(&self, node: &TaskNode) -> Vec<Arc<TaskNode>> {
        self.edges_in
            .get(node.qualified_name())
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| self.nodes.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A node with no outgoing edges has no unresolved requirements.
    pub fn is_leaf(&self, node: &TaskNode) -> bool {
        self.edges_out
            .get(node.qualified_name())
            .is_none_or(|out| out.is_empty())
    }

    /// A node with no incoming edges is required by nothing.
    pub fn is_root(&self, node: &TaskNode) -> bool {
        self.edges_in
            .get(node.qualified_name())
            .is_none_or(|inc| inc.is_empty())
    }

    /// All nodes satisfying the predicate, in graph iteration order.
    pub fn select(&self, predicate: impl Fn(&Graph, &TaskNode) -> bool) -> Vec<Arc<TaskNode>> {
        self.nodes()
            .filter(|node| predicate(self, node))
            .cloned()
            .collect()
    }

    /// Remove every node for which the predicate holds, along with its
    /// incident edges.
    pub fn prune(&mut self, predicate: impl Fn(&Graph, &TaskNode) -> bool) {
        let doomed: Vec<ArcStr> = self
            .order
            .iter()
            .filter(|key| {
                let node = &self.nodes[*key];
                predicate(self, node)
            })
            .cloned()
            .collect();

        for key in doomed {
            tracing::trace!("Pruned {key}");
            self.remove_node(&key);
        }
    }

    fn remove_node(&mut self, key: &ArcStr) {
        if self.nodes.remove(key).is_none() {
            return;
        }

        self.order.retain(|k| k != key);

        for child in self.edges_out.remove(key).unwrap_or_default() {
            if let Some(inc) = self.edges_in.get_mut(&child) {
                inc.retain(|k| k != key);
            }
        }

        for parent in self.edges_in.remove(key).unwrap_or_default() {
            if let Some(out) = self.edges_out.get_mut(&parent) {
                out.retain(|k| k != key);
            }
        }
    }

    /// Everything reachable from the node along requirement edges,
    /// excluding the node itself.
    pub fn descendants(&self, node: &TaskNode) -> Vec<Arc<TaskNode>> {
        self.reachable(node, &self.edges_out)
    }

    /// Everything that (transitively) requires the node.
    pub fn ancestors(&self, node: &TaskNode) -> Vec<Arc<TaskNode>> {
        self.reachable(node, &self.edges_in)
    }

    fn reachable(
        &self,
        node: &TaskNode,
        edges: &HashMap<ArcStr, Vec<ArcStr>>,
    ) -> Vec<Arc<TaskNode>> {
        let mut seen: HashSet<ArcStr> = HashSet::new();
        let mut found = Vec::new();
        let mut stack: Vec<ArcStr> = edges
            .get(node.qualified_name())
            .cloned()
            .unwrap_or_default();

        seen.insert(node.qualified_name_arc());

        while let Some(key) = stack.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }

            if let Some(next) = edges.get(&key) {
                stack.extend(next.iter().cloned());
            }

            if let Some(node) = self.nodes.get(&key) {
                found.push(node.clone());
            }
        }

        found
    }

    /// Dependents-first topological order over all nodes.
    ///
    /// For every edge (parent, child) the parent appears before the child;
    /// callers that need dependencies first iterate the result in reverse.
    /// Fails with [`GraphError::Cyclic`] when the graph has a cycle, naming
    /// the cycle members.
    pub fn topological_sort(&self) -> Result<Vec<Arc<TaskNode>>, GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        let mut marks: HashMap<ArcStr, Mark> =
            self.order.iter().map(|k| (k.clone(), Mark::White)).collect();
        let mut postorder: Vec<ArcStr> = Vec::with_capacity(self.order.len());
        let mut path: Vec<ArcStr> = Vec::new();

        for start in &self.order {
            if marks[start] != Mark::White {
                continue;
            }

            let mut stack: Vec<(ArcStr, bool)> = vec![(start.clone(), false)];

            while let Some((key, expanded)) = stack.pop() {
                if expanded {
                    marks.insert(key.clone(), Mark::Black);
                    path.pop();
                    postorder.push(key);
                    continue;
                }

                if marks[&key] != Mark::White {
                    continue;
                }

                marks.insert(key.clone(), Mark::Gray);
                path.push(key.clone());
                stack.push((key.clone(), true));

                for child in self.edges_out.get(&key).into_iter().flatten() {
                    match marks[child] {
                        Mark::White => stack.push((child.clone(), false)),
                        Mark::Gray => {
                            let from = path.iter().position(|k| k == child).unwrap_or(0);
                            let mut members: Vec<String> =
                                path[from..].iter().map(|k| k.to_string()).collect();
                            members.push(child.to_string());
                            return Err(GraphError::Cyclic { members });
                        }
                        Mark::Black => {}
                    }
                }
            }
        }

        // Postorder lists dependencies before dependents; reverse it.
        Ok(postorder
            .into_iter()
            .rev()
            .filter_map(|key| self.nodes.get(&key).cloned())
            .collect())
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.order)
            .field("edges", &self.edges_out)
            .finish()
    }
}

/// Produce an execution order from the given start nodes: depth-first
/// expansion with an explicit stack, each node visited at most once,
/// reversed so the deepest dependencies come first.
///
/// The order alone does not gate submission on completion; the build
/// driver layers that on top by tracking per-node readiness.
pub fn linearize(start: &[Arc<TaskNode>]) -> Result<Vec<Arc<TaskNode>>, GraphError> {
    let mut done: HashSet<ArcStr> = HashSet::new();
    let mut list: Vec<Arc<TaskNode>> = Vec::new();
    let mut stack: Vec<Arc<TaskNode>> = start.to_vec();

    while let Some(node) = stack.pop() {
        if done.insert(node.qualified_name_arc()) {
            stack.extend(node.children()?.iter().rev().cloned());
            list.push(node);
        }
    }

    list.reverse();
    Ok(list)
}
