use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::core::ArcStr;
use crate::error::GraphError;
use crate::graph::Graph;
use crate::node::TaskNode;
use crate::task::{InfluenceRegistry, TaskRegistry, TaskSpec};
use crate::utils::{format_task_name, parse_task_name};

/// Expands a root task set into a full [`Graph`] and stabilizes every
/// node's identity.
///
/// Requirement names are resolved through the [`TaskRegistry`] and
/// memoized by canonical qualified name, so two tasks requiring the same
/// dependency share one node. Both registries are explicit instances
/// owned by the builder; nothing here is process-global state.
pub struct GraphBuilder {
    registry: Arc<dyn TaskRegistry>,
    influences: Arc<InfluenceRegistry>,
}

impl GraphBuilder {
    pub fn new(registry: Arc<dyn TaskRegistry>, influences: Arc<InfluenceRegistry>) -> Self {
        Self {
            registry,
            influences,
        }
    }

    /// Build the dependency graph for the given initial tasks.
    ///
    /// Worklist expansion over requirement names, followed by cycle
    /// rejection and a bottom-up finalization pass that computes every
    /// node's identity, deepest dependency first.
    pub fn build(&self, initial: Vec<Arc<dyn TaskSpec>>) -> Result<Graph, GraphError> {
        let mut graph = Graph::new();
        let mut known: HashMap<ArcStr, Arc<TaskNode>> = HashMap::new();
        let mut queue: VecDeque<Arc<TaskNode>> = VecDeque::new();

        for spec in initial {
            let node = Arc::new(TaskNode::new(spec));
            known.insert(node.qualified_name_arc(), node.clone());
            queue.push_back(node);
        }

        while let Some(parent) = queue.pop_front() {
            graph.add_node(parent.clone());

            for requirement in parent.spec().requires() {
                let child = self.resolve(&requirement, &mut known, &mut queue)?;
                graph.add_node(child.clone());
                graph.add_edge(&parent, &child);
            }
        }

        let sorted = graph.topological_sort()?;

        // Stabilize identities bottom-up: every child identity is final
        // before any parent hashes it.
        for node in sorted.iter().rev() {
            node.finalize(&graph, &self.influences)?;
        }

        Ok(graph)
    }

    fn resolve(
        &self,
        requirement: &str,
        known: &mut HashMap<ArcStr, Arc<TaskNode>>,
        queue: &mut VecDeque<Arc<TaskNode>>,
    ) -> Result<Arc<TaskNode>, GraphError> {
        let (name, params) = parse_task_name(requirement);
        let canonical: ArcStr = format_task_name(&name, &params).into();

        if let Some(node) = known.get(&canonical) {
            return Ok(node.clone());
        }

        let spec = self.registry.get(requirement)?;
        let node = Arc::new(TaskNode::new(spec));

        known.insert(canonical, node.clone());
        known.insert(node.qualified_name_arc(), node.clone());
        queue.push_back(node.clone());

        Ok(node)
    }
}
