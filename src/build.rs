//! The build driver: dependency-gated submission over a [`TaskQueue`].
//!
//! The linearized order decides *in which order* ready tasks are handed to
//! the queue; it does not by itself guarantee that a dependent runs only
//! after its dependencies finished. The driver adds that gate explicitly,
//! tracking one unfinished-requirement count per node and submitting a
//! node only when its count reaches zero.

use std::collections::HashMap;
use std::sync::Arc;

use indicatif::ProgressStyle;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::ArtifactCache;
use crate::core::ArcStr;
use crate::error::BuildError;
use crate::graph::{Graph, linearize};
use crate::node::TaskNode;
use crate::queue::TaskQueue;

/// Drop every node whose artifact the local cache can already satisfy.
/// Run before scheduling so that up-to-date subtrees never occupy a
/// worker.
pub fn prune_satisfied(graph: &mut Graph, cache: &dyn ArtifactCache) {
    graph.prune(|_, node| node.is_cacheable() && cache.is_available_locally(node));
}

/// Execute every node in the graph, dependencies strictly before
/// dependents.
///
/// Tasks are submitted as soon as all of their in-graph requirements have
/// completed successfully; completions are drained one at a time. The
/// first failure aborts the queue, drains the remaining cancellations and
/// is returned as the build's error.
pub fn run_build(
    graph: &Graph,
    cache: &Arc<dyn ArtifactCache>,
    queue: &mut TaskQueue,
) -> Result<(), BuildError> {
    if graph.is_empty() {
        return Ok(());
    }

    // Submission order: linearized from the roots, restricted to nodes
    // still present in the (possibly pruned) graph.
    let roots = graph.select(Graph::is_root);
    let mut pending: Vec<Arc<TaskNode>> = linearize(&roots)?
        .into_iter()
        .filter(|node| graph.contains(node.qualified_name()))
        .collect();

    // Unfinished requirement count per node, over in-graph edges only.
    let mut remaining: HashMap<ArcStr, usize> = pending
        .iter()
        .map(|node| (node.qualified_name_arc(), graph.requirements(node).len()))
        .collect();

    let span = tracing::span!(Level::INFO, "running_tasks");
    span.pb_set_length(pending.len() as u64);
    span.pb_set_style(
        &ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    span.pb_set_message("Running tasks...");
    let _enter = span.enter();

    if let Err(error) = submit_ready(&mut pending, &remaining, cache, queue) {
        return Err(fail(queue, error.into()));
    }

    while let Some((task, error)) = queue.wait() {
        if let Some(error) = error {
            tracing::error!("Failed {}", task.log_name());
            return Err(fail(queue, error.into()));
        }

        span.pb_inc(1);

        for dependent in graph.dependents(&task) {
            if let Some(count) = remaining.get_mut(dependent.qualified_name()) {
                *count -= 1;
            }
        }

        if let Err(error) = submit_ready(&mut pending, &remaining, cache, queue) {
            return Err(fail(queue, error.into()));
        }
    }

    queue.shutdown();
    Ok(())
}

/// Submit every pending node whose requirement count reached zero,
/// preserving the linearized order among them.
fn submit_ready(
    pending: &mut Vec<Arc<TaskNode>>,
    remaining: &HashMap<ArcStr, usize>,
    cache: &Arc<dyn ArtifactCache>,
    queue: &mut TaskQueue,
) -> Result<(), crate::error::SchedulerError> {
    let mut kept = Vec::with_capacity(pending.len());

    for node in pending.drain(..) {
        if remaining.get(node.qualified_name()).copied() == Some(0) {
            queue.submit(cache, &node)?;
        } else {
            kept.push(node);
        }
    }

    *pending = kept;
    Ok(())
}

/// Abort the queue, drain what is left and hand the original error back.
fn fail(queue: &mut TaskQueue, error: BuildError) -> BuildError {
    queue.abort();

    while let Some((task, error)) = queue.wait() {
        if let Some(error) = error {
            tracing::info!("Skipped {}: {error}", task.log_name());
        }
    }

    error
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use camino::{Utf8Path, Utf8PathBuf};

    use super::*;
    use crate::builder::GraphBuilder;
    use crate::cache::{Artifact, BuildContext};
    use crate::error::{ExecError, GraphError};
    use crate::executor::ExecutorRegistry;
    use crate::task::{InfluenceRegistry, TaskRegistry, TaskSpec};
    use crate::utils::Params;

    struct Spec {
        name: String,
        requires: Vec<String>,
        fail: bool,
    }

    impl TaskSpec for Spec {
        fn name(&self) -> &str {
            &self.name
        }

        fn parameters(&self) -> Params {
            Params::new()
        }

        fn requires(&self) -> Vec<String> {
            self.requires.clone()
        }

        fn work_dir(&self) -> Utf8PathBuf {
            ".".into()
        }

        fn run(&self, _: &mut dyn BuildContext) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("boom")
            }
            Ok(())
        }

        fn publish(&self, _: &mut dyn Artifact) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Registry {
        decls: HashMap<&'static str, (Vec<&'static str>, bool)>,
    }

    impl Registry {
        fn new(decls: &[(&'static str, &[&'static str], bool)]) -> Arc<Self> {
            Arc::new(Self {
                decls: decls
                    .iter()
                    .map(|(name, reqs, fail)| (*name, (reqs.to_vec(), *fail)))
                    .collect(),
            })
        }
    }

    impl TaskRegistry for Registry {
        fn get(&self, name: &str) -> Result<Arc<dyn TaskSpec>, GraphError> {
            let (requires, fail) = self
                .decls
                .get(name)
                .ok_or_else(|| GraphError::UnknownTask(name.to_string()))?;

            Ok(Arc::new(Spec {
                name: name.to_string(),
                requires: requires.iter().map(|r| r.to_string()).collect(),
                fail: *fail,
            }))
        }
    }

    struct OkContext;

    impl BuildContext for OkContext {
        fn path(&self) -> &Utf8Path {
            Utf8Path::new(".")
        }
    }

    struct OkArtifact;

    impl Artifact for OkArtifact {
        fn path(&self) -> &Utf8Path {
            Utf8Path::new(".")
        }

        fn commit(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Cache double recording which tasks leased a build context, i.e.
    /// which tasks actually executed.
    struct RecordingCache {
        executed: Mutex<Vec<String>>,
        local: Vec<&'static str>,
    }

    impl RecordingCache {
        fn shared() -> Arc<Self> {
            Self::with_local(&[])
        }

        fn with_local(local: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                executed: Mutex::new(Vec::new()),
                local: local.to_vec(),
            })
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    impl ArtifactCache for RecordingCache {
        fn is_available_locally(&self, node: &TaskNode) -> bool {
            self.local.contains(&node.qualified_name())
        }

        fn is_available_remotely(&self, _: &TaskNode) -> bool {
            false
        }

        fn download(&self, _: &TaskNode) -> anyhow::Result<()> {
            Ok(())
        }

        fn upload(&self, _: &TaskNode, _: bool) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn context(&self, node: &TaskNode) -> anyhow::Result<Box<dyn BuildContext>> {
            self.executed
                .lock()
                .unwrap()
                .push(node.qualified_name().to_string());
            Ok(Box::new(OkContext))
        }

        fn artifact(&self, _: &TaskNode) -> anyhow::Result<Box<dyn Artifact>> {
            Ok(Box::new(OkArtifact))
        }
    }

    fn graph(registry: &Arc<Registry>, roots: &[&str]) -> Graph {
        let builder = GraphBuilder::new(
            registry.clone(),
            Arc::new(InfluenceRegistry::default()),
        );
        let initial = roots
            .iter()
            .map(|root| registry.get(root).unwrap())
            .collect();
        builder.build(initial).unwrap()
    }

    #[test]
    fn test_chain_runs_dependencies_first() {
        let registry = Registry::new(&[
            ("a", &["b"], false),
            ("b", &["c"], false),
            ("c", &[], false),
        ]);
        let graph = graph(&registry, &["a"]);
        let cache = RecordingCache::shared();
        let shared: Arc<dyn ArtifactCache> = cache.clone();
        let mut queue = TaskQueue::new(ExecutorRegistry::local(false));

        run_build(&graph, &shared, &mut queue).unwrap();
        assert_eq!(cache.executed(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_diamond_respects_dependencies() {
        let registry = Registry::new(&[
            ("app", &["lib_a", "lib_b"], false),
            ("lib_a", &["base"], false),
            ("lib_b", &["base"], false),
            ("base", &[], false),
        ]);
        let graph = graph(&registry, &["app"]);
        let cache = RecordingCache::shared();
        let shared: Arc<dyn ArtifactCache> = cache.clone();
        let mut queue = TaskQueue::new(ExecutorRegistry::local(false));

        run_build(&graph, &shared, &mut queue).unwrap();

        let executed = cache.executed();
        assert_eq!(executed.len(), 4);
        assert_eq!(executed.first().map(String::as_str), Some("base"));
        assert_eq!(executed.last().map(String::as_str), Some("app"));
    }

    #[test]
    fn test_failure_aborts_and_skips_dependents() {
        let registry = Registry::new(&[
            ("a", &["b"], false),
            ("b", &["c"], true),
            ("c", &[], false),
        ]);
        let graph = graph(&registry, &["a"]);
        let cache = RecordingCache::shared();
        let shared: Arc<dyn ArtifactCache> = cache.clone();
        let mut queue = TaskQueue::new(ExecutorRegistry::local(false));

        let error = run_build(&graph, &shared, &mut queue).unwrap_err();
        assert!(matches!(
            error,
            BuildError::Exec(ExecError::Userland { task, .. }) if task == "b"
        ));

        // c ran, b failed mid-body, a was never submitted.
        assert_eq!(cache.executed(), vec!["c", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_prune_satisfied_skips_cached_subtree() {
        let registry = Registry::new(&[
            ("a", &["b"], false),
            ("b", &["c"], false),
            ("c", &[], false),
        ]);
        let mut graph = graph(&registry, &["a"]);
        let cache = RecordingCache::with_local(&["b", "c"]);
        let shared: Arc<dyn ArtifactCache> = cache.clone();

        prune_satisfied(&mut graph, shared.as_ref());
        assert_eq!(graph.len(), 1);

        let mut queue = TaskQueue::new(ExecutorRegistry::local(false));
        run_build(&graph, &shared, &mut queue).unwrap();
        assert_eq!(cache.executed(), vec!["a"]);
    }

    #[test]
    fn test_empty_graph_is_a_successful_build() {
        let cache = RecordingCache::shared();
        let shared: Arc<dyn ArtifactCache> = cache.clone();
        let mut queue = TaskQueue::new(ExecutorRegistry::local(false));

        run_build(&Graph::new(), &shared, &mut queue).unwrap();
        assert!(cache.executed().is_empty());
    }

    #[test]
    fn test_routing_failure_surfaces_as_build_error() {
        let registry = Registry::new(&[("a", &[], false)]);
        let graph = graph(&registry, &["a"]);
        let cache = RecordingCache::shared();
        let shared: Arc<dyn ArtifactCache> = cache.clone();

        // No factories registered at all.
        let mut queue = TaskQueue::new(ExecutorRegistry::new(false));
        assert!(matches!(
            run_build(&graph, &shared, &mut queue),
            Err(BuildError::Scheduler(_))
        ));
    }
}
