//! End-to-end pipeline: declarations through graph building, identity
//! stabilization, scheduling and incremental rebuilds against an
//! in-memory artifact cache keyed by identity.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use karakuri::{
    Artifact, ArtifactCache, BuildContext, ExecutorRegistry, GraphBuilder, GraphError, Influence,
    InfluenceRegistry, Params, TaskNode, TaskQueue, TaskRegistry, TaskSpec, blake3,
    parse_task_name, prune_satisfied, run_build,
};

type Sources = Arc<Mutex<HashMap<String, String>>>;

struct Spec {
    name: String,
    params: Params,
    requires: Vec<String>,
}

impl TaskSpec for Spec {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Params {
        self.params.clone()
    }

    fn requires(&self) -> Vec<String> {
        self.requires.clone()
    }

    fn work_dir(&self) -> Utf8PathBuf {
        ".".into()
    }

    fn run(&self, _: &mut dyn BuildContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn publish(&self, _: &mut dyn Artifact) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Registry {
    decls: HashMap<&'static str, Vec<&'static str>>,
}

impl Registry {
    fn new(decls: &[(&'static str, &[&'static str])]) -> Arc<Self> {
        Arc::new(Self {
            decls: decls
                .iter()
                .map(|(name, reqs)| (*name, reqs.to_vec()))
                .collect(),
        })
    }
}

impl TaskRegistry for Registry {
    fn get(&self, requirement: &str) -> Result<Arc<dyn TaskSpec>, GraphError> {
        let (name, params) = parse_task_name(requirement);
        let requires = self
            .decls
            .get(name.as_str())
            .ok_or_else(|| GraphError::UnknownTask(requirement.to_string()))?;

        Ok(Arc::new(Spec {
            name,
            params,
            requires: requires.iter().map(|r| r.to_string()).collect(),
        }))
    }
}

struct MemContext;

impl BuildContext for MemContext {
    fn path(&self) -> &Utf8Path {
        Utf8Path::new(".")
    }
}

struct MemArtifact {
    key: String,
    stored: Arc<Mutex<HashSet<String>>>,
}

impl Artifact for MemArtifact {
    fn path(&self) -> &Utf8Path {
        Utf8Path::new(".")
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        self.stored.lock().unwrap().insert(self.key.clone());
        Ok(())
    }
}

/// Local-only cache storing committed artifacts under the task identity.
struct MemoryCache {
    stored: Arc<Mutex<HashSet<String>>>,
    executed: Mutex<Vec<String>>,
}

impl MemoryCache {
    fn shared() -> Arc<Self> {
        Arc::new(Self {
            stored: Arc::new(Mutex::new(HashSet::new())),
            executed: Mutex::new(Vec::new()),
        })
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn key(node: &TaskNode) -> String {
        node.identity().unwrap().to_hex()
    }
}

impl ArtifactCache for MemoryCache {
    fn is_available_locally(&self, node: &TaskNode) -> bool {
        self.stored.lock().unwrap().contains(&Self::key(node))
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
        Ok(Box::new(MemContext))
    }

    fn artifact(&self, node: &TaskNode) -> anyhow::Result<Box<dyn Artifact>> {
        Ok(Box::new(MemArtifact {
            key: Self::key(node),
            stored: self.stored.clone(),
        }))
    }
}

fn source_influence(sources: Sources) -> Box<dyn Influence> {
    Box::new(
        move |task: &dyn TaskSpec, hasher: &mut blake3::Hasher| -> anyhow::Result<()> {
            if let Some(text) = sources.lock().unwrap().get(task.name()) {
                hasher.update(text.as_bytes());
            }
            Ok(())
        },
    )
}

fn sources(entries: &[(&str, &str)]) -> Sources {
    Arc::new(Mutex::new(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    ))
}

fn build_graph(registry: &Arc<Registry>, sources: &Sources, roots: &[&str]) -> karakuri::Graph {
    let mut influences = InfluenceRegistry::default();
    influences.register(source_influence(sources.clone()));

    let builder = GraphBuilder::new(registry.clone(), Arc::new(influences));
    let initial = roots
        .iter()
        .map(|root| registry.get(root).unwrap())
        .collect();
    builder.build(initial).unwrap()
}

fn run(graph: &karakuri::Graph, cache: &Arc<MemoryCache>) {
    let shared: Arc<dyn ArtifactCache> = cache.clone();
    let mut queue = TaskQueue::new(ExecutorRegistry::local(false));
    run_build(graph, &shared, &mut queue).unwrap();
}

fn fixture() -> Arc<Registry> {
    Registry::new(&[
        ("app", &["lib:variant=fast", "lib:variant=small"]),
        ("lib", &["base"]),
        ("base", &[]),
    ])
}

#[test]
fn test_full_build_then_everything_cached() {
    let registry = fixture();
    let src = sources(&[("app", "a"), ("lib", "l"), ("base", "b")]);
    let cache = MemoryCache::shared();

    let graph = build_graph(&registry, &src, &["app"]);
    assert_eq!(graph.len(), 4);
    run(&graph, &cache);

    let executed = cache.executed();
    assert_eq!(executed.len(), 4);
    assert_eq!(executed.first().map(String::as_str), Some("base"));
    assert_eq!(executed.last().map(String::as_str), Some("app"));

    // Second build from scratch: identical identities, so the pruned
    // graph is empty and nothing executes again.
    let mut graph = build_graph(&registry, &src, &["app"]);
    prune_satisfied(&mut graph, cache.as_ref());
    assert!(graph.is_empty());

    run(&graph, &cache);
    assert_eq!(cache.executed().len(), 4);
}

#[test]
fn test_deep_change_rebuilds_every_ancestor() {
    let registry = fixture();
    let src = sources(&[("app", "a"), ("lib", "l"), ("base", "b")]);
    let cache = MemoryCache::shared();

    let graph = build_graph(&registry, &src, &["app"]);
    run(&graph, &cache);

    src.lock().unwrap().insert("base".into(), "b2".into());
    let mut graph = build_graph(&registry, &src, &["app"]);
    prune_satisfied(&mut graph, cache.as_ref());

    // Every identity changed, so the whole graph runs again.
    assert_eq!(graph.len(), 4);
    run(&graph, &cache);
    assert_eq!(cache.executed().len(), 8);
}

#[test]
fn test_root_change_rebuilds_only_the_root() {
    let registry = fixture();
    let src = sources(&[("app", "a"), ("lib", "l"), ("base", "b")]);
    let cache = MemoryCache::shared();

    let graph = build_graph(&registry, &src, &["app"]);
    run(&graph, &cache);

    src.lock().unwrap().insert("app".into(), "a2".into());
    let mut graph = build_graph(&registry, &src, &["app"]);
    prune_satisfied(&mut graph, cache.as_ref());

    assert_eq!(graph.len(), 1);
    run(&graph, &cache);

    let executed = cache.executed();
    assert_eq!(executed.len(), 5);
    assert_eq!(executed.last().map(String::as_str), Some("app"));
}

#[test]
fn test_identities_stable_across_builds() {
    let registry = fixture();
    let src = sources(&[("app", "a"), ("lib", "l"), ("base", "b")]);

    let first = build_graph(&registry, &src, &["app"]);
    let second = build_graph(&registry, &src, &["app"]);

    for node in first.nodes() {
        let twin = second.get(node.qualified_name()).unwrap();
        assert_eq!(node.identity().unwrap(), twin.identity().unwrap());
    }
}

#[test]
fn test_parameterized_instances_have_distinct_identities() {
    let registry = fixture();
    let src = sources(&[("app", "a"), ("lib", "l"), ("base", "b")]);
    let graph = build_graph(&registry, &src, &["app"]);

    let fast = graph.get("lib:variant=fast").unwrap();
    let small = graph.get("lib:variant=small").unwrap();
    assert_ne!(fast.identity().unwrap(), small.identity().unwrap());
}
