use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use crate::cache::ArtifactCache;
use crate::core::{ArcStr, Hash32};
use crate::error::{ExecError, GraphError};
use crate::graph::Graph;
use crate::task::{InfluenceRegistry, TaskSpec};
use crate::utils::{ScopedCwd, format_task_name};

/// State a node gains exactly once, during graph stabilization.
struct Finalized {
    /// Every node reachable through requirement edges, sorted by qualified
    /// name for deterministic hashing.
    children: Vec<Arc<TaskNode>>,
    /// Qualified names of every node that (transitively) requires this one.
    ancestors: HashSet<ArcStr>,
    identity: Hash32,
}

/// One task declaration placed in the dependency graph.
///
/// A node's identity is a content hash over the task's own influences plus
/// the identities of all of its dependencies, so it changes whenever any
/// transitive dependency changes. The identity is computed at most once,
/// by [`TaskNode::finalize`], and only after every child has been
/// finalized; the graph builder guarantees that ordering.
pub struct TaskNode {
    spec: Arc<dyn TaskSpec>,
    name: ArcStr,
    qualified_name: ArcStr,
    finalized: OnceLock<Finalized>,
}

impl TaskNode {
    pub fn new(spec: Arc<dyn TaskSpec>) -> Self {
        let name: ArcStr = spec.name().into();
        let qualified_name: ArcStr = format_task_name(spec.name(), &spec.parameters()).into();

        Self {
            spec,
            name,
            qualified_name,
            finalized: OnceLock::new(),
        }
    }

    /// Bare declaration name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name plus canonicalized parameters; display name and tie-break key.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub(crate) fn qualified_name_arc(&self) -> ArcStr {
        self.qualified_name.clone()
    }

    pub fn spec(&self) -> &Arc<dyn TaskSpec> {
        &self.spec
    }

    pub fn is_cacheable(&self) -> bool {
        self.spec.is_cacheable()
    }

    /// Qualified name plus the identity prefix, used in every log line so
    /// that identically named parameterized instances stay distinguishable.
    pub fn log_name(&self) -> String {
        match self.finalized.get() {
            Some(state) => format!("({} {})", self.qualified_name, state.identity.to_hex_short()),
            None => format!("({} ????????)", self.qualified_name),
        }
    }

    /// The node's content hash; the sole cache key.
    ///
    /// Returns [`GraphError::IdentityUnset`] before [`TaskNode::finalize`]
    /// has run.
    pub fn identity(&self) -> Result<Hash32, GraphError> {
        self.finalized
            .get()
            .map(|state| state.identity)
            .ok_or_else(|| GraphError::IdentityUnset(self.qualified_name.to_string()))
    }

    /// All transitive dependencies, sorted by qualified name.
    pub fn children(&self) -> Result<&[Arc<TaskNode>], GraphError> {
        self.finalized
            .get()
            .map(|state| state.children.as_slice())
            .ok_or_else(|| GraphError::IdentityUnset(self.qualified_name.to_string()))
    }

    pub fn has_children(&self) -> bool {
        self.finalized
            .get()
            .is_some_and(|state| !state.children.is_empty())
    }

    pub fn has_ancestors(&self) -> bool {
        self.finalized
            .get()
            .is_some_and(|state| !state.ancestors.is_empty())
    }

    /// Stabilize the node: record its descendant and ancestor sets and
    /// compute the identity.
    ///
    /// Must be invoked in reverse topological order, deepest dependency
    /// first, so every child identity is final when the parent hashes it.
    /// A second call is an error.
    pub fn finalize(
        &self,
        graph: &Graph,
        influences: &InfluenceRegistry,
    ) -> Result<Hash32, GraphError> {
        if self.finalized.get().is_some() {
            return Err(GraphError::AlreadyFinalized(self.qualified_name.to_string()));
        }

        let mut children = graph.descendants(self);
        children.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));

        let ancestors = graph
            .ancestors(self)
            .into_iter()
            .map(|node| node.qualified_name_arc())
            .collect();

        let mut hasher = blake3::Hasher::new();
        influences
            .apply_all(self.spec.as_ref(), &mut hasher)
            .map_err(|source| GraphError::Influence {
                task: self.qualified_name.to_string(),
                source,
            })?;

        for child in &children {
            hasher.update(child.identity()?.as_bytes());
        }

        let identity = Hash32::from(<[u8; 32]>::from(hasher.finalize()));

        self.finalized
            .set(Finalized {
                children,
                ancestors,
                identity,
            })
            .map_err(|_| GraphError::AlreadyFinalized(self.qualified_name.to_string()))?;

        tracing::debug!("Finalized {}", self.log_name());
        Ok(identity)
    }

    /// Execute the node against the cache.
    ///
    /// Downloads the artifact when it is already available remotely,
    /// otherwise runs the task body and publishes its output, then
    /// unconditionally uploads. A failed upload aborts the task even when
    /// execution itself succeeded.
    pub fn run(&self, cache: &dyn ArtifactCache, force_upload: bool) -> Result<(), ExecError> {
        if cache.is_available_remotely(self) && !cache.is_available_locally(self) {
            tracing::info!("Downloading artifact {}", self.log_name());
            cache.download(self).map_err(|source| ExecError::Cache {
                task: self.qualified_name.to_string(),
                source,
            })?;
        }

        if !cache.is_available_locally(self) {
            self.execute(cache)?;
        }

        match cache.upload(self, force_upload) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ExecError::Upload(self.qualified_name.to_string())),
            Err(source) => {
                tracing::error!("Upload failed {}: {source}", self.log_name());
                Err(ExecError::Upload(self.qualified_name.to_string()))
            }
        }
    }

    fn execute(&self, cache: &dyn ArtifactCache) -> Result<(), ExecError> {
        let task = || self.qualified_name.to_string();
        let work_dir = self.spec.work_dir();

        let mut context = cache.context(self).map_err(|source| ExecError::Cache {
            task: task(),
            source,
        })?;

        {
            let _cwd = ScopedCwd::enter(&work_dir)?;
            self.spec
                .run(context.as_mut())
                .map_err(|source| ExecError::Userland {
                    task: task(),
                    source,
                })?;
        }

        let mut artifact = cache.artifact(self).map_err(|source| ExecError::Cache {
            task: task(),
            source,
        })?;

        {
            let _cwd = ScopedCwd::enter(&work_dir)?;
            self.spec
                .publish(artifact.as_mut())
                .map_err(|source| ExecError::Userland {
                    task: task(),
                    source,
                })?;
        }

        // An uncommitted artifact must never count as cached.
        artifact.commit().map_err(|source| ExecError::Cache {
            task: task(),
            source,
        })?;

        Ok(())
    }
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("qualified_name", &self.qualified_name)
            .field("finalized", &self.finalized.get().is_some())
            .finish()
    }
}
