//! Contracts consumed from the task declaration and influence subsystems.
//!
//! The core never parses declaration files itself. It receives ready-made
//! [`TaskSpec`] instances and resolves requirement names through a host
//! provided [`TaskRegistry`]. What makes two tasks' identities equal is
//! decided entirely by the [`InfluenceRegistry`] the host hands to the
//! [`GraphBuilder`](crate::GraphBuilder).

use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::cache::{Artifact, BuildContext};
use crate::error::GraphError;
use crate::utils::Params;

/// A named, parameterized unit of buildable work.
///
/// Created once per declaration instantiation; immutable after parameters
/// are bound.
pub trait TaskSpec: Send + Sync {
    /// Bare declaration name, without parameters.
    fn name(&self) -> &str;

    /// Parameters bound to this instantiation.
    fn parameters(&self) -> Params;

    /// Requirement names, possibly with embedded parameter syntax
    /// (`name:key=value,...`).
    fn requires(&self) -> Vec<String>;

    /// Whether the task's artifact may be stored in, and satisfied from,
    /// the cache. Uncacheable tasks always execute locally.
    fn is_cacheable(&self) -> bool {
        true
    }

    /// Directory the task body and influence collection run in.
    fn work_dir(&self) -> Utf8PathBuf;

    /// Execute the task against a build context leased from the cache.
    fn run(&self, context: &mut dyn BuildContext) -> anyhow::Result<()>;

    /// Publish the task's output into an artifact handle. The caller is
    /// responsible for committing the artifact afterwards.
    fn publish(&self, artifact: &mut dyn Artifact) -> anyhow::Result<()>;
}

/// Resolves requirement names to task declarations.
///
/// How the host implements this (factory map, code generation, ...) is out
/// of scope; the returned spec must have the requirement's parameters
/// already bound.
pub trait TaskRegistry: Send + Sync {
    fn get(&self, name: &str) -> Result<Arc<dyn TaskSpec>, GraphError>;
}

/// One source of identity-relevant input for a task.
///
/// Implementations append every declared influence (source text, bound
/// parameters, environment, explicit file dependencies) into the open
/// hasher, deterministically. Closures with a matching signature implement
/// this trait directly.
pub trait Influence: Send + Sync {
    fn apply(&self, task: &dyn TaskSpec, hasher: &mut blake3::Hasher) -> anyhow::Result<()>;
}

impl<F> Influence for F
where
    F: Fn(&dyn TaskSpec, &mut blake3::Hasher) -> anyhow::Result<()> + Send + Sync,
{
    fn apply(&self, task: &dyn TaskSpec, hasher: &mut blake3::Hasher) -> anyhow::Result<()> {
        self(task, hasher)
    }
}

/// Hashes the task's declaration shape: its name and canonical parameters.
///
/// Registered by default so that two differently named (or differently
/// parameterized) tasks never collide even when all other influences agree.
pub struct DeclarationInfluence;

impl Influence for DeclarationInfluence {
    fn apply(&self, task: &dyn TaskSpec, hasher: &mut blake3::Hasher) -> anyhow::Result<()> {
        hasher.update(task.name().as_bytes());
        for param in crate::utils::stable_params(&task.parameters()) {
            hasher.update(param.as_bytes());
        }
        Ok(())
    }
}

/// Ordered collection of influence sources, applied in registration order.
///
/// An explicit instance passed to the graph builder, so that two builders
/// in one process (or one test) can disagree about what influences
/// identity without leaking state into each other.
pub struct InfluenceRegistry {
    sources: Vec<Box<dyn Influence>>,
}

impl InfluenceRegistry {
    /// An empty registry. Most hosts want [`InfluenceRegistry::default`],
    /// which includes [`DeclarationInfluence`].
    pub fn empty() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    pub fn register(&mut self, source: Box<dyn Influence>) -> &mut Self {
        self.sources.push(source);
        self
    }

    pub(crate) fn apply_all(
        &self,
        task: &dyn TaskSpec,
        hasher: &mut blake3::Hasher,
    ) -> anyhow::Result<()> {
        for source in &self.sources {
            source.apply(task, hasher)?;
        }
        Ok(())
    }
}

impl Default for InfluenceRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(DeclarationInfluence));
        registry
    }
}
