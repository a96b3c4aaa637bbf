//! Contract consumed from the artifact cache.
//!
//! The storage implementation lives outside this crate. The core relies on
//! the cache guaranteeing that the leased [`BuildContext`] and [`Artifact`]
//! are exclusive to one task execution, and that availability checks,
//! uploads and downloads for different identities are safe to run in
//! parallel.

use camino::Utf8Path;

use crate::node::TaskNode;

/// Scratch state leased from the cache for one task execution.
pub trait BuildContext: Send {
    /// Directory holding intermediate build state for the task.
    fn path(&self) -> &Utf8Path;
}

/// Output artifact handle with explicit two-phase commit.
///
/// An artifact that is dropped without [`Artifact::commit`] must never be
/// reported as cached.
pub trait Artifact: Send {
    /// Directory the task publishes its output into.
    fn path(&self) -> &Utf8Path;

    fn commit(&mut self) -> anyhow::Result<()>;
}

/// Artifact cache keyed by task identity.
pub trait ArtifactCache: Send + Sync {
    fn is_available_locally(&self, node: &TaskNode) -> bool;

    fn is_available_remotely(&self, node: &TaskNode) -> bool;

    /// Fetch the node's artifact from remote storage into the local cache.
    fn download(&self, node: &TaskNode) -> anyhow::Result<()>;

    /// Push the node's artifact to remote storage. `Ok(false)` means the
    /// upload was rejected, which callers treat the same as an error.
    fn upload(&self, node: &TaskNode, force: bool) -> anyhow::Result<bool>;

    fn context(&self, node: &TaskNode) -> anyhow::Result<Box<dyn BuildContext>>;

    fn artifact(&self, node: &TaskNode) -> anyhow::Result<Box<dyn Artifact>>;
}
