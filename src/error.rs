use thiserror::Error;

/// Errors raised while constructing or finalizing the task graph.
///
/// These are synchronous failures: they are returned directly from
/// [`GraphBuilder::build`](crate::GraphBuilder::build) before any task has
/// been scheduled.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cycle detected in task graph: {}", members.join(" -> "))]
    Cyclic { members: Vec<String> },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("identity of '{0}' accessed before finalization")]
    IdentityUnset(String),

    #[error("task '{0}' finalized twice")]
    AlreadyFinalized(String),

    #[error("failed to collect influence for '{task}'")]
    Influence {
        task: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Per-task execution failures.
///
/// These are captured at the worker pool boundary and surfaced through
/// [`TaskQueue::wait`](crate::TaskQueue::wait), never propagated as a panic
/// across the submission boundary.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The task body's `run` or `publish` failed.
    #[error("task '{task}' failed:\n{source}")]
    Userland {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// A cache operation other than upload failed.
    #[error("cache operation failed for '{task}':\n{source}")]
    Cache {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// The remote execution backend failed.
    #[error("remote execution failed for '{task}':\n{source}")]
    Remote {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// The artifact could not be uploaded after a successful (or cached)
    /// execution. Treated as a build failure to avoid silent cache misses
    /// downstream.
    #[error("failed to upload artifact for '{0}'")]
    Upload(String),

    /// The task's handle was cancelled before its body started.
    #[error("execution cancelled for '{0}'")]
    Cancelled(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while routing or submitting tasks to executors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No registered factory accepted the task.
    #[error("no executor accepts task '{0}'")]
    NoExecutor(String),

    /// The worker pool was already shut down.
    #[error("worker pool is shut down")]
    PoolShutDown,
}

/// Top-level error returned by the build driver.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}
