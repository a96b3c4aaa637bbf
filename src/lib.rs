#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod build;
mod builder;
mod cache;
mod core;
mod error;
mod executor;
mod graph;
#[cfg(feature = "logging")]
mod logging;
mod node;
mod queue;
mod task;
mod utils;

// The influence contract hands implementors an open hasher.
pub use blake3;

pub use crate::build::{prune_satisfied, run_build};
pub use crate::builder::GraphBuilder;
pub use crate::cache::{Artifact, ArtifactCache, BuildContext};
pub use crate::core::Hash32;
pub use crate::error::{BuildError, ExecError, GraphError, SchedulerError};
pub use crate::executor::{
    Completion, ExecutionHandle, Executor, ExecutorFactory, ExecutorRegistry, LocalExecutor,
    LocalExecutorFactory, NetworkExecutor, NetworkExecutorExtension, NetworkExecutorFactory,
    RemoteBackend, TaskExecution, WorkerPool,
};
pub use crate::graph::{Graph, linearize};
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::node::TaskNode;
pub use crate::queue::TaskQueue;
pub use crate::task::{DeclarationInfluence, Influence, InfluenceRegistry, TaskRegistry, TaskSpec};
pub use crate::utils::{Params, format_task_name, parse_task_name, stable_params};
