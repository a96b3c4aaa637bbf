//! In-flight execution bookkeeping for the coordinator thread.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::cache::ArtifactCache;
use crate::error::{ExecError, SchedulerError};
use crate::executor::{Completion, ExecutionHandle, ExecutorRegistry};
use crate::node::TaskNode;

/// Tracks every submitted-but-not-yet-drained execution.
///
/// One coordinator thread owns the queue: it submits ready tasks, blocks
/// in [`TaskQueue::wait`] for completions and decides on the first failure
/// whether to [`TaskQueue::abort`]. Worker pools deliver completions over
/// an internal channel, so the handle map itself needs no locking.
pub struct TaskQueue {
    registry: ExecutorRegistry,
    done: Sender<Completion>,
    completions: Receiver<Completion>,
    in_flight: HashMap<u64, (ExecutionHandle, Arc<TaskNode>)>,
    next_id: u64,
}

impl TaskQueue {
    pub fn new(registry: ExecutorRegistry) -> Self {
        let (done, completions) = crossbeam_channel::unbounded();

        Self {
            registry,
            done,
            completions,
            in_flight: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Route the task to an executor and queue it on that executor's pool.
    pub fn submit(
        &mut self,
        cache: &Arc<dyn ArtifactCache>,
        task: &Arc<TaskNode>,
    ) -> Result<(), SchedulerError> {
        let (factory, executor) = self.registry.create(cache, task)?;

        let id = self.next_id;
        self.next_id += 1;

        let handle = factory.pool().submit(id, executor, self.done.clone())?;
        self.in_flight.insert(id, (handle, task.clone()));

        tracing::debug!("Queued {}", task.log_name());
        Ok(())
    }

    /// Block until one in-flight execution finishes and return it together
    /// with its error, if any. Returns `None` immediately when nothing is
    /// in flight.
    pub fn wait(&mut self) -> Option<(Arc<TaskNode>, Option<ExecError>)> {
        if self.in_flight.is_empty() {
            return None;
        }

        loop {
            // Every accepted job reports exactly once, even when cancelled,
            // so a non-empty map guarantees a pending completion.
            let (id, execution, result) = self.completions.recv().ok()?;

            if let Some((_, task)) = self.in_flight.remove(&id) {
                if result.is_ok() {
                    tracing::info!(
                        "Execution finished {} in {:.2?}",
                        task.log_name(),
                        execution.duration,
                    );
                }
                return Some((task, result.err()));
            }
        }
    }

    /// Request cancellation of everything in flight and stop the worker
    /// pools, blocking until they drain. Already-running bodies finish on
    /// their own; their completions (and the cancellations) stay queued
    /// for [`TaskQueue::wait`].
    pub fn abort(&mut self) {
        for (handle, task) in self.in_flight.values() {
            tracing::info!("Execution cancelled {}", task.log_name());
            handle.cancel();
        }

        self.registry.shutdown();
    }

    /// Stop the worker pools after a normal drain.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }

    pub fn in_progress(&self, task: &Arc<TaskNode>) -> bool {
        self.in_flight
            .values()
            .any(|(_, queued)| Arc::ptr_eq(queued, task))
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}
