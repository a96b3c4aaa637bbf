//! Execution strategies and their worker pools.
//!
//! Every [`ExecutorFactory`] owns a pool of worker threads; submitting an
//! executor hands its task to that pool and returns a cancellable handle.
//! The built-in local factory runs a single worker, so local task bodies
//! execute strictly one at a time even while submission and bookkeeping
//! stay concurrent. Routing between factories is the job of
//! [`ExecutorRegistry`], an explicit instance owned by the caller.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::cache::ArtifactCache;
use crate::error::{ExecError, SchedulerError};
use crate::node::TaskNode;

/// When one execution started on its worker and how long it took.
#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// One finished execution: the handle id it belongs to, its timing and
/// its outcome.
pub type Completion = (u64, TaskExecution, Result<(), ExecError>);

struct Job {
    id: u64,
    cancelled: Arc<AtomicBool>,
    executor: Box<dyn Executor>,
    done: Sender<Completion>,
}

/// Cancellable reference to one submitted execution.
///
/// Cancellation is cooperative: a body that already started runs to
/// completion, a body that has not started yet reports
/// [`ExecError::Cancelled`] instead of running.
pub struct ExecutionHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Fixed-size pool of worker threads draining a job channel.
pub struct WorkerPool {
    jobs: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..workers)
            .map(|_| {
                let jobs = receiver.clone();
                std::thread::spawn(move || worker(jobs))
            })
            .collect();

        Self {
            jobs: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue an executor for asynchronous execution. Its completion is
    /// delivered on `done` under the given id.
    pub fn submit(
        &self,
        id: u64,
        executor: Box<dyn Executor>,
        done: Sender<Completion>,
    ) -> Result<ExecutionHandle, SchedulerError> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let job = Job {
            id,
            cancelled: cancelled.clone(),
            executor,
            done,
        };

        match self.jobs.lock().unwrap().as_ref() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| SchedulerError::PoolShutDown)?,
            None => return Err(SchedulerError::PoolShutDown),
        }

        Ok(ExecutionHandle { id, cancelled })
    }

    /// Close the job channel and join every worker. Queued jobs still run
    /// (or report cancellation); calling this twice is a no-op.
    pub fn shutdown(&self) {
        self.jobs.lock().unwrap().take();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker(jobs: Receiver<Job>) {
    for job in jobs {
        let task = job.executor.task().clone();
        let start = Instant::now();

        let result = if job.cancelled.load(Ordering::SeqCst) {
            Err(ExecError::Cancelled(task.qualified_name().to_string()))
        } else {
            tracing::info!("Execution started {}", task.log_name());

            // A panicking task body must not take the worker thread down;
            // it is reported as that task's failure instead.
            catch_unwind(AssertUnwindSafe(|| job.executor.execute())).unwrap_or_else(|panic| {
                Err(ExecError::Userland {
                    task: task.qualified_name().to_string(),
                    source: anyhow::anyhow!("task panicked: {}", panic_message(&panic)),
                })
            })
        };

        let execution = TaskExecution {
            start,
            duration: start.elapsed(),
        };

        // The coordinator may already be gone during shutdown.
        let _ = job.done.send((job.id, execution, result));
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// A strategy for running one task.
pub trait Executor: Send {
    fn task(&self) -> &Arc<TaskNode>;

    fn execute(self: Box<Self>) -> Result<(), ExecError>;
}

/// Runs the task body in-process against the local cache.
pub struct LocalExecutor {
    cache: Arc<dyn ArtifactCache>,
    task: Arc<TaskNode>,
    force_upload: bool,
}

impl Executor for LocalExecutor {
    fn task(&self) -> &Arc<TaskNode> {
        &self.task
    }

    fn execute(self: Box<Self>) -> Result<(), ExecError> {
        tracing::debug!("Executing {} locally", self.task.log_name());
        self.task.run(self.cache.as_ref(), self.force_upload)
    }
}

/// External remote execution service. No protocol is assumed here; the
/// backend runs the task somewhere and makes its artifact remotely
/// available under the task's identity.
pub trait RemoteBackend: Send + Sync {
    fn execute(&self, task: &TaskNode, parameters: &BTreeMap<String, String>)
    -> anyhow::Result<()>;
}

/// Delegates the task to a [`RemoteBackend`], then pulls the artifact into
/// the local cache.
pub struct NetworkExecutor {
    backend: Arc<dyn RemoteBackend>,
    cache: Arc<dyn ArtifactCache>,
    task: Arc<TaskNode>,
    parameters: BTreeMap<String, String>,
}

impl Executor for NetworkExecutor {
    fn task(&self) -> &Arc<TaskNode> {
        &self.task
    }

    fn execute(self: Box<Self>) -> Result<(), ExecError> {
        tracing::debug!("Executing {} remotely", self.task.log_name());

        self.backend
            .execute(&self.task, &self.parameters)
            .map_err(|source| ExecError::Remote {
                task: self.task.qualified_name().to_string(),
                source,
            })?;

        if !self.cache.is_available_locally(&self.task) {
            self.cache
                .download(&self.task)
                .map_err(|source| ExecError::Cache {
                    task: self.task.qualified_name().to_string(),
                    source,
                })?;
        }

        Ok(())
    }
}

/// Produces executors of one kind and owns the pool they run on.
pub trait ExecutorFactory: Send + Sync {
    fn is_network(&self) -> bool {
        false
    }

    fn is_eligible(&self, cache: &dyn ArtifactCache, task: &TaskNode) -> bool;

    fn create(
        &self,
        cache: Arc<dyn ArtifactCache>,
        task: Arc<TaskNode>,
        parameters: BTreeMap<String, String>,
    ) -> Box<dyn Executor>;

    fn pool(&self) -> &WorkerPool;
}

/// The default execution strategy: a single worker serializing all local
/// builds.
pub struct LocalExecutorFactory {
    pool: WorkerPool,
    force_upload: bool,
}

impl LocalExecutorFactory {
    pub fn new(force_upload: bool) -> Self {
        Self {
            pool: WorkerPool::new(1),
            force_upload,
        }
    }
}

impl ExecutorFactory for LocalExecutorFactory {
    fn is_eligible(&self, _: &dyn ArtifactCache, _: &TaskNode) -> bool {
        true
    }

    fn create(
        &self,
        cache: Arc<dyn ArtifactCache>,
        task: Arc<TaskNode>,
        _: BTreeMap<String, String>,
    ) -> Box<dyn Executor> {
        Box::new(LocalExecutor {
            cache,
            task,
            force_upload: self.force_upload,
        })
    }

    fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

pub struct NetworkExecutorFactory {
    pool: WorkerPool,
    backend: Arc<dyn RemoteBackend>,
}

impl NetworkExecutorFactory {
    pub fn new(backend: Arc<dyn RemoteBackend>, workers: usize) -> Self {
        Self {
            pool: WorkerPool::new(workers),
            backend,
        }
    }
}

impl ExecutorFactory for NetworkExecutorFactory {
    fn is_network(&self) -> bool {
        true
    }

    fn is_eligible(&self, _: &dyn ArtifactCache, _: &TaskNode) -> bool {
        true
    }

    fn create(
        &self,
        cache: Arc<dyn ArtifactCache>,
        task: Arc<TaskNode>,
        parameters: BTreeMap<String, String>,
    ) -> Box<dyn Executor> {
        Box::new(NetworkExecutor {
            backend: self.backend.clone(),
            cache,
            task,
            parameters,
        })
    }

    fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

/// Contributes extra per-task parameters to network executions, e.g.
/// toolchain or platform requirements a remote worker must satisfy.
pub trait NetworkExecutorExtension: Send + Sync {
    fn parameters(&self, task: &TaskNode) -> BTreeMap<String, String>;
}

/// Ordered collection of executor factories with routing rules.
///
/// Registration order determines priority: the most recently registered
/// factory is consulted first, so plugins can layer custom strategies
/// ahead of the defaults.
pub struct ExecutorRegistry {
    factories: Vec<Arc<dyn ExecutorFactory>>,
    extensions: Vec<Arc<dyn NetworkExecutorExtension>>,
    network: bool,
}

impl ExecutorRegistry {
    /// An empty registry. `network` globally enables or disables routing
    /// to network factories.
    pub fn new(network: bool) -> Self {
        Self {
            factories: Vec::new(),
            extensions: Vec::new(),
            network,
        }
    }

    /// Local-only registry with the default single-worker factory.
    pub fn local(force_upload: bool) -> Self {
        let mut registry = Self::new(false);
        registry.register(Arc::new(LocalExecutorFactory::new(force_upload)));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn ExecutorFactory>) -> &mut Self {
        self.factories.insert(0, factory);
        self
    }

    pub fn register_extension(&mut self, extension: Arc<dyn NetworkExecutorExtension>) -> &mut Self {
        self.extensions.push(extension);
        self
    }

    /// Pick a factory for the task and instantiate its executor.
    ///
    /// Routing rules, applied to each factory in priority order:
    /// uncacheable tasks never go to a network factory; network factories
    /// are skipped entirely when network execution is disabled; with
    /// network execution enabled, cacheable tasks are never handed to a
    /// non-network factory; the first remaining factory whose
    /// `is_eligible` holds wins.
    pub fn create(
        &self,
        cache: &Arc<dyn ArtifactCache>,
        task: &Arc<TaskNode>,
    ) -> Result<(Arc<dyn ExecutorFactory>, Box<dyn Executor>), SchedulerError> {
        let factory = self.select(cache.as_ref(), task)?;

        let parameters = if factory.is_network() {
            self.network_parameters(task)
        } else {
            BTreeMap::new()
        };

        let executor = factory.create(cache.clone(), task.clone(), parameters);
        Ok((factory, executor))
    }

    fn select(
        &self,
        cache: &dyn ArtifactCache,
        task: &TaskNode,
    ) -> Result<Arc<dyn ExecutorFactory>, SchedulerError> {
        for factory in &self.factories {
            if factory.is_network() && !task.is_cacheable() {
                continue;
            }
            if factory.is_network() && !self.network {
                continue;
            }
            if !factory.is_network() && self.network && task.is_cacheable() {
                continue;
            }
            if !factory.is_eligible(cache, task) {
                continue;
            }
            return Ok(factory.clone());
        }

        Err(SchedulerError::NoExecutor(task.qualified_name().to_string()))
    }

    /// Merged parameter set contributed by all registered extensions.
    pub fn network_parameters(&self, task: &TaskNode) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for extension in &self.extensions {
            merged.extend(extension.parameters(task));
        }
        merged
    }

    /// Stop every factory's worker pool. Used on abort and on normal
    /// completion.
    pub fn shutdown(&self) {
        for factory in &self.factories {
            factory.pool().shutdown();
        }
    }
}
