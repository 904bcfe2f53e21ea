//! The execution controller: where executions are started and which runtime
//! their drivers, timers and blocking work run on.

use super::execution::ExecutionBuilder;
use super::interceptor::ExecInterceptor;
use super::promise::Promise;
use crate::core::{ExecError, ExecResult};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Settings for a controller that owns its runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Number of compute worker threads. Defaults to the available parallelism.
    pub worker_threads: usize,
    /// Upper bound for the blocking pool used by [`Blocking`](crate::Blocking).
    pub max_blocking_threads: usize,
    /// Name given to runtime threads.
    pub thread_name: String,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_parallelism(),
            max_blocking_threads: 512,
            thread_name: "praxis-compute".to_string(),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Starts executions and hands out the runtime they run on.
///
/// Cloning is cheap. A controller built with [`ExecController::builder`]
/// owns its runtime and shuts it down in the background when the last clone
/// created by the builder is dropped; executions only hold a non-owning
/// handle.
#[derive(Clone)]
pub struct ExecController {
    shared: Arc<Shared>,
    runtime: Option<Arc<OwnedRuntime>>,
}

struct Shared {
    handle: Handle,
    workers: usize,
    next_worker: AtomicUsize,
    active: AtomicUsize,
    interceptors: ArcSwap<Vec<Arc<dyn ExecInterceptor>>>,
}

impl Shared {
    fn new(handle: Handle, workers: usize) -> Self {
        Self {
            handle,
            workers,
            next_worker: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            interceptors: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            debug!("shutting down controller runtime");
            runtime.shutdown_background();
        }
    }
}

impl ExecController {
    pub fn builder() -> ExecControllerBuilder {
        ExecControllerBuilder::default()
    }

    /// Adopts the tokio runtime the caller is running on.
    pub fn current() -> Result<Self, ExecError> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|_| ExecError::Unmanaged)
    }

    /// Adopts an existing runtime without taking ownership of it.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            shared: Arc::new(Shared::new(handle, default_parallelism())),
            runtime: None,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.shared.handle
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers
    }

    /// Executions started on this controller that have not finished yet.
    pub fn active_executions(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Registers an interceptor for every execution started on this
    /// controller (or a clone of it) from now on. Interceptors registered
    /// first wrap the ones registered later.
    pub fn add_interceptor(&self, interceptor: impl ExecInterceptor) {
        let interceptor: Arc<dyn ExecInterceptor> = Arc::new(interceptor);
        self.shared.interceptors.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(interceptor.clone());
            next
        });
    }

    pub(crate) fn interceptors(&self) -> Arc<Vec<Arc<dyn ExecInterceptor>>> {
        self.shared.interceptors.load_full()
    }

    /// Starts configuring a new execution.
    pub fn fork(&self) -> ExecutionBuilder {
        ExecutionBuilder::new(self.clone())
    }

    /// Runs `promise` in a new execution and resolves with its result.
    ///
    /// This is the bridge from plain async code (and tests) into the
    /// execution model.
    pub async fn yield_single<T: Send + 'static>(&self, promise: Promise<T>) -> ExecResult<T> {
        let (tx, rx) = oneshot::channel();
        self.fork().start(move |_| {
            promise.result(move |result| {
                let _ = tx.send(result);
            });
            Ok(())
        });
        rx.await.unwrap_or(ExecResult::Error(ExecError::Abandoned))
    }

    /// Blocks the calling thread on `future` using the owned runtime.
    ///
    /// Fails with [`ExecError::IllegalState`] on controllers that adopted a
    /// runtime they do not own.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, ExecError> {
        match self.runtime.as_ref().and_then(|owned| owned.0.as_ref()) {
            Some(runtime) => Ok(runtime.block_on(future)),
            None => Err(ExecError::IllegalState(
                "block_on requires a controller that owns its runtime".to_string(),
            )),
        }
    }

    /// A clone that does not keep an owned runtime alive.
    pub(crate) fn detached(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            runtime: None,
        }
    }

    pub(crate) fn next_worker(&self) -> usize {
        self.shared.next_worker.fetch_add(1, Ordering::Relaxed) % self.shared.workers.max(1)
    }

    pub(crate) fn execution_started(&self) {
        self.shared.active.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn execution_finished(&self) {
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ExecController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecController")
            .field("workers", &self.shared.workers)
            .field("active", &self.active_executions())
            .field("owns_runtime", &self.runtime.is_some())
            .finish()
    }
}

/// Builds a controller that owns a multi-threaded runtime.
///
/// # Example
///
/// ```no_run
/// use praxis::{ExecController, Promise};
///
/// let controller = ExecController::builder()
///     .worker_threads(2)
///     .thread_name("jobs")
///     .build()?;
/// let result = controller.block_on(controller.yield_single(Promise::value(5)))?;
/// assert_eq!(result.into_value(), Some(5));
/// # Ok::<(), praxis::ExecError>(())
/// ```
#[derive(Debug, Default)]
pub struct ExecControllerBuilder {
    config: ExecConfig,
}

impl ExecControllerBuilder {
    pub fn config(mut self, config: ExecConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    pub fn max_blocking_threads(mut self, n: usize) -> Self {
        self.config.max_blocking_threads = n;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<ExecController, ExecError> {
        let config = self.config;
        let workers = config.worker_threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .max_blocking_threads(config.max_blocking_threads.max(1))
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()
            .map_err(ExecError::failed)?;

        info!(
            workers,
            max_blocking_threads = config.max_blocking_threads,
            thread_name = %config.thread_name,
            "execution controller started"
        );

        Ok(ExecController {
            shared: Arc::new(Shared::new(runtime.handle().clone(), workers)),
            runtime: Some(Arc::new(OwnedRuntime(Some(runtime)))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ExecConfig::default();
        assert!(config.worker_threads >= 1);
        assert_eq!(config.max_blocking_threads, 512);
        assert_eq!(config.thread_name, "praxis-compute");
    }

    #[test]
    fn test_owned_runtime_block_on() {
        let controller = ExecController::builder()
            .worker_threads(2)
            .thread_name("praxis-test")
            .build()
            .unwrap();
        assert_eq!(controller.worker_count(), 2);

        let result = controller
            .block_on(controller.yield_single(Promise::value(20).map(|v| v + 1)))
            .unwrap();
        assert_eq!(result.into_value(), Some(21));
    }

    #[test]
    fn test_current_outside_runtime_is_unmanaged() {
        assert!(matches!(
            ExecController::current(),
            Err(ExecError::Unmanaged)
        ));
    }

    #[tokio::test]
    async fn test_block_on_requires_owned_runtime() {
        let controller = ExecController::current().unwrap();
        assert!(matches!(
            controller.block_on(async {}),
            Err(ExecError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_workers_assigned_round_robin() {
        let controller = ExecController::current().unwrap();
        let workers = controller.worker_count();
        let first = controller.fork().start(|_| Ok(()));
        let second = controller.fork().start(|_| Ok(()));
        first.completion().await;
        second.completion().await;
        assert_eq!(second.worker(), (first.worker() + 1) % workers);
    }
}
