//! The execution: a single-writer unit of asynchronous work.
//!
//! An execution owns a queue of segments. A driver task pops one segment at a
//! time and runs it with the execution installed as the task-local current
//! execution, so segments of one execution never overlap. Promise results
//! produced on other threads are handed back as new segments (a resumption)
//! instead of being run on the producing thread.
//!
//! The execution finishes once no segment is queued and no resumption is
//! outstanding.

use super::controller::ExecController;
use super::downstream::Downstream;
use super::interceptor::{self, ExecInterceptor, ExecType, Interceptors};
use super::operation::Operation;
use super::promise::{connect, Promise, Upstream};
use crate::core::{panic_message, ExecError, ExecResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, debug_span, error, Instrument};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_EXECUTION: Execution;
}

/// Segments run back to back before the driver yields to the runtime.
const SEGMENTS_PER_YIELD: u32 = 64;

type Segment = Box<dyn FnOnce() -> Result<(), ExecError> + Send>;
type ErrorHandler = Arc<dyn Fn(ExecError) + Send + Sync>;
type Hook = Box<dyn FnOnce(&Execution) + Send>;
type Registered = Arc<dyn Any + Send + Sync>;

/// Unique identity of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle on a running (or finished) execution. Cheap to clone.
#[derive(Clone)]
pub struct Execution {
    inner: Arc<ExecutionInner>,
}

struct ExecutionInner {
    id: ExecutionId,
    parent: Option<ExecutionId>,
    worker: usize,
    controller: ExecController,
    segments: mpsc::UnboundedSender<Segment>,
    /// Resumptions handed out and not yet delivered.
    pending: AtomicUsize,
    registry: DashMap<TypeId, Vec<Registered>>,
    on_error: Option<ErrorHandler>,
    on_complete: Mutex<Option<Hook>>,
    completed: watch::Sender<bool>,
    interceptors: Interceptors,
}

impl Execution {
    /// Returns the execution running the calling code.
    ///
    /// Fails with [`ExecError::Unmanaged`] when called outside of any segment.
    pub fn current() -> Result<Execution, ExecError> {
        CURRENT_EXECUTION
            .try_with(Execution::clone)
            .map_err(|_| ExecError::Unmanaged)
    }

    pub fn current_opt() -> Option<Execution> {
        Self::current().ok()
    }

    /// True when the calling code runs inside an execution segment.
    pub fn is_active() -> bool {
        CURRENT_EXECUTION.try_with(|_| ()).is_ok()
    }

    /// Starts configuring a new execution on the controller of the current
    /// execution, or on the current tokio runtime when called from plain
    /// async code.
    pub fn fork() -> Result<ExecutionBuilder, ExecError> {
        let controller = match Self::current_opt() {
            Some(exec) => exec.controller().clone(),
            None => ExecController::current()?,
        };
        Ok(controller.fork())
    }

    /// An operation that completes after `duration` without blocking a thread.
    pub fn sleep(duration: Duration) -> Operation {
        Promise::on_execution(move |exec, down: Downstream<()>| {
            exec.controller().handle().spawn(async move {
                tokio::time::sleep(duration).await;
                down.success(());
            });
        })
        .operation()
    }

    pub fn id(&self) -> ExecutionId {
        self.inner.id
    }

    /// Identity of the execution that was current when this one was forked.
    pub fn parent(&self) -> Option<ExecutionId> {
        self.inner.parent
    }

    /// Round-robin worker slot this execution was assigned on start.
    pub fn worker(&self) -> usize {
        self.inner.worker
    }

    pub fn controller(&self) -> &ExecController {
        &self.inner.controller
    }

    pub fn is_complete(&self) -> bool {
        *self.inner.completed.borrow()
    }

    /// Resolves once the execution has finished and its completion hook ran.
    pub async fn completion(&self) {
        let mut done = self.inner.completed.subscribe();
        // The sender lives in `self`, so the channel cannot close first.
        let _ = done.wait_for(|finished| *finished).await;
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Pushes a value onto this execution's registry stack for `T`.
    pub fn add<T: Any + Send + Sync>(&self, value: T) {
        self.inner
            .registry
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Arc::new(value));
    }

    /// Returns the most recently added `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .registry
            .get(&TypeId::of::<T>())
            .and_then(|stack| stack.last().cloned())
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Removes and returns the most recently added `T`.
    pub fn pop<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .registry
            .get_mut(&TypeId::of::<T>())
            .and_then(|mut stack| stack.pop())
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.inner
            .registry
            .get(&TypeId::of::<T>())
            .is_some_and(|stack| !stack.is_empty())
    }

    // =========================================================================
    // Segment plumbing
    // =========================================================================

    fn push(&self, segment: Segment) {
        if self.inner.segments.send(segment).is_err() {
            debug!(execution = %self.id(), "segment dropped, execution driver is gone");
        }
    }

    /// Subscribes `upstream` from a new segment and queues `continuation` on
    /// this execution once a result arrives.
    pub(crate) fn subscribe<T, F>(&self, upstream: Upstream<T>, continuation: F)
    where
        T: Send + 'static,
        F: FnOnce(ExecResult<T>) -> Result<(), ExecError> + Send + 'static,
    {
        let resume = self.resumer(continuation);
        self.push(Box::new(move || {
            connect(&upstream, resume);
            Ok(())
        }));
    }

    /// Wraps `downstream` so that its signal is delivered as a segment of
    /// this execution, whatever thread produced it.
    pub(crate) fn bind<T: Send + 'static>(&self, downstream: Downstream<T>) -> Downstream<T> {
        self.resumer(move |result| {
            downstream.accept(result);
            Ok(())
        })
    }

    fn resumer<T, F>(&self, continuation: F) -> Downstream<T>
    where
        T: Send + 'static,
        F: FnOnce(ExecResult<T>) -> Result<(), ExecError> + Send + 'static,
    {
        let resumption = Resumption::new(self.clone());
        Downstream::new(move |result| resumption.resume(Box::new(move || continuation(result))))
    }

    async fn drive(self, mut segments: mpsc::UnboundedReceiver<Segment>, on_start: Option<Hook>) {
        debug!("execution started");
        if let Some(hook) = on_start {
            let exec = self.clone();
            self.run_segment(Box::new(move || {
                hook(&exec);
                Ok(())
            }));
        }

        let mut since_yield = 0;
        loop {
            let segment = match segments.try_recv() {
                Ok(segment) => segment,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {
                    // A resumption enqueues before releasing its pending count,
                    // so a zero count plus an empty queue means nothing is left.
                    if self.inner.pending.load(Ordering::Acquire) == 0 {
                        match segments.try_recv() {
                            Ok(segment) => segment,
                            Err(_) => break,
                        }
                    } else {
                        since_yield = 0;
                        match segments.recv().await {
                            Some(segment) => segment,
                            None => break,
                        }
                    }
                }
            };

            self.run_segment(segment);

            since_yield += 1;
            if since_yield >= SEGMENTS_PER_YIELD {
                since_yield = 0;
                tokio::task::yield_now().await;
            }
        }

        self.finish();
    }

    fn run_segment(&self, segment: Segment) {
        let outcome = CURRENT_EXECUTION.sync_scope(self.clone(), || {
            panic::catch_unwind(AssertUnwindSafe(|| self.intercepted(ExecType::Compute, segment)))
        });
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(error)) => error,
            Err(payload) => ExecError::from_panic(payload),
        };
        self.dispatch_error(error);
    }

    /// Runs `code` inside this execution's interceptors.
    fn intercepted<'a>(
        &'a self,
        exec_type: ExecType,
        code: Box<dyn FnOnce() -> Result<(), ExecError> + 'a>,
    ) -> Result<(), ExecError> {
        let interceptors = &self.inner.interceptors;
        if interceptors.is_empty() {
            return code();
        }
        let mut ran = false;
        let result = interceptor::intercept(
            self,
            interceptors,
            exec_type,
            Box::new(|| {
                ran = true;
                code()
            }),
        );
        match result {
            Ok(()) if !ran => Err(ExecError::IllegalState(format!(
                "an interceptor returned without proceeding ({exec_type:?})"
            ))),
            result => result,
        }
    }

    /// Runs blocking work inside this execution's interceptors, on the
    /// calling thread.
    pub(crate) fn intercept_blocking<R>(&self, work: impl FnOnce() -> R) -> Result<R, ExecError> {
        let mut output = None;
        self.intercepted(
            ExecType::Blocking,
            Box::new(|| {
                output = Some(work());
                Ok(())
            }),
        )?;
        output.ok_or_else(|| {
            ExecError::IllegalState("blocking work was not run by its interceptors".to_string())
        })
    }

    fn dispatch_error(&self, error: ExecError) {
        let Some(handler) = self.inner.on_error.clone() else {
            error!(execution = %self.id(), error = %error, "unhandled execution error");
            return;
        };
        let outcome = CURRENT_EXECUTION.sync_scope(self.clone(), || {
            panic::catch_unwind(AssertUnwindSafe(|| handler(error)))
        });
        if let Err(payload) = outcome {
            error!(
                execution = %self.id(),
                panic = %panic_message(payload.as_ref()),
                "execution error handler panicked"
            );
        }
    }

    fn finish(&self) {
        let hook = self.inner.on_complete.lock().take();
        if let Some(hook) = hook {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(self))) {
                error!(
                    execution = %self.id(),
                    panic = %panic_message(payload.as_ref()),
                    "execution completion hook panicked"
                );
            }
        }
        self.inner.controller.execution_finished();
        self.inner.completed.send_replace(true);
        debug!("execution completed");
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.inner.id)
            .field("parent", &self.inner.parent)
            .field("worker", &self.inner.worker)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Keeps an execution alive until a promise result has been handed back.
///
/// Dropped without resuming (for example when the downstream holding it is
/// discarded during a panic), it still releases its count and queues an
/// `Abandoned` error so the driver never waits forever.
struct Resumption {
    exec: Execution,
    armed: bool,
}

impl Resumption {
    fn new(exec: Execution) -> Self {
        exec.inner.pending.fetch_add(1, Ordering::AcqRel);
        Self { exec, armed: true }
    }

    fn resume(mut self, segment: Segment) {
        self.exec.push(segment);
        self.armed = false;
    }
}

impl Drop for Resumption {
    fn drop(&mut self) {
        if self.armed {
            self.exec.push(Box::new(|| Err(ExecError::Abandoned)));
        }
        self.exec.inner.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures and starts a new execution.
///
/// # Example
///
/// ```no_run
/// use praxis::{ExecController, Promise};
///
/// # async fn demo() -> Result<(), praxis::ExecError> {
/// let controller = ExecController::current()?;
/// let exec = controller
///     .fork()
///     .on_error(|e| eprintln!("failed: {e}"))
///     .start(|_| {
///         Promise::value(21).map(|v| v * 2).then(|v| println!("{v}"));
///         Ok(())
///     });
/// exec.completion().await;
/// # Ok(())
/// # }
/// ```
#[must_use = "an execution builder does nothing until `start` is called"]
pub struct ExecutionBuilder {
    controller: ExecController,
    parent: Option<ExecutionId>,
    on_error: Option<ErrorHandler>,
    on_complete: Option<Hook>,
    on_start: Option<Hook>,
    registry: Vec<(TypeId, Registered)>,
    interceptors: Vec<Arc<dyn ExecInterceptor>>,
}

impl ExecutionBuilder {
    pub(crate) fn new(controller: ExecController) -> Self {
        Self {
            controller,
            parent: Execution::current_opt().map(|exec| exec.id()),
            on_error: None,
            on_complete: None,
            on_start: None,
            registry: Vec::new(),
            interceptors: Vec::new(),
        }
    }

    /// Receives every error raised by a segment of the execution. Without a
    /// handler, errors are logged at `error` level.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(ExecError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Runs once the execution has no more work. The hook itself runs after
    /// the execution is finished, so it is not on the execution.
    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Execution) + Send + 'static,
    {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Runs on the execution before the initial action.
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Execution) + Send + 'static,
    {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Pre-populates the execution registry.
    pub fn register<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.registry.push((TypeId::of::<T>(), Arc::new(value)));
        self
    }

    /// Wraps every segment of this execution, and the blocking work it starts,
    /// in `interceptor`. Controller interceptors run outside of it.
    pub fn intercept(mut self, interceptor: impl ExecInterceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Spawns the execution driver and queues `action` as its first segment.
    pub fn start<F>(self, action: F) -> Execution
    where
        F: FnOnce(&Execution) -> Result<(), ExecError> + Send + 'static,
    {
        let (segments, receiver) = mpsc::unbounded_channel();
        let (completed, _) = watch::channel(false);
        let worker = self.controller.next_worker();
        let interceptors: Interceptors = self
            .controller
            .interceptors()
            .iter()
            .cloned()
            .chain(self.interceptors)
            .collect();

        let exec = Execution {
            inner: Arc::new(ExecutionInner {
                id: ExecutionId::new(),
                parent: self.parent,
                worker,
                controller: self.controller.detached(),
                segments,
                pending: AtomicUsize::new(0),
                registry: DashMap::new(),
                on_error: self.on_error,
                on_complete: Mutex::new(self.on_complete),
                completed,
                interceptors,
            }),
        };
        for (key, value) in self.registry {
            exec.inner.registry.entry(key).or_default().push(value);
        }

        let initial = exec.clone();
        exec.push(Box::new(move || action(&initial)));

        let span = debug_span!("execution", id = %exec.id(), worker);
        self.controller.execution_started();
        self.controller
            .handle()
            .spawn(exec.clone().drive(receiver, self.on_start).instrument(span));
        exec
    }
}
