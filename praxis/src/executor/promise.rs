//! Deferred single values.
//!
//! A [`Promise`] is nothing but an upstream function `Fn(Downstream<T>)`.
//! Every transform wraps that function in a new one, so promises are
//! stateless and re-run their producer for every subscription unless a
//! caching transform is applied.

use super::blocking::Blocking;
use super::controller::ExecController;
use super::downstream::Downstream;
use super::execution::Execution;
use super::operation::Operation;
use super::throttle::Throttle;
use crate::cache::{CachingUpstream, TimedFaultTolerantCache, Ttl};
use crate::core::{BoxError, ExecError, ExecResult, RetryPolicy, Retryable};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// The producer side of a promise.
pub type Upstream<T> = Arc<dyn Fn(Downstream<T>) + Send + Sync>;

/// Invokes `upstream`, converting a panic in it into an error signal.
pub(crate) fn connect<T: Send + 'static>(upstream: &Upstream<T>, downstream: Downstream<T>) {
    downstream.guarded(|downstream| upstream(downstream));
}

/// A value that becomes available later.
///
/// # Example
///
/// ```no_run
/// use praxis::{ExecController, ExecError, Promise};
///
/// # async fn demo() -> Result<(), ExecError> {
/// let controller = ExecController::current()?;
/// let promise = Promise::value(2)
///     .map(|v| v * 10)
///     .flat_map(|v| Promise::value(v + 1))
///     .on_error(|_| Ok::<_, ExecError>(0));
/// let result = controller.yield_single(promise).await;
/// assert_eq!(result.into_value(), Some(21));
/// # Ok(())
/// # }
/// ```
pub struct Promise<T> {
    upstream: Upstream<T>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            upstream: self.upstream.clone(),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Creates a promise from a producer that signals the downstream exactly
    /// once.
    ///
    /// When subscribed on an execution the downstream is bound to it, so the
    /// producer may signal from any thread and the rest of the chain still
    /// resumes on that execution. Outside an execution the downstream is
    /// handed over as is.
    pub fn of<F>(producer: F) -> Self
    where
        F: Fn(Downstream<T>) + Send + Sync + 'static,
    {
        Self::raw(move |downstream: Downstream<T>| match Execution::current_opt() {
            Some(exec) => exec.bind(downstream).guarded(|bound| producer(bound)),
            None => producer(downstream),
        })
    }

    /// Wraps a producer without binding. Internal combinators use this when
    /// they signal on the subscribing thread themselves.
    pub(crate) fn raw<F>(producer: F) -> Self
    where
        F: Fn(Downstream<T>) + Send + Sync + 'static,
    {
        Self {
            upstream: Arc::new(producer),
        }
    }

    pub fn from_upstream(upstream: Upstream<T>) -> Self {
        Self { upstream }
    }

    /// Creates a promise whose downstream is bound to the subscribing
    /// execution: whichever thread signals it, the rest of the chain resumes
    /// on that execution.
    pub fn async_<F>(producer: F) -> Self
    where
        F: Fn(Downstream<T>) + Send + Sync + 'static,
    {
        Self::on_execution(move |_, downstream| producer(downstream))
    }

    pub(crate) fn on_execution<F>(producer: F) -> Self
    where
        F: Fn(&Execution, Downstream<T>) + Send + Sync + 'static,
    {
        Self::raw(move |downstream: Downstream<T>| match Execution::current() {
            Ok(exec) => exec
                .bind(downstream)
                .guarded(|bound| producer(&exec, bound)),
            Err(e) => downstream.error(e),
        })
    }

    pub fn value(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::raw(move |downstream| downstream.success(value.clone()))
    }

    pub fn error(error: ExecError) -> Self {
        Self::raw(move |downstream| downstream.error(error.clone()))
    }

    /// Computes the value lazily, on every subscription.
    pub fn sync<F, E>(f: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::raw(move |downstream| downstream.accept_result(f().map_err(ExecError::failed)))
    }

    /// Builds the promise to subscribe to lazily, on every subscription.
    pub fn flatten<F>(factory: F) -> Self
    where
        F: Fn() -> Promise<T> + Send + Sync + 'static,
    {
        Self::raw(move |downstream| factory().connect(downstream))
    }

    pub fn upstream(&self) -> Upstream<T> {
        self.upstream.clone()
    }

    /// Subscribes `downstream` directly, without binding it to an execution.
    pub fn connect(&self, downstream: Downstream<T>) {
        connect(&self.upstream, downstream);
    }

    // =========================================================================
    // Transforms
    // =========================================================================

    /// Wraps this promise so every result passes through `f`. A panic in `f`
    /// fails the new promise instead of escaping.
    fn chain<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: Fn(ExecResult<T>, Downstream<U>) + Send + Sync + 'static,
    {
        let upstream = self.upstream;
        let f = Arc::new(f);
        Promise::raw(move |downstream: Downstream<U>| {
            let f = f.clone();
            connect(
                &upstream,
                Downstream::new(move |result| {
                    downstream.guarded(|downstream| f(result, downstream));
                }),
            );
        })
    }

    /// Transforms a successful value.
    pub fn map<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.try_map(move |value| Ok::<U, Infallible>(f(value)))
    }

    /// Transforms a successful value; an `Err` becomes the promise's error.
    pub fn try_map<U, E, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        E: Into<BoxError>,
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    {
        self.chain(move |result, downstream| match result {
            ExecResult::Success(value) => {
                downstream.accept_result(f(value).map_err(ExecError::failed))
            }
            ExecResult::Error(e) => downstream.error(e),
            ExecResult::Complete => downstream.complete(),
        })
    }

    /// Applies `f` only to values matching `predicate`.
    pub fn map_if<P, F>(self, predicate: P, f: F) -> Promise<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        self.map(move |value| if predicate(&value) { f(value) } else { value })
    }

    /// Continues with the promise returned by `f`.
    pub fn flat_map<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Promise<U> + Send + Sync + 'static,
    {
        self.chain(move |result, downstream| match result {
            ExecResult::Success(value) => f(value).connect(downstream),
            ExecResult::Error(e) => downstream.error(e),
            ExecResult::Complete => downstream.complete(),
        })
    }

    /// Recovers from an error by producing a value, or fails with the
    /// handler's own error.
    pub fn on_error<F, E>(self, handler: F) -> Promise<T>
    where
        F: Fn(ExecError) -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.chain(move |result, downstream| match result {
            ExecResult::Error(e) => downstream.accept_result(handler(e).map_err(ExecError::failed)),
            other => downstream.accept(other),
        })
    }

    /// Consumes an error with a side effect; the promise then completes
    /// without a value.
    pub fn consume_error<F>(self, handler: F) -> Promise<T>
    where
        F: Fn(ExecError) + Send + Sync + 'static,
    {
        self.chain(move |result, downstream| match result {
            ExecResult::Error(e) => {
                handler(e);
                downstream.complete();
            }
            other => downstream.accept(other),
        })
    }

    /// Replaces an error with another error.
    pub fn map_error<F>(self, f: F) -> Promise<T>
    where
        F: Fn(ExecError) -> ExecError + Send + Sync + 'static,
    {
        self.chain(move |result, downstream| match result {
            ExecResult::Error(e) => downstream.error(f(e)),
            other => downstream.accept(other),
        })
    }

    /// Recovers from an error with another promise.
    pub fn flat_map_error<F>(self, f: F) -> Promise<T>
    where
        F: Fn(ExecError) -> Promise<T> + Send + Sync + 'static,
    {
        self.chain(move |result, downstream| match result {
            ExecResult::Error(e) => f(e).connect(downstream),
            other => downstream.accept(other),
        })
    }

    /// Runs a side effect on the value before passing it on.
    pub fn next<F>(self, action: F) -> Promise<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.map(move |value| {
            action(&value);
            value
        })
    }

    /// Observes every result without altering it.
    pub fn wiretap<F>(self, listener: F) -> Promise<T>
    where
        F: Fn(&ExecResult<T>) + Send + Sync + 'static,
    {
        self.chain(move |result, downstream| {
            listener(&result);
            downstream.accept(result);
        })
    }

    /// Reports how long each subscription took to settle.
    pub fn time<F>(self, report: F) -> Promise<T>
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        let upstream = self.upstream;
        let report = Arc::new(report);
        Promise::raw(move |downstream: Downstream<T>| {
            let started = Instant::now();
            let report = report.clone();
            connect(
                &upstream,
                Downstream::new(move |result| {
                    downstream.guarded(|downstream| {
                        report(started.elapsed());
                        downstream.accept(result);
                    });
                }),
            );
        })
    }

    /// Rewrites the upstream function itself.
    pub fn transform<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Upstream<T>) -> Upstream<U>,
    {
        Promise::from_upstream(f(self.upstream))
    }

    /// Pairs this value with the value of `other`, subscribed afterwards.
    pub fn right<U>(self, other: Promise<U>) -> Promise<(T, U)>
    where
        T: Clone + Sync,
        U: Send + 'static,
    {
        self.flat_map(move |left| other.clone().map(move |right| (left.clone(), right)))
    }

    /// Subscribes to this promise and `other` at the same time, each on its
    /// own forked execution, and pairs their values.
    ///
    /// The first error or empty completion settles the pair and the other
    /// side's result is discarded.
    pub fn zip<U>(self, other: Promise<U>) -> Promise<(T, U)>
    where
        U: Send + 'static,
    {
        let left = self.fork().upstream;
        let right = other.fork().upstream;
        Promise::on_execution(move |_, downstream| {
            let zipper = Arc::new(Mutex::new(Zipper {
                downstream: Some(downstream),
                left: None,
                right: None,
            }));
            let on_left = zipper.clone();
            connect(
                &left,
                Downstream::new(move |result| Zipper::settle(&*on_left, |z| z.left = Some(result))),
            );
            connect(
                &right,
                Downstream::new(move |result| Zipper::settle(&*zipper, |z| z.right = Some(result))),
            );
        })
    }

    /// Subscribes through `throttle`, waiting for a free slot first.
    pub fn throttled(self, throttle: &Arc<Throttle>) -> Promise<T> {
        throttle.throttle(self)
    }

    /// Transforms the value on the blocking pool.
    pub fn blocking_map<U, E, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        E: Into<BoxError>,
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.flat_map(move |value| {
            let f = f.clone();
            Blocking::get_once(move || f(value))
        })
    }

    /// Discards the value.
    pub fn operation(self) -> Operation {
        Operation::from_promise(self.map(|_| ()))
    }

    // =========================================================================
    // Timing
    // =========================================================================

    /// Subscribes to this promise only after `delay` has elapsed.
    pub fn defer(self, delay: Duration) -> Promise<T> {
        Execution::sleep(delay)
            .promise()
            .flat_map(move |()| self.clone())
    }

    /// Fails with [`ExecError::Timeout`] if no signal arrives within `after`.
    ///
    /// The upstream is not interrupted; a late result is discarded.
    pub fn timeout(self, after: Duration) -> Promise<T> {
        let upstream = self.upstream;
        Promise::on_execution(move |exec, downstream| {
            let slot = Arc::new(Mutex::new(Some(downstream)));
            let expired = slot.clone();
            let timer = exec.controller().handle().spawn(async move {
                tokio::time::sleep(after).await;
                let loser = expired.lock().take();
                if let Some(downstream) = loser {
                    debug!(?after, "promise timed out");
                    downstream.error(ExecError::Timeout(after));
                }
            });
            connect(
                &upstream,
                Downstream::new(move |result| {
                    timer.abort();
                    let winner = slot.lock().take();
                    if let Some(downstream) = winner {
                        downstream.accept(result);
                    }
                }),
            );
        })
    }

    /// Re-subscribes after retryable errors, following `policy`'s backoff.
    pub fn retry(self, policy: RetryPolicy) -> Promise<T> {
        self.retry_from(policy, 1)
    }

    fn retry_from(self, policy: RetryPolicy, attempt: u32) -> Promise<T> {
        let again = self.clone();
        self.flat_map_error(move |error| {
            if !error.is_retryable() {
                debug!(attempt, error = %error, "promise failed with non-retryable error");
                return Promise::error(error);
            }
            match policy.delay_for_attempt(attempt) {
                Some(delay) => {
                    debug!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        ?delay,
                        error = %error,
                        "promise failed, retrying"
                    );
                    again.clone().retry_from(policy, attempt + 1).defer(delay)
                }
                None => {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %error,
                        "promise exhausted retry attempts"
                    );
                    Promise::error(error)
                }
            }
        })
    }

    /// Subscribes to this promise on a new execution and hands the result
    /// back to the subscribing one.
    pub fn fork(self) -> Promise<T> {
        let upstream = self.upstream;
        Promise::on_execution(move |exec, downstream| {
            let upstream = upstream.clone();
            exec.controller().fork().start(move |child| {
                child.subscribe(upstream, move |result| {
                    downstream.accept(result);
                    Ok(())
                });
                Ok(())
            });
        })
    }

    // =========================================================================
    // Caching
    // =========================================================================

    /// Caches the first successful value forever. Errors are shared with the
    /// subscribers of the failing flight, then the next subscriber retries.
    pub fn cache(self) -> Promise<T>
    where
        T: Clone + Sync,
    {
        self.cache_result_if(ExecResult::is_success)
    }

    /// Caches successful values matching `predicate`.
    pub fn cache_if<P>(self, predicate: P) -> Promise<T>
    where
        T: Clone + Sync,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.cache_result_if(move |result| result.value().is_some_and(&predicate))
    }

    /// Caches any result matching `predicate`, errors included.
    pub fn cache_result_if<P>(self, predicate: P) -> Promise<T>
    where
        T: Clone + Sync,
        P: Fn(&ExecResult<T>) -> bool + Send + Sync + 'static,
    {
        self.cache_result_for(move |result| {
            if predicate(result) {
                Ttl::Eternal
            } else {
                Ttl::Expired
            }
        })
    }

    /// Caches each result for the time-to-live chosen by `ttl`.
    pub fn cache_result_for<F>(self, ttl: F) -> Promise<T>
    where
        T: Clone + Sync,
        F: Fn(&ExecResult<T>) -> Ttl + Send + Sync + 'static,
    {
        let cache = CachingUpstream::new(self.upstream, ttl);
        Promise::raw(move |downstream| cache.connect(downstream))
    }

    /// Serves a cached value, refreshing it in the background once it is
    /// older than `cache_for`. See [`TimedFaultTolerantCache`].
    pub fn cache_fault_tolerant(self, cache_for: Duration, error_timeout: Duration) -> Promise<T>
    where
        T: Clone + Sync,
    {
        TimedFaultTolerantCache::new(cache_for, error_timeout).wrap(self)
    }

    // =========================================================================
    // Terminals
    // =========================================================================

    /// Delivers the settled result, whatever it is.
    pub fn result<F>(self, consumer: F)
    where
        F: FnOnce(ExecResult<T>) + Send + 'static,
    {
        self.subscribe(move |result| {
            consumer(result);
            Ok(())
        });
    }

    /// Delivers a successful value to `consumer`.
    ///
    /// An error goes to the execution's error handler instead; a completion
    /// without value calls nothing. Called outside of an execution, this
    /// forks one on the current runtime.
    pub fn then<F>(self, consumer: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.try_then(move |value| {
            consumer(value);
            Ok::<(), Infallible>(())
        });
    }

    /// Like [`then`](Self::then), routing the consumer's own error to the
    /// execution's error handler.
    pub fn try_then<F, E>(self, consumer: F)
    where
        F: FnOnce(T) -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.subscribe(move |result| match result {
            ExecResult::Success(value) => consumer(value).map_err(ExecError::failed),
            ExecResult::Error(e) => Err(e),
            ExecResult::Complete => Ok(()),
        });
    }

    fn subscribe<F>(self, continuation: F)
    where
        F: FnOnce(ExecResult<T>) -> Result<(), ExecError> + Send + 'static,
    {
        if let Ok(exec) = Execution::current() {
            exec.subscribe(self.upstream, continuation);
            return;
        }
        match ExecController::current() {
            Ok(controller) => {
                let upstream = self.upstream;
                controller.fork().start(move |exec| {
                    exec.subscribe(upstream, continuation);
                    Ok(())
                });
            }
            Err(unmanaged) => {
                if let Err(e) = continuation(ExecResult::Error(unmanaged)) {
                    error!(error = %e, "promise subscribed outside of any runtime");
                }
            }
        }
    }
}

struct Zipper<T, U> {
    downstream: Option<Downstream<(T, U)>>,
    left: Option<ExecResult<T>>,
    right: Option<ExecResult<U>>,
}

impl<T: Send + 'static, U: Send + 'static> Zipper<T, U> {
    fn settle(zipper: &Mutex<Self>, record: impl FnOnce(&mut Self)) {
        let (downstream, result) = {
            let mut z = zipper.lock();
            record(&mut *z);
            let result = match (z.left.take(), z.right.take()) {
                (Some(ExecResult::Error(e)), right) => {
                    z.right = right;
                    ExecResult::Error(e)
                }
                (left, Some(ExecResult::Error(e))) => {
                    z.left = left;
                    ExecResult::Error(e)
                }
                (Some(ExecResult::Complete), _) | (_, Some(ExecResult::Complete)) => {
                    ExecResult::Complete
                }
                (Some(ExecResult::Success(l)), Some(ExecResult::Success(r))) => {
                    ExecResult::Success((l, r))
                }
                (left, right) => {
                    z.left = left;
                    z.right = right;
                    return;
                }
            };
            match z.downstream.take() {
                Some(downstream) => (downstream, result),
                None => return,
            }
        };
        downstream.accept(result);
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn controller() -> ExecController {
        ExecController::current().unwrap()
    }

    #[derive(Debug, thiserror::Error)]
    #[error("bad input: {0}")]
    struct BadInput(i32);

    #[tokio::test]
    async fn test_map_and_flat_map_compose() {
        let promise = Promise::value(3)
            .map(|v| v * 2)
            .flat_map(|v| Promise::value(v + 1).map(|v| v.to_string()));
        let result = controller().yield_single(promise).await;
        assert_eq!(result.into_value().as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_map_panic_becomes_error() {
        let promise = Promise::value(1).map(|v: i32| -> i32 {
            if v == 1 {
                panic!("map exploded");
            }
            v
        });
        let result = controller().yield_single(promise).await;
        assert!(matches!(result, ExecResult::Error(ExecError::Panicked(m)) if m == "map exploded"));
    }

    #[tokio::test]
    async fn test_producer_panic_becomes_error() {
        let promise: Promise<i32> = Promise::of(|_down| panic!("producer exploded"));
        let result = controller().yield_single(promise).await;
        assert!(matches!(result, ExecResult::Error(ExecError::Panicked(_))));
    }

    #[tokio::test]
    async fn test_try_map_error_keeps_source_type() {
        let promise = Promise::value(-1).try_map(|v| if v < 0 { Err(BadInput(v)) } else { Ok(v) });
        let result = controller().yield_single(promise).await;
        let error = result.error().cloned().unwrap();
        assert!(error.is::<BadInput>());
        assert_eq!(error.to_string(), "bad input: -1");
    }

    #[tokio::test]
    async fn test_on_error_recovers_value() {
        let promise = Promise::<i32>::error(ExecError::msg("down"))
            .map(|v| v + 100)
            .on_error(|e| {
                assert_eq!(e.to_string(), "down");
                Ok::<_, ExecError>(-1)
            });
        let result = controller().yield_single(promise).await;
        assert_eq!(result.into_value(), Some(-1));
    }

    #[tokio::test]
    async fn test_consume_error_completes_without_value() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let promise = Promise::<i32>::error(ExecError::msg("down")).consume_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let result = controller().yield_single(promise).await;
        assert!(result.is_complete());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_plain_promise_reruns_producer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let promise = Promise::sync(move || Ok::<_, ExecError>(counter.fetch_add(1, Ordering::SeqCst)));
        let c = controller();
        assert_eq!(c.yield_single(promise.clone()).await.into_value(), Some(0));
        assert_eq!(c.yield_single(promise).await.into_value(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_async_resumes_on_subscribing_execution() {
        let promise = Promise::async_(|down: Downstream<u32>| {
            std::thread::spawn(move || down.success(9));
        })
        .map(|v| (v, Execution::is_active()));
        let result = controller().yield_single(promise).await;
        assert_eq!(result.into_value(), Some((9, true)));
    }

    fn from_thread(value: u32) -> Promise<u32> {
        Promise::of(move |down: Downstream<u32>| {
            std::thread::spawn(move || down.success(value));
        })
    }

    #[tokio::test]
    async fn test_of_signalled_from_thread_resumes_on_execution() {
        let c = controller();
        let located = from_thread(3).map(|v| (v, Execution::is_active()));
        assert_eq!(c.yield_single(located).await.into_value(), Some((3, true)));

        let blocking = from_thread(3).blocking_map(|v| Ok::<_, ExecError>(v * 2));
        assert_eq!(c.yield_single(blocking).await.into_value(), Some(6));

        let deferred = from_thread(3)
            .defer(Duration::from_millis(1))
            .flat_map(|v| Promise::value(v + 1).defer(Duration::from_millis(1)));
        assert_eq!(c.yield_single(deferred).await.into_value(), Some(4));
    }

    #[tokio::test]
    async fn test_dropped_downstream_is_abandoned() {
        let promise: Promise<u8> = Promise::async_(|down| drop(down));
        let result = controller().yield_single(promise).await;
        assert!(matches!(result, ExecResult::Error(ExecError::Abandoned)));
    }

    #[tokio::test]
    async fn test_wiretap_and_next_observe() {
        let taps = Arc::new(AtomicUsize::new(0));
        let tap = taps.clone();
        let side = taps.clone();
        let promise = Promise::value(5)
            .next(move |_| {
                side.fetch_add(10, Ordering::SeqCst);
            })
            .wiretap(move |r| {
                assert!(r.is_success());
                tap.fetch_add(1, Ordering::SeqCst);
            });
        assert_eq!(controller().yield_single(promise).await.into_value(), Some(5));
        assert_eq!(taps.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_right_pairs_values() {
        let promise = Promise::value("a").right(Promise::value(1));
        assert_eq!(
            controller().yield_single(promise).await.into_value(),
            Some(("a", 1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zip_runs_both_sides_at_once() {
        let started = Instant::now();
        let slow_left = Promise::value("a").defer(Duration::from_millis(100));
        let slow_right = Promise::value(1).defer(Duration::from_millis(100));
        let result = controller().yield_single(slow_left.zip(slow_right)).await;
        assert_eq!(result.into_value(), Some(("a", 1)));
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zip_settles_on_first_failure() {
        let slow = Promise::value(1).defer(Duration::from_secs(5));
        let failing = Promise::<u8>::error(ExecError::msg("right side down"));
        let started = Instant::now();
        let result = controller().yield_single(slow.zip(failing)).await;
        assert_eq!(result.error().map(ToString::to_string).as_deref(), Some("right side down"));
        assert!(started.elapsed() < Duration::from_secs(5));

        let empty = Promise::<u8>::raw(|down| down.complete());
        let result = controller().yield_single(Promise::value(2).zip(empty)).await;
        assert!(result.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_slow_upstream() {
        let slow = Promise::value(1).defer(Duration::from_secs(5));
        let result = controller()
            .yield_single(slow.timeout(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, ExecResult::Error(ExecError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_passes_fast_upstream() {
        let fast = Promise::value(1).defer(Duration::from_millis(10));
        let result = controller()
            .yield_single(fast.timeout(Duration::from_secs(1)))
            .await;
        assert_eq!(result.into_value(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_resubscribes_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let flaky = Promise::sync(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ExecError::msg("transient"))
            } else {
                Ok("ok")
            }
        });
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        };
        let result = controller().yield_single(flaky.retry(policy)).await;
        assert_eq!(result.into_value(), Some("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let broken = Promise::<u8>::sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ExecError::IllegalState("never works".into()))
        });
        let result = controller()
            .yield_single(broken.retry(RetryPolicy::STANDARD))
            .await;
        assert!(result.is_error());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fork_runs_on_child_execution() {
        let promise = Promise::sync(|| Execution::current().map(|e| e.id()))
            .fork()
            .map(|child| (child, Execution::current().map(|e| e.id()).ok()));
        let (tx, rx) = tokio::sync::oneshot::channel();
        controller().fork().start(move |exec| {
            let parent = exec.id();
            promise.then(move |(child, resumed)| {
                let _ = tx.send((parent, child, resumed));
            });
            Ok(())
        });
        let (parent, child, resumed) = rx.await.unwrap();
        assert_ne!(parent, child);
        assert_eq!(resumed, Some(parent));
    }

    #[tokio::test]
    async fn test_then_outside_execution_forks_one() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        Promise::value(4).then(move |v| {
            let _ = tx.send((v, Execution::is_active()));
        });
        assert_eq!(rx.await.unwrap(), (4, true));
    }

    #[tokio::test]
    async fn test_blocking_map_runs_off_execution() {
        let promise = Promise::value(6).blocking_map(|v| {
            Ok::<_, ExecError>((v * 7, Execution::is_active()))
        });
        let result = controller().yield_single(promise).await;
        assert_eq!(result.into_value(), Some((42, false)));
    }
}
