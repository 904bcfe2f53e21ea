//! Throttle: caps how many promises are in flight at once.
//!
//! A throttled promise takes a slot before subscribing to its upstream and
//! gives it back when the upstream signals. Subscriptions that find every
//! slot taken wait in a lock-free queue and are started, in arrival order,
//! as slots free up. Each waiter is resumed on the execution that subscribed
//! to it, never on the execution that freed the slot.

use super::downstream::Downstream;
use super::promise::{connect, Promise};
use crate::core::ExecResult;
use crossbeam_queue::SegQueue;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

type Waiter = Box<dyn FnOnce() + Send>;

/// Limits the number of concurrently subscribed promises.
///
/// A throttle is shared between the promises it limits, usually across
/// executions.
///
/// ```no_run
/// use praxis::{Batch, ExecController, Promise, Throttle};
///
/// # async fn demo() -> Result<(), praxis::ExecError> {
/// let throttle = Throttle::of_size(2);
/// let promises: Vec<_> = (0..10)
///     .map(|i| Promise::value(i).throttled(&throttle))
///     .collect();
/// let values = ExecController::current()?
///     .yield_single(praxis::batch::parallel(promises).try_yield())
///     .await;
/// # let _ = values;
/// # Ok(())
/// # }
/// ```
pub struct Throttle {
    size: usize,
    active: AtomicUsize,
    waiting: SegQueue<Waiter>,
}

impl Throttle {
    /// A throttle admitting at most `size` promises at once. A size of zero
    /// is treated as one.
    pub fn of_size(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size: size.max(1),
            active: AtomicUsize::new(0),
            waiting: SegQueue::new(),
        })
    }

    /// A throttle that never makes a promise wait.
    pub fn unlimited() -> Arc<Self> {
        Self::of_size(usize::MAX)
    }

    /// Maximum concurrency, or `None` when unlimited.
    pub fn size(&self) -> Option<usize> {
        (self.size != usize::MAX).then_some(self.size)
    }

    /// Promises currently holding a slot.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Promises waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Wraps `promise` so that each subscription holds a slot of this
    /// throttle until the promise signals.
    pub fn throttle<T: Send + 'static>(self: &Arc<Self>, promise: Promise<T>) -> Promise<T> {
        let throttle = self.clone();
        let upstream = promise.upstream();
        Promise::on_execution(move |exec, downstream| {
            let upstream = upstream.clone();
            let releaser = throttle.clone();
            // Bound so the upstream starts on the subscribing execution. A
            // waiter dropped unstarted fails the downstream instead.
            let gate = exec.bind(Downstream::new(move |admitted: ExecResult<()>| match admitted {
                ExecResult::Success(()) => connect(
                    &upstream,
                    Downstream::new(move |result| {
                        releaser.release();
                        downstream.accept(result);
                    }),
                ),
                ExecResult::Error(error) => downstream.error(error),
                ExecResult::Complete => downstream.complete(),
            }));
            throttle.submit(Box::new(move || gate.success(())));
        })
    }

    fn submit(&self, waiter: Waiter) {
        self.waiting.push(waiter);
        self.drain();
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.drain();
    }

    /// Starts waiters while slots are free. A slot is claimed before popping,
    /// and handed back if the queue turned out empty; the recheck after that
    /// catches a waiter pushed in between.
    fn drain(&self) {
        loop {
            let claimed = self
                .active
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                    (active < self.size).then_some(active + 1)
                })
                .is_ok();
            if !claimed {
                trace!(waiting = self.waiting.len(), "throttle full");
                return;
            }
            match self.waiting.pop() {
                Some(waiter) => waiter(),
                None => {
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    if self.waiting.is_empty() {
                        return;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("size", &self.size())
            .field("active", &self.active())
            .field("waiting", &self.waiting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecError;
    use crate::executor::{ExecController, Execution};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_size() {
        let controller = ExecController::current().unwrap();
        let throttle = Throttle::of_size(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let execs: Vec<Execution> = (0..6)
            .map(|i| {
                let (running, peak, done) = (running.clone(), peak.clone(), running.clone());
                let work = Promise::value(i)
                    .next(move |_| {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                    })
                    .flat_map(|v| Promise::value(v).defer(Duration::from_millis(10)))
                    .next(move |_| {
                        done.fetch_sub(1, Ordering::SeqCst);
                    })
                    .throttled(&throttle);
                controller.fork().start(move |_| {
                    work.then(|_| {});
                    Ok(())
                })
            })
            .collect();

        for exec in &execs {
            exec.completion().await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(throttle.active(), 0);
        assert_eq!(throttle.waiting(), 0);
    }

    #[tokio::test]
    async fn test_error_releases_slot() {
        let controller = ExecController::current().unwrap();
        let throttle = Throttle::of_size(1);
        let failed = Promise::<u8>::error(ExecError::msg("down")).throttled(&throttle);
        let result = controller.yield_single(failed).await;
        assert!(result.is_error());
        assert_eq!(throttle.active(), 0);

        let next = Promise::value(7u8).throttled(&throttle);
        assert_eq!(controller.yield_single(next).await.into_value(), Some(7));
    }

    #[tokio::test]
    async fn test_unlimited_has_no_size() {
        let throttle = Throttle::unlimited();
        assert_eq!(throttle.size(), None);
        assert_eq!(Throttle::of_size(0).size(), Some(1));
        let value = ExecController::current()
            .unwrap()
            .yield_single(Promise::value(1).throttled(&throttle))
            .await;
        assert_eq!(value.into_value(), Some(1));
    }
}
