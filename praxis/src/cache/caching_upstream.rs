use super::Ttl;
use crate::core::ExecResult;
use crate::executor::{connect, Downstream, Execution, Upstream};
use arc_swap::ArcSwapOption;
use crossbeam_queue::SegQueue;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

type TtlFn<T> = Box<dyn Fn(&ExecResult<T>) -> Ttl + Send + Sync>;

/// Wraps an upstream so that at most one physical computation is in flight.
///
/// Subscribers arriving while a computation runs are queued and all receive
/// its outcome, value or error, in subscription order. Whether the outcome
/// is also served to later subscribers is decided per result by a [`Ttl`]
/// function.
pub struct CachingUpstream<T> {
    upstream: Upstream<T>,
    ttl: TtlFn<T>,
    cached: ArcSwapOption<Cached<T>>,
    /// A computation is in flight.
    pending: AtomicBool,
    /// One thread is dispatching queued subscribers.
    draining: AtomicBool,
    waiting: SegQueue<Downstream<T>>,
}

struct Cached<T> {
    result: ExecResult<T>,
    expires: Expiry,
}

enum Expiry {
    Never,
    At(Instant),
    Immediately,
}

impl<T> Cached<T> {
    fn is_fresh(&self) -> bool {
        match self.expires {
            Expiry::Never => true,
            Expiry::At(deadline) => Instant::now() < deadline,
            Expiry::Immediately => false,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> CachingUpstream<T> {
    pub fn new<F>(upstream: Upstream<T>, ttl: F) -> Arc<Self>
    where
        F: Fn(&ExecResult<T>) -> Ttl + Send + Sync + 'static,
    {
        Arc::new(Self {
            upstream,
            ttl: Box::new(ttl),
            cached: ArcSwapOption::empty(),
            pending: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            waiting: SegQueue::new(),
        })
    }

    /// Serves a fresh cached result immediately, or queues `downstream` for
    /// the current (or a new) computation.
    pub fn connect(self: &Arc<Self>, downstream: Downstream<T>) {
        if let Some(cached) = self.fresh() {
            downstream.accept(cached.result.clone());
            return;
        }
        // A queued subscriber resumes on its own execution, not on the
        // thread that settles the computation.
        let downstream = match Execution::current() {
            Ok(exec) => exec.bind(downstream),
            Err(_) => downstream,
        };
        self.waiting.push(downstream);
        self.try_drain();
    }

    /// True when a successful value is currently servable.
    pub fn has_value(&self) -> bool {
        self.fresh().is_some_and(|cached| cached.result.is_success())
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn fresh(&self) -> Option<Arc<Cached<T>>> {
        self.cached.load_full().filter(|cached| cached.is_fresh())
    }

    fn try_drain(self: &Arc<Self>) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // The draining thread re-checks the queue after releasing.
                return;
            }

            match self.fresh() {
                Some(cached) => {
                    while let Some(downstream) = self.waiting.pop() {
                        downstream.accept(cached.result.clone());
                    }
                }
                None => {
                    if !self.waiting.is_empty()
                        && self
                            .pending
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        match self.waiting.pop() {
                            Some(leader) => self.fetch(leader),
                            None => self.pending.store(false, Ordering::Release),
                        }
                    }
                }
            }

            self.draining.store(false, Ordering::Release);

            if self.waiting.is_empty() || self.pending.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn fetch(self: &Arc<Self>, leader: Downstream<T>) {
        debug!("cache miss, subscribing upstream");
        let this = self.clone();
        connect(
            &self.upstream,
            Downstream::new(move |result| this.settle(leader, result)),
        );
    }

    fn settle(self: &Arc<Self>, leader: Downstream<T>, result: ExecResult<T>) {
        let expires = match panic::catch_unwind(AssertUnwindSafe(|| (self.ttl)(&result))) {
            Ok(Ttl::Eternal) => Expiry::Never,
            Ok(Ttl::Expired) => Expiry::Immediately,
            Ok(Ttl::For(ttl)) => Expiry::At(Instant::now() + ttl),
            Err(_) => {
                warn!("cache ttl function panicked, result will not be retained");
                Expiry::Immediately
            }
        };

        let mut flight = vec![leader];
        while let Some(downstream) = self.waiting.pop() {
            flight.push(downstream);
        }

        self.cached.store(Some(Arc::new(Cached {
            result: result.clone(),
            expires,
        })));
        self.pending.store(false, Ordering::Release);

        debug!(
            subscribers = flight.len(),
            success = result.is_success(),
            "cached upstream settled"
        );
        for downstream in flight {
            downstream.accept(result.clone());
        }

        self.try_drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn counting(calls: Arc<AtomicUsize>, fail: bool) -> Upstream<usize> {
        Arc::new(move |down: Downstream<usize>| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if fail {
                down.error(ExecError::msg(format!("failure {n}")));
            } else {
                down.success(n);
            }
        })
    }

    fn collect(cache: &Arc<CachingUpstream<usize>>, seen: &Arc<Mutex<Vec<String>>>) {
        let seen = seen.clone();
        cache.connect(Downstream::new(move |r: ExecResult<usize>| {
            seen.lock().unwrap().push(match r {
                ExecResult::Success(v) => v.to_string(),
                ExecResult::Error(e) => e.to_string(),
                ExecResult::Complete => "complete".into(),
            });
        }));
    }

    #[test]
    fn test_eternal_value_is_computed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = CachingUpstream::new(counting(calls.clone(), false), |_| Ttl::Eternal);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            collect(&cache, &seen);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["1", "1", "1"]);
        assert!(cache.has_value());
    }

    #[test]
    fn test_expired_result_is_recomputed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = CachingUpstream::new(counting(calls.clone(), true), |_| Ttl::Expired);
        let seen = Arc::new(Mutex::new(Vec::new()));
        collect(&cache, &seen);
        collect(&cache, &seen);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["failure 1", "failure 2"]);
        assert!(!cache.has_value());
    }

    #[test]
    fn test_waiters_share_one_flight_in_order() {
        let parked: Arc<Mutex<Option<Downstream<usize>>>> = Arc::new(Mutex::new(None));
        let slot = parked.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let upstream: Upstream<usize> = Arc::new(move |down| {
            counter.fetch_add(1, Ordering::SeqCst);
            *slot.lock().unwrap() = Some(down);
        });
        let cache = CachingUpstream::new(upstream, |_| Ttl::Expired);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            cache.connect(Downstream::new(move |r: ExecResult<usize>| {
                order.lock().unwrap().push((i, r.into_value()));
            }));
        }
        assert!(cache.is_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let leader = parked.lock().unwrap().take().unwrap();
        leader.success(42);

        let expected: Vec<_> = (0..4).map(|i| (i, Some(42))).collect();
        assert_eq!(*order.lock().unwrap(), expected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_ttl_expires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = CachingUpstream::new(counting(calls.clone(), false), |_| {
            Ttl::For(std::time::Duration::from_millis(100))
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        collect(&cache, &seen);
        tokio::time::advance(std::time::Duration::from_millis(50)).await;
        collect(&cache, &seen);
        tokio::time::advance(std::time::Duration::from_millis(60)).await;
        collect(&cache, &seen);
        assert_eq!(*seen.lock().unwrap(), vec!["1", "1", "2"]);
    }
}
