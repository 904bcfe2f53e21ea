use super::{CachingUpstream, Ttl};
use crate::core::ExecResult;
use crate::executor::{connect, Downstream, Execution, Promise, Upstream};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const NOT_SCHEDULED: u64 = u64::MAX;

/// A time-boxed cache that favours availability over freshness.
///
/// The first subscriber populates the cache and everyone arriving meanwhile
/// shares that flight. Once a value exists, a subscriber that finds it older
/// than `cache_for` starts exactly one background refresh and, like every
/// other reader, is served the previous value at once. A failed refresh keeps
/// the previous value and is retried after `error_timeout`. A value is
/// therefore served indefinitely while every refresh fails.
///
/// # Example
///
/// ```no_run
/// use praxis::{Promise, TimedFaultTolerantCache};
/// use std::time::Duration;
///
/// let site_config = Promise::sync(|| Ok::<_, praxis::ExecError>("config"));
/// let cache = TimedFaultTolerantCache::new(Duration::from_secs(60), Duration::from_secs(5));
/// let cached = cache.wrap(site_config);
/// ```
pub struct TimedFaultTolerantCache<T> {
    cache_for: Duration,
    error_timeout: Duration,
    epoch: Instant,
    /// Milliseconds since `epoch` after which the value is stale.
    next_update: AtomicU64,
    effective: ArcSwapOption<CachingUpstream<T>>,
    update_pending: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> TimedFaultTolerantCache<T> {
    pub fn new(cache_for: Duration, error_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            cache_for,
            error_timeout,
            epoch: Instant::now(),
            next_update: AtomicU64::new(NOT_SCHEDULED),
            effective: ArcSwapOption::empty(),
            update_pending: AtomicBool::new(false),
        })
    }

    /// Applies this cache to `promise`.
    pub fn wrap(self: Arc<Self>, promise: Promise<T>) -> Promise<T> {
        let upstream = promise.upstream();
        Promise::raw(move |downstream| self.connect(&upstream, downstream))
    }

    /// True when the value is due for a refresh.
    pub fn is_stale(&self) -> bool {
        self.now_millis() >= self.next_update.load(Ordering::Acquire)
    }

    pub fn is_refreshing(&self) -> bool {
        self.update_pending.load(Ordering::Acquire)
    }

    fn connect(self: &Arc<Self>, upstream: &Upstream<T>, downstream: Downstream<T>) {
        let current = match self.effective.load_full() {
            Some(current) => current,
            None => self.install(upstream),
        };

        if current.has_value()
            && self.is_stale()
            && self
                .update_pending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.refresh(upstream.clone());
        }

        current.connect(downstream);
    }

    /// Installs the first effective upstream; the loser of a race adopts the
    /// winner's.
    fn install(self: &Arc<Self>, upstream: &Upstream<T>) -> Arc<CachingUpstream<T>> {
        let candidate = CachingUpstream::new(self.observed(upstream.clone()), success_only);
        let empty: Option<Arc<CachingUpstream<T>>> = None;
        let previous = self.effective.compare_and_swap(&empty, Some(candidate.clone()));
        match &*previous {
            Some(winner) => winner.clone(),
            None => candidate,
        }
    }

    /// Records the schedule for every physical fetch of the effective
    /// upstream. Holds the cache weakly since the cache owns the upstream.
    fn observed(self: &Arc<Self>, upstream: Upstream<T>) -> Upstream<T> {
        let cache: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |downstream: Downstream<T>| {
            let cache = cache.clone();
            connect(
                &upstream,
                Downstream::new(move |result: ExecResult<T>| {
                    if let Some(cache) = cache.upgrade() {
                        cache.schedule(result.is_success());
                    }
                    downstream.accept(result);
                }),
            );
        })
    }

    fn refresh(self: &Arc<Self>, upstream: Upstream<T>) {
        debug!("cached value is stale, refreshing in background");
        let candidate = CachingUpstream::new(upstream, success_only);
        let cache = self.clone();
        let run = move || {
            let replacement = candidate.clone();
            candidate.connect(Downstream::new(move |result: ExecResult<T>| {
                cache.refresh_settled(replacement, result);
            }));
        };

        match Execution::fork() {
            Ok(builder) => {
                builder.start(move |_| {
                    run();
                    Ok(())
                });
            }
            Err(_) => run(),
        }
    }

    fn refresh_settled(&self, replacement: Arc<CachingUpstream<T>>, result: ExecResult<T>) {
        match result {
            ExecResult::Success(_) => {
                self.effective.store(Some(replacement));
                self.schedule(true);
                debug!("background refresh succeeded");
            }
            ExecResult::Error(e) => {
                self.schedule(false);
                warn!(error = %e, retry_in = ?self.error_timeout, "background refresh failed, serving previous value");
            }
            ExecResult::Complete => {
                self.schedule(false);
                warn!("background refresh completed without a value, serving previous value");
            }
        }
        self.update_pending.store(false, Ordering::Release);
    }

    fn schedule(&self, success: bool) {
        let ttl = if success {
            self.cache_for
        } else {
            self.error_timeout
        };
        let due = self
            .now_millis()
            .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self.next_update.store(due, Ordering::Release);
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

fn success_only<T>(result: &ExecResult<T>) -> Ttl {
    if result.is_success() {
        Ttl::Eternal
    } else {
        Ttl::Expired
    }
}
