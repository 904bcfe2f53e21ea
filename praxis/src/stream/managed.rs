use super::{Subscriber, Subscription};
use crate::core::{panic_message, ExecError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

const INIT: u8 = 0;
const STOPPED: u8 = 1;

/// The publisher-specific half of a [`ManagedSubscription`].
pub trait SubscriptionHandler<T>: Send + Sync + Sized + 'static {
    /// Called with each positive demand increment up to and including the
    /// one that opens the subscription, never re-entrantly from inside an
    /// `on_next` delivery.
    fn on_request(&self, subscription: &Arc<ManagedSubscription<T, Self>>, n: i64);

    fn on_cancel(&self, subscription: &Arc<ManagedSubscription<T, Self>>);
}

/// A subscription that does the demand and terminal-signal bookkeeping for a
/// publisher.
///
/// - `request(n <= 0)` reports a protocol error (reactive-streams rule 3.9)
///   and cancels.
/// - `request(i64::MAX)`, or demand that overflows, switches to open mode.
///   Later requests are ignored.
/// - Demand requested while an item is being delivered counts immediately,
///   but the handler only hears of it after the delivery returns.
/// - Error and complete are delivered at most once, guarded by a swap of the
///   `INIT -> STOPPED` state. Cancellation stops item delivery but does not
///   take the terminal slot, so a terminal signal racing a cancel is still
///   delivered exactly once.
/// - Items emitted after cancellation go to the disposer.
pub struct ManagedSubscription<T, H> {
    me: Weak<Self>,
    subscriber: Arc<dyn Subscriber<T>>,
    disposer: Box<dyn Fn(T) + Send + Sync>,
    handler: H,
    open: AtomicBool,
    demand: AtomicI64,
    state: AtomicU8,
    cancelled: AtomicBool,
    emitting: AtomicBool,
    emit_demand: AtomicI64,
}

impl<T, H> ManagedSubscription<T, H>
where
    T: Send + 'static,
    H: SubscriptionHandler<T>,
{
    pub fn new<D>(subscriber: Arc<dyn Subscriber<T>>, disposer: D, handler: H) -> Arc<Self>
    where
        D: Fn(T) + Send + Sync + 'static,
    {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            subscriber,
            disposer: Box::new(disposer),
            handler,
            open: AtomicBool::new(false),
            demand: AtomicI64::new(0),
            state: AtomicU8::new(INIT),
            cancelled: AtomicBool::new(false),
            emitting: AtomicBool::new(false),
            emit_demand: AtomicI64::new(0),
        })
    }

    /// Hands the subscription to the subscriber.
    pub fn start(self: &Arc<Self>) {
        self.subscriber.on_subscribe(self.clone());
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Outstanding demand; meaningless in open mode.
    pub fn demand(&self) -> i64 {
        self.demand.load(Ordering::Acquire)
    }

    pub fn has_demand(&self) -> bool {
        !self.is_done() && (self.is_open() || self.demand() > 0)
    }

    /// True once cancelled or terminated; no more items are delivered.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.state.load(Ordering::Acquire) == STOPPED
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Delivers an item, or disposes of it when the subscription is done.
    pub fn emit_next(&self, item: T) {
        if self.is_done() {
            self.dispose(item);
            return;
        }
        if !self.is_open() {
            self.demand.fetch_sub(1, Ordering::AcqRel);
        }

        self.emitting.store(true, Ordering::Release);
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| self.subscriber.on_next(item)));
        self.emitting.store(false, Ordering::Release);

        if let Err(payload) = delivered {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "subscriber panicked in on_next, cancelling");
            self.cancel_subscription();
            self.emit_error(ExecError::Panicked(message));
            return;
        }

        let held = self.emit_demand.swap(0, Ordering::AcqRel);
        if held != 0 {
            self.forward_request(held);
        }
    }

    pub fn emit_error(&self, error: ExecError) {
        if self.fire_done() {
            self.subscriber.on_error(error);
        }
    }

    pub fn emit_complete(&self) {
        if self.fire_done() {
            self.subscriber.on_complete();
        }
    }

    /// Passes an undeliverable item to the disposer. A panicking disposer is
    /// logged and ignored.
    pub fn dispose(&self, item: T) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (self.disposer)(item))) {
            warn!(panic = %panic_message(payload.as_ref()), "disposer panicked, item dropped");
        }
    }

    fn fire_done(&self) -> bool {
        self.state.swap(STOPPED, Ordering::AcqRel) != STOPPED
    }

    fn cancel_subscription(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("subscription cancelled");
        if let Some(me) = self.me.upgrade() {
            self.handler.on_cancel(&me);
        }
    }

    /// Adds `n` to the outstanding demand, switching to open mode on
    /// `i64::MAX` or overflow. Returns false when already open, as there is
    /// nothing left to account for.
    fn add_demand(&self, n: i64) -> bool {
        if self.is_open() {
            return false;
        }
        let previous = self
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.checked_add(n).unwrap_or(i64::MAX))
            })
            .unwrap_or(i64::MAX);
        if n == i64::MAX || previous.checked_add(n).is_none() {
            self.open.store(true, Ordering::Release);
        }
        true
    }

    fn forward_request(&self, n: i64) {
        if let Some(me) = self.me.upgrade() {
            self.handler.on_request(&me, n);
        }
    }
}

impl<T, H> Subscription for ManagedSubscription<T, H>
where
    T: Send + 'static,
    H: SubscriptionHandler<T>,
{
    fn request(&self, n: i64) {
        if self.is_done() {
            return;
        }
        if n < 1 {
            self.emit_error(ExecError::Protocol(format!(
                "3.9 violated: positive request amount required but it was {n}"
            )));
            self.cancel_subscription();
            return;
        }
        if !self.add_demand(n) {
            return;
        }
        // Requested from within on_next: the demand counts right away, the
        // handler hears about it once the item has been delivered.
        if self.emitting.load(Ordering::Acquire) {
            self.emit_demand
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                    Some(d.checked_add(n).unwrap_or(i64::MAX))
                })
                .ok();
            return;
        }
        self.forward_request(n);
    }

    fn cancel(&self) {
        self.cancel_subscription();
    }
}
