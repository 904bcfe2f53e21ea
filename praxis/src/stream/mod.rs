//! Minimal publisher / subscriber contract for streaming results.
//!
//! Only what batch streaming needs: demand signalling, at-most-once terminal
//! delivery and conversion of a finished stream back into a [`Promise`].

mod managed;

pub use managed::{ManagedSubscription, SubscriptionHandler};

use crate::core::ExecError;
use crate::executor::{Downstream, Promise};
use parking_lot::Mutex;
use std::sync::Arc;

/// Receives the signals of one subscription.
///
/// `on_subscribe` comes first; then any number of `on_next` calls bounded by
/// requested demand; then at most one of `on_error` / `on_complete`.
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);
    fn on_next(&self, item: T);
    fn on_error(&self, error: ExecError);
    fn on_complete(&self);
}

/// The subscriber's handle for requesting items and cancelling.
pub trait Subscription: Send + Sync {
    /// Requests `n` more items. `n <= 0` is a protocol violation; `i64::MAX`
    /// requests an unbounded stream.
    fn request(&self, n: i64);
    fn cancel(&self);
}

pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// Consumes a publisher into a promise.
pub trait PublisherExt<T: Send + 'static>: Publisher<T> + Sized + 'static {
    /// Folds every item into an accumulator. The promise fails with the
    /// stream's error, if any.
    fn reduce<R, F>(self, seed: R, f: F) -> Promise<R>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(R, T) -> R + Send + Sync + 'static,
    {
        let publisher = Arc::new(self);
        let f = Arc::new(f);
        Promise::async_(move |downstream| {
            publisher.subscribe(Arc::new(Reducer {
                acc: Mutex::new(Some(seed.clone())),
                f: f.clone(),
                downstream: Mutex::new(Some(downstream)),
                subscription: Mutex::new(None),
            }));
        })
    }

    /// Collects every item, in emission order.
    fn to_list(self) -> Promise<Vec<T>>
    where
        T: Clone + Sync,
    {
        self.reduce(Vec::new(), |mut items, item| {
            items.push(item);
            items
        })
    }
}

impl<T: Send + 'static, P: Publisher<T> + 'static> PublisherExt<T> for P {}

struct Reducer<T, R> {
    acc: Mutex<Option<R>>,
    f: Arc<dyn Fn(R, T) -> R + Send + Sync>,
    downstream: Mutex<Option<Downstream<R>>>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
}

impl<T, R> Reducer<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn finish(&self, result: Result<R, ExecError>) {
        self.subscription.lock().take();
        let downstream = self.downstream.lock().take();
        if let Some(downstream) = downstream {
            downstream.accept_result(result);
        }
    }
}

impl<T, R> Subscriber<T> for Reducer<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.subscription.lock() = Some(subscription.clone());
        subscription.request(i64::MAX);
    }

    fn on_next(&self, item: T) {
        let mut acc = self.acc.lock();
        if let Some(current) = acc.take() {
            *acc = Some((self.f)(current, item));
        }
    }

    fn on_error(&self, error: ExecError) {
        self.acc.lock().take();
        self.finish(Err(error));
    }

    fn on_complete(&self) {
        let acc = self.acc.lock().take();
        match acc {
            Some(acc) => self.finish(Ok(acc)),
            None => self.finish(Err(ExecError::IllegalState(
                "reduction lost its accumulator".to_string(),
            ))),
        }
    }
}
