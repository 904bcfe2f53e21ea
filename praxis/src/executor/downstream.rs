use crate::core::{ExecError, ExecResult};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::trace;

type Sink<T> = Box<dyn FnOnce(ExecResult<T>) + Send>;

/// The consumer side of a promise subscription.
///
/// A producer must call exactly one of [`success`](Self::success),
/// [`error`](Self::error) or [`complete`](Self::complete), once. All three
/// consume the downstream, so a second signal does not type-check. A
/// downstream dropped without any signal delivers [`ExecError::Abandoned`] so
/// the subscriber is never left waiting forever.
pub struct Downstream<T> {
    slot: Arc<Mutex<Option<Sink<T>>>>,
}

/// Second handle on a downstream's slot, used to fail a subscription whose
/// producer panicked after taking ownership of the downstream.
pub(crate) struct DownstreamGuard<T> {
    slot: Arc<Mutex<Option<Sink<T>>>>,
}

impl<T: Send + 'static> Downstream<T> {
    pub fn new<F>(sink: F) -> Self
    where
        F: FnOnce(ExecResult<T>) + Send + 'static,
    {
        Self {
            slot: Arc::new(Mutex::new(Some(Box::new(sink)))),
        }
    }

    pub fn success(self, value: T) {
        self.accept(ExecResult::Success(value));
    }

    pub fn error(self, error: ExecError) {
        self.accept(ExecResult::Error(error));
    }

    /// Signals completion without a value.
    pub fn complete(self) {
        self.accept(ExecResult::Complete);
    }

    /// Delivers an already-settled result.
    pub fn accept(self, result: ExecResult<T>) {
        let sink = self.slot.lock().take();
        if let Some(sink) = sink {
            sink(result);
        }
    }

    /// Delivers `Ok` as success and `Err` as error.
    pub fn accept_result(self, result: Result<T, ExecError>) {
        self.accept(result.into());
    }

    pub(crate) fn guard(&self) -> DownstreamGuard<T> {
        DownstreamGuard {
            slot: self.slot.clone(),
        }
    }

    /// Runs `f` with this downstream, failing it with
    /// [`ExecError::Panicked`] if `f` panics before signalling.
    pub(crate) fn guarded<F>(self, f: F)
    where
        F: FnOnce(Downstream<T>),
    {
        let guard = self.guard();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            guard.fail(ExecError::from_panic(payload));
        }
    }
}

impl<T> DownstreamGuard<T> {
    pub(crate) fn fail(self, error: ExecError) {
        let sink = self.slot.lock().take();
        if let Some(sink) = sink {
            sink(ExecResult::Error(error));
        }
    }
}

impl<T> Drop for Downstream<T> {
    fn drop(&mut self) {
        // While unwinding, the enclosing boundary fails the slot itself.
        if std::thread::panicking() {
            return;
        }
        let sink = self.slot.lock().take();
        if let Some(sink) = sink {
            trace!("downstream dropped without a signal");
            sink(ExecResult::Error(ExecError::Abandoned));
        }
    }
}

impl<T> std::fmt::Debug for Downstream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downstream")
            .field("signalled", &self.slot.lock().is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording() -> (Downstream<u32>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let down = Downstream::new(move |r: ExecResult<u32>| {
            sink.lock().push(match r {
                ExecResult::Success(v) => format!("success:{v}"),
                ExecResult::Error(e) => format!("error:{e}"),
                ExecResult::Complete => "complete".to_string(),
            });
        });
        (down, seen)
    }

    #[test]
    fn test_success_is_delivered_once() {
        let (down, seen) = recording();
        down.success(7);
        assert_eq!(*seen.lock(), vec!["success:7"]);
    }

    #[test]
    fn test_drop_delivers_abandoned() {
        let (down, seen) = recording();
        drop(down);
        assert_eq!(
            *seen.lock(),
            vec!["error:downstream dropped without a signal"]
        );
    }

    #[test]
    fn test_guarded_converts_panic_to_error() {
        let (down, seen) = recording();
        down.guarded(|_d| panic!("producer exploded"));
        assert_eq!(*seen.lock(), vec!["error:panicked: producer exploded"]);
    }

    #[test]
    fn test_guard_after_signal_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let down = Downstream::new(move |_: ExecResult<()>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let guard = down.guard();
        down.complete();
        guard.fail(ExecError::Abandoned);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
