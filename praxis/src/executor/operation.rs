use super::promise::Promise;
use crate::core::{BoxError, ExecError, ExecResult};

/// A promise without a value: completion or error only.
///
/// Every operation is a `Promise<()>` underneath and shares its invariants.
#[derive(Clone, Debug)]
pub struct Operation {
    promise: Promise<()>,
}

impl Operation {
    /// Runs `action` on every subscription.
    pub fn of<F, E>(action: F) -> Self
    where
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::from_promise(Promise::sync(action))
    }

    pub fn noop() -> Self {
        Self::from_promise(Promise::raw(|downstream| downstream.success(())))
    }

    pub fn from_promise(promise: Promise<()>) -> Self {
        Self { promise }
    }

    pub fn promise(self) -> Promise<()> {
        self.promise
    }

    /// Handles an error; returning `Ok` turns it into a normal completion.
    pub fn on_error<F, E>(self, handler: F) -> Operation
    where
        F: Fn(ExecError) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::from_promise(self.promise.on_error(handler))
    }

    /// Runs `next` after this operation succeeds.
    pub fn next(self, next: Operation) -> Operation {
        Self::from_promise(self.promise.flat_map(move |()| next.promise.clone()))
    }

    /// Produces a value once this operation succeeds.
    pub fn map<T, F>(self, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.promise.map(move |()| f())
    }

    pub fn flat_map<T, F>(self, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: Fn() -> Promise<T> + Send + Sync + 'static,
    {
        self.promise.flat_map(move |()| f())
    }

    /// Observes the outcome; `None` means success.
    pub fn wiretap<F>(self, listener: F) -> Operation
    where
        F: Fn(Option<&ExecError>) + Send + Sync + 'static,
    {
        Self::from_promise(self.promise.wiretap(move |result| listener(result.error())))
    }

    /// Runs `block` after success; errors go to the execution's handler.
    pub fn then<F>(self, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.promise.then(move |()| block());
    }

    /// Subscribes without a follow-up.
    pub fn run(self) {
        self.then(|| {});
    }

    /// Delivers `Ok(())` or the error.
    pub fn result<F>(self, consumer: F)
    where
        F: FnOnce(Result<(), ExecError>) + Send + 'static,
    {
        self.promise.result(move |result| {
            consumer(match result {
                ExecResult::Error(e) => Err(e),
                _ => Ok(()),
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecController;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_next_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (log.clone(), log.clone());
        let op = Operation::of(move || {
            a.lock().push("first");
            Ok::<_, ExecError>(())
        })
        .next(Operation::of(move || {
            b.lock().push("second");
            Ok::<_, ExecError>(())
        }));
        let result = ExecController::current()
            .unwrap()
            .yield_single(op.promise())
            .await;
        assert!(result.is_success());
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_error_skips_next_and_reaches_result() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        Operation::of(|| Err(ExecError::msg("write failed")))
            .next(Operation::of(move || {
                *flag.lock() = true;
                Ok::<_, ExecError>(())
            }))
            .result(move |r| {
                let _ = tx.send(r);
            });
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap_err().to_string(), "write failed");
        assert!(!*ran.lock());
    }

    #[tokio::test]
    async fn test_on_error_recovers_and_map_produces_value() {
        let promise = Operation::of(|| Err(ExecError::msg("transient")))
            .on_error(|_| Ok::<_, ExecError>(()))
            .map(|| "recovered");
        let result = ExecController::current()
            .unwrap()
            .yield_single(promise)
            .await;
        assert_eq!(result.into_value(), Some("recovered"));
    }
}
