//! Interceptors wrapped around the code an execution runs.
//!
//! Every segment of an execution, and every piece of work handed to the
//! blocking pool through [`Blocking`](crate::Blocking), runs inside the
//! interceptors registered on its controller followed by those registered on
//! the execution itself. The first registered is the outermost.

use super::execution::Execution;
use crate::core::ExecError;
use std::fmt;
use std::sync::Arc;

/// What kind of thread an intercepted piece of code runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecType {
    /// A segment on the execution's driver.
    Compute,
    /// Work on the blocking pool.
    Blocking,
}

/// Wraps the code an execution runs, e.g. to install thread-local context or
/// to record timings.
///
/// An implementation must call [`Continuation::proceed`] exactly once. One
/// that returns without proceeding fails the segment with
/// [`ExecError::IllegalState`]. An error returned here goes to the
/// execution's error handler like any segment error.
///
/// ```
/// use praxis::{Continuation, ExecError, ExecInterceptor, ExecType, Execution};
/// use std::time::Instant;
///
/// struct Timing;
///
/// impl ExecInterceptor for Timing {
///     fn intercept(
///         &self,
///         exec: &Execution,
///         exec_type: ExecType,
///         continuation: Continuation<'_>,
///     ) -> Result<(), ExecError> {
///         let started = Instant::now();
///         let result = continuation.proceed();
///         tracing::trace!(execution = %exec.id(), ?exec_type, elapsed = ?started.elapsed());
///         result
///     }
/// }
/// ```
pub trait ExecInterceptor: Send + Sync + 'static {
    fn intercept(
        &self,
        exec: &Execution,
        exec_type: ExecType,
        continuation: Continuation<'_>,
    ) -> Result<(), ExecError>;
}

/// The rest of the interceptor chain plus the intercepted code.
pub struct Continuation<'a> {
    run: Box<dyn FnOnce() -> Result<(), ExecError> + 'a>,
}

impl<'a> Continuation<'a> {
    /// Runs the remaining interceptors and then the intercepted code.
    pub fn proceed(self) -> Result<(), ExecError> {
        (self.run)()
    }
}

impl fmt::Debug for Continuation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation").finish_non_exhaustive()
    }
}

pub(crate) type Interceptors = Arc<[Arc<dyn ExecInterceptor>]>;

/// Runs `code` inside `interceptors`, outermost first.
pub(crate) fn intercept<'a>(
    exec: &'a Execution,
    interceptors: &'a [Arc<dyn ExecInterceptor>],
    exec_type: ExecType,
    code: Box<dyn FnOnce() -> Result<(), ExecError> + 'a>,
) -> Result<(), ExecError> {
    match interceptors.split_first() {
        None => code(),
        Some((outer, rest)) => outer.intercept(
            exec,
            exec_type,
            Continuation {
                run: Box::new(move || intercept(exec, rest, exec_type, code)),
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Blocking, ExecController, Promise};
    use parking_lot::Mutex;

    struct Recording {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ExecInterceptor for Recording {
        fn intercept(
            &self,
            _exec: &Execution,
            exec_type: ExecType,
            continuation: Continuation<'_>,
        ) -> Result<(), ExecError> {
            self.log.lock().push(format!("{} enter {:?}", self.label, exec_type));
            let result = continuation.proceed();
            self.log.lock().push(format!("{} exit {:?}", self.label, exec_type));
            result
        }
    }

    struct Skipping;

    impl ExecInterceptor for Skipping {
        fn intercept(&self, _: &Execution, _: ExecType, _: Continuation<'_>) -> Result<(), ExecError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_wraps_compute_and_blocking_code() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let controller = ExecController::current().unwrap();
        controller.add_interceptor(Recording {
            label: "controller",
            log: log.clone(),
        });

        let seen = log.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        controller
            .fork()
            .intercept(Recording {
                label: "execution",
                log: log.clone(),
            })
            .start(move |_| {
                seen.lock().push("segment".to_string());
                Blocking::get(move || {
                    Ok::<_, ExecError>(Execution::is_active())
                })
                .then(move |on_exec| {
                    let _ = tx.send(on_exec);
                });
                Ok(())
            });
        assert_eq!(rx.await.ok(), Some(false));

        let log = log.lock().clone();
        assert_eq!(
            &log[..5],
            [
                "controller enter Compute",
                "execution enter Compute",
                "segment",
                "execution exit Compute",
                "controller exit Compute",
            ]
        );
        let blocking: Vec<&str> = log
            .iter()
            .map(String::as_str)
            .filter(|line| line.ends_with("Blocking"))
            .collect();
        assert_eq!(
            blocking,
            [
                "controller enter Blocking",
                "execution enter Blocking",
                "execution exit Blocking",
                "controller exit Blocking",
            ]
        );
    }

    #[tokio::test]
    async fn test_interceptor_that_never_proceeds_fails_segment() {
        let controller = ExecController::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        controller
            .fork()
            .intercept(Skipping)
            .on_error(move |error| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(error);
                }
            })
            .start(|_| {
                Promise::value(1).then(|_| {});
                Ok(())
            });
        let error = rx.await.unwrap();
        assert!(matches!(error, ExecError::IllegalState(_)));
    }
}
