use super::downstream::Downstream;
use super::operation::Operation;
use super::promise::Promise;
use crate::core::{BoxError, ExecError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Moves blocking work off the execution threads.
///
/// The work runs on the runtime's blocking pool, inside the execution's
/// interceptors tagged [`ExecType::Blocking`](crate::ExecType), and its
/// result resumes the subscribing execution, so blocking I/O never stalls a
/// compute worker.
pub struct Blocking;

impl Blocking {
    /// Runs `work` on the blocking pool for every subscription.
    pub fn get<T, E, F>(work: F) -> Promise<T>
    where
        T: Send + 'static,
        E: Into<BoxError>,
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        Promise::on_execution(move |exec, downstream: Downstream<T>| {
            let work = work.clone();
            let owner = exec.clone();
            exec.controller().handle().spawn_blocking(move || {
                downstream.guarded(|downstream| {
                    let outcome = owner.intercept_blocking(|| work().map_err(ExecError::failed));
                    downstream.accept_result(outcome.and_then(|result| result));
                });
            });
        })
    }

    pub fn op<E, F>(work: F) -> Operation
    where
        E: Into<BoxError>,
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
    {
        Operation::from_promise(Self::get(work))
    }

    /// Blocking work that can only be subscribed once.
    pub(crate) fn get_once<T, E, F>(work: F) -> Promise<T>
    where
        T: Send + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let cell = Mutex::new(Some(work));
        Self::get(move || {
            let work = cell.lock().take();
            match work {
                Some(work) => work().map_err(ExecError::failed),
                None => Err(ExecError::IllegalState(
                    "blocking work was already consumed".to_string(),
                )),
            }
        })
    }
}
