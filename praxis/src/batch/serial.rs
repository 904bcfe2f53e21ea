use super::{value_missing, Batch, BatchPublisher};
use crate::core::{ExecError, ExecResult};
use crate::executor::{Downstream, Execution, Operation, Promise};
use parking_lot::Mutex;
use std::sync::Arc;

/// Runs promise `i + 1` only after promise `i` has settled.
///
/// Each step resumes as its own segment of the subscribing execution, so
/// long batches of synchronous promises do not grow the stack.
pub struct SerialBatch<T> {
    promises: Arc<[Promise<T>]>,
}

impl<T> Clone for SerialBatch<T> {
    fn clone(&self) -> Self {
        Self {
            promises: self.promises.clone(),
        }
    }
}

impl<T: Send + 'static> SerialBatch<T> {
    pub fn new(promises: Vec<Promise<T>>) -> Self {
        Self {
            promises: promises.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.promises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }
}

/// Subscribes `promise` so that `step` runs as a fresh segment of the
/// current execution.
fn settle_then<T, F>(promise: &Promise<T>, step: F)
where
    T: Send + 'static,
    F: FnOnce(ExecResult<T>) + Send + 'static,
{
    let downstream = Downstream::new(step);
    match Execution::current() {
        Ok(exec) => promise.connect(exec.bind(downstream)),
        Err(_) => promise.connect(downstream),
    }
}

fn collect_all<T: Send + 'static>(
    promises: Arc<[Promise<T>]>,
    index: usize,
    mut results: Vec<ExecResult<T>>,
    downstream: Downstream<Vec<ExecResult<T>>>,
) {
    let Some(promise) = promises.get(index).cloned() else {
        downstream.success(results);
        return;
    };
    settle_then(&promise, move |result| {
        results.push(result);
        collect_all(promises, index + 1, results, downstream);
    });
}

/// Visits results in source order until `visitor` fails.
fn visit<T, F>(promises: Arc<[Promise<T>]>, index: usize, visitor: Arc<F>, downstream: Downstream<()>)
where
    T: Send + 'static,
    F: Fn(usize, ExecResult<T>) -> Result<(), ExecError> + Send + Sync + 'static,
{
    let Some(promise) = promises.get(index).cloned() else {
        downstream.success(());
        return;
    };
    settle_then(&promise, move |result| {
        downstream.guarded(|downstream| match visitor(index, result) {
            Ok(()) => visit(promises, index + 1, visitor, downstream),
            Err(e) => downstream.error(e),
        });
    });
}

impl<T: Send + 'static> Batch<T> for SerialBatch<T> {
    fn yield_all(&self) -> Promise<Vec<ExecResult<T>>> {
        let promises = self.promises.clone();
        Promise::raw(move |downstream| {
            let results = Vec::with_capacity(promises.len());
            collect_all(promises.clone(), 0, results, downstream);
        })
    }

    fn try_yield(&self) -> Promise<Vec<T>> {
        let promises = self.promises.clone();
        Promise::raw(move |downstream: Downstream<Vec<T>>| {
            let values = Arc::new(Mutex::new(Vec::with_capacity(promises.len())));
            let collected = values.clone();
            let visitor = Arc::new(move |index: usize, result: ExecResult<T>| match result {
                ExecResult::Success(value) => {
                    collected.lock().push(value);
                    Ok(())
                }
                ExecResult::Error(e) => Err(e),
                ExecResult::Complete => Err(value_missing(index)),
            });
            let done = Downstream::new(move |result: ExecResult<()>| match result {
                ExecResult::Error(e) => downstream.error(e),
                _ => downstream.success(std::mem::take(&mut *values.lock())),
            });
            visit(promises.clone(), 0, visitor, done);
        })
    }

    fn for_each<F>(&self, consumer: F) -> Operation
    where
        F: Fn(usize, T) + Send + Sync + 'static,
    {
        let promises = self.promises.clone();
        let visitor = Arc::new(move |index: usize, result: ExecResult<T>| {
            match result {
                ExecResult::Success(value) => consumer(index, value),
                ExecResult::Error(e) => return Err(e),
                ExecResult::Complete => {}
            }
            Ok(())
        });
        Operation::from_promise(Promise::raw(move |downstream| {
            visit(promises.clone(), 0, visitor.clone(), downstream);
        }))
    }

    fn publisher(&self) -> BatchPublisher<T> {
        BatchPublisher::new(self.promises.clone(), true, None)
    }
}
