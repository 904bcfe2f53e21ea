use super::{collect_values, Batch, BatchPublisher, ExecInit};
use crate::core::{ExecError, ExecResult};
use crate::executor::{Downstream, Execution, Operation, Promise};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Forks one execution per promise, all started at once.
///
/// The forks inherit nothing from the subscribing execution except its
/// controller; use [`exec_init`](Self::exec_init) to seed their registries.
pub struct ParallelBatch<T> {
    promises: Arc<[Promise<T>]>,
    exec_init: Option<ExecInit>,
}

impl<T> Clone for ParallelBatch<T> {
    fn clone(&self) -> Self {
        Self {
            promises: self.promises.clone(),
            exec_init: self.exec_init.clone(),
        }
    }
}

impl<T: Send + 'static> ParallelBatch<T> {
    pub fn new(promises: Vec<Promise<T>>) -> Self {
        Self {
            promises: promises.into(),
            exec_init: None,
        }
    }

    /// Runs `init` on every forked execution before its item is subscribed.
    pub fn exec_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&Execution) + Send + Sync + 'static,
    {
        self.exec_init = Some(Arc::new(init));
        self
    }

    pub fn len(&self) -> usize {
        self.promises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }
}

/// Forks an execution per promise, reports each result as `on_item`, and
/// calls `on_done` once every fork has completed.
///
/// An error raised inside a fork after its result was delivered is reported
/// to `on_item` as well.
pub(super) fn fan_out<T, I, D>(
    exec: &Execution,
    promises: &Arc<[Promise<T>]>,
    exec_init: &Option<ExecInit>,
    on_item: Arc<I>,
    on_done: D,
) where
    T: Send + 'static,
    I: Fn(usize, ExecResult<T>) + Send + Sync + 'static,
    D: FnOnce() + Send + 'static,
{
    if promises.is_empty() {
        on_done();
        return;
    }
    let remaining = Arc::new(AtomicUsize::new(promises.len()));
    let on_done = Arc::new(Mutex::new(Some(on_done)));

    for (index, promise) in promises.iter().cloned().enumerate() {
        let mut builder = exec.controller().fork();
        if let Some(init) = exec_init.clone() {
            builder = builder.on_start(move |forked| init(forked));
        }
        let failed = on_item.clone();
        let delivered = on_item.clone();
        let remaining = remaining.clone();
        let on_done = on_done.clone();
        builder
            .on_error(move |e| failed(index, ExecResult::Error(e)))
            .on_complete(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let done = on_done.lock().take();
                    if let Some(done) = done {
                        done();
                    }
                }
            })
            .start(move |_| {
                promise.result(move |result| delivered(index, result));
                Ok(())
            });
    }
}

fn empty_slots<T>(len: usize) -> Arc<Mutex<Vec<Option<T>>>> {
    Arc::new(Mutex::new((0..len).map(|_| None).collect()))
}

impl<T: Send + 'static> Batch<T> for ParallelBatch<T> {
    fn yield_all(&self) -> Promise<Vec<ExecResult<T>>> {
        let promises = self.promises.clone();
        let exec_init = self.exec_init.clone();
        Promise::on_execution(move |exec, downstream| {
            let slots = empty_slots::<ExecResult<T>>(promises.len());
            let store = slots.clone();
            let on_item = Arc::new(move |index: usize, result: ExecResult<T>| {
                let mut slots = store.lock();
                if slots[index].is_none() {
                    slots[index] = Some(result);
                }
            });
            fan_out(exec, &promises, &exec_init, on_item, move || {
                let results = slots
                    .lock()
                    .drain(..)
                    .map(|slot| slot.unwrap_or(ExecResult::Error(ExecError::Abandoned)))
                    .collect();
                downstream.success(results);
            });
        })
    }

    fn try_yield(&self) -> Promise<Vec<T>> {
        let batch = self.clone();
        Promise::flatten(move || {
            let slots = empty_slots::<T>(batch.len());
            let store = slots.clone();
            batch
                .for_each(move |index, value| store.lock()[index] = Some(value))
                .promise()
                .try_map(move |()| collect_values(std::mem::take(&mut *slots.lock())))
        })
    }

    fn for_each<F>(&self, consumer: F) -> Operation
    where
        F: Fn(usize, T) + Send + Sync + 'static,
    {
        let promises = self.promises.clone();
        let exec_init = self.exec_init.clone();
        let consumer = Arc::new(consumer);
        Operation::from_promise(Promise::on_execution(
            move |exec, downstream: Downstream<()>| {
                let first_error: Arc<Mutex<Option<ExecError>>> = Arc::default();
                let record = first_error.clone();
                let consumer = consumer.clone();
                let on_item = Arc::new(move |index: usize, result: ExecResult<T>| {
                    let error = match result {
                        ExecResult::Success(value) => {
                            let failed = record.lock().is_some();
                            if !failed {
                                consumer(index, value);
                            }
                            return;
                        }
                        ExecResult::Error(e) => e,
                        ExecResult::Complete => return,
                    };
                    let mut slot = record.lock();
                    if slot.is_none() {
                        *slot = Some(error);
                    }
                });
                fan_out(exec, &promises, &exec_init, on_item, move || {
                    let error = first_error.lock().take();
                    match error {
                        Some(e) => downstream.error(e),
                        None => downstream.success(()),
                    }
                });
            },
        ))
    }

    fn publisher(&self) -> BatchPublisher<T> {
        BatchPublisher::new(self.promises.clone(), false, self.exec_init.clone())
    }
}
