use super::ExecInit;
use crate::core::{ExecError, ExecResult};
use crate::executor::{ExecController, Execution, Promise};
use crate::stream::{ManagedSubscription, Publisher, Subscriber, Subscription, SubscriptionHandler};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Streams a batch's values in the order they complete.
///
/// Every subscription runs the batch afresh. Parallel publishers start one
/// item per unit of demand; serial publishers keep at most one item in
/// flight. The first failed item halts emission: buffered values are
/// disposed and the error is the last signal.
pub struct BatchPublisher<T> {
    promises: Arc<[Promise<T>]>,
    serial: bool,
    exec_init: Option<ExecInit>,
}

impl<T> BatchPublisher<T> {
    pub(super) fn new(promises: Arc<[Promise<T>]>, serial: bool, exec_init: Option<ExecInit>) -> Self {
        Self {
            promises,
            serial,
            exec_init,
        }
    }
}

impl<T: Send + 'static> Publisher<T> for BatchPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let controller = match Execution::current_opt() {
            Some(exec) => Ok(exec.controller().clone()),
            None => ExecController::current(),
        };
        match controller {
            Ok(controller) => {
                let emitter = Emitter {
                    promises: self.promises.clone(),
                    serial: self.serial,
                    exec_init: self.exec_init.clone(),
                    controller,
                    next: AtomicUsize::new(0),
                    finished: AtomicUsize::new(0),
                    in_flight: AtomicBool::new(false),
                    buffer: SegQueue::new(),
                    error: Mutex::new(None),
                    halted: AtomicBool::new(false),
                    draining: AtomicBool::new(false),
                };
                ManagedSubscription::new(subscriber, drop, emitter).start();
            }
            Err(e) => {
                subscriber.on_subscribe(Arc::new(Inert));
                subscriber.on_error(e);
            }
        }
    }
}

/// Handed out when there is no runtime to run the batch on.
struct Inert;

impl Subscription for Inert {
    fn request(&self, _: i64) {}
    fn cancel(&self) {}
}

struct Emitter<T> {
    promises: Arc<[Promise<T>]>,
    serial: bool,
    exec_init: Option<ExecInit>,
    controller: ExecController,
    next: AtomicUsize,
    finished: AtomicUsize,
    in_flight: AtomicBool,
    buffer: SegQueue<T>,
    error: Mutex<Option<ExecError>>,
    halted: AtomicBool,
    draining: AtomicBool,
}

type Sub<T> = Arc<ManagedSubscription<T, Emitter<T>>>;

impl<T: Send + 'static> Emitter<T> {
    fn launch_parallel(&self, sub: &Sub<T>, n: i64) {
        let mut launched = 0;
        while launched < n && !sub.is_done() && !self.halted.load(Ordering::Acquire) {
            let index = self.next.fetch_add(1, Ordering::AcqRel);
            if index >= self.promises.len() {
                break;
            }
            self.launch(sub, index);
            launched += 1;
        }
    }

    fn launch_serial(&self, sub: &Sub<T>) {
        if !sub.has_demand() || sub.is_done() || self.halted.load(Ordering::Acquire) {
            return;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        if index >= self.promises.len() {
            self.in_flight.store(false, Ordering::Release);
            return;
        }
        self.launch(sub, index);
    }

    fn launch(&self, sub: &Sub<T>, index: usize) {
        let promise = self.promises[index].clone();
        let mut builder = self.controller.fork();
        if let Some(init) = self.exec_init.clone() {
            builder = builder.on_start(move |forked| init(forked));
        }
        let failed = sub.clone();
        let settled = sub.clone();
        let accepting = sub.clone();
        builder
            .on_error(move |e| failed.handler().accept(&failed, ExecResult::Error(e)))
            .on_complete(move |_| {
                let emitter = settled.handler();
                emitter.finished.fetch_add(1, Ordering::AcqRel);
                emitter.in_flight.store(false, Ordering::Release);
                emitter.drain(&settled);
                if emitter.serial {
                    emitter.launch_serial(&settled);
                }
            })
            .start(move |_| {
                promise.result(move |result| accepting.handler().accept(&accepting, result));
                Ok(())
            });
    }

    fn accept(&self, sub: &Sub<T>, result: ExecResult<T>) {
        match result {
            ExecResult::Success(value) if self.halted.load(Ordering::Acquire) => sub.dispose(value),
            ExecResult::Success(value) => self.buffer.push(value),
            ExecResult::Error(e) => {
                let first = !self.halted.swap(true, Ordering::AcqRel);
                if first {
                    *self.error.lock() = Some(e);
                } else {
                    debug!(error = %e, "batch item failed after emission halted");
                }
            }
            ExecResult::Complete => {}
        }
    }

    fn dispose_buffer(&self, sub: &Sub<T>) {
        while let Some(item) = self.buffer.pop() {
            sub.dispose(item);
        }
    }

    fn all_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire) >= self.promises.len()
    }

    fn has_work(&self, sub: &Sub<T>) -> bool {
        if sub.is_done() {
            return !self.buffer.is_empty();
        }
        self.error.lock().is_some()
            || (sub.has_demand() && !self.buffer.is_empty())
            || (self.buffer.is_empty() && self.all_finished())
    }

    /// Emits buffered values while there is demand. Only one thread drains
    /// at a time; work arriving meanwhile is picked up by the loop.
    fn drain(&self, sub: &Sub<T>) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                if sub.is_done() {
                    self.dispose_buffer(sub);
                    break;
                }
                let error = self.error.lock().take();
                if let Some(error) = error {
                    self.dispose_buffer(sub);
                    sub.emit_error(error);
                    break;
                }
                if sub.has_demand() {
                    if let Some(item) = self.buffer.pop() {
                        sub.emit_next(item);
                        continue;
                    }
                }
                if self.buffer.is_empty() && self.all_finished() {
                    sub.emit_complete();
                }
                break;
            }
            self.draining.store(false, Ordering::Release);
            if !self.has_work(sub) {
                return;
            }
        }
    }
}

impl<T: Send + 'static> SubscriptionHandler<T> for Emitter<T> {
    fn on_request(&self, sub: &Sub<T>, n: i64) {
        if self.serial {
            self.launch_serial(sub);
        } else {
            self.launch_parallel(sub, n);
        }
        self.drain(sub);
    }

    fn on_cancel(&self, sub: &Sub<T>) {
        self.halted.store(true, Ordering::Release);
        self.drain(sub);
    }
}
