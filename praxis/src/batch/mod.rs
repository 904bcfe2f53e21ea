//! Aggregation of many promises into one.
//!
//! A batch is a fixed, ordered list of promises. [`serial`] runs them one
//! after another on the subscribing execution; [`parallel`] forks one
//! execution per promise. Both offer the same four views:
//!
//! - [`Batch::yield_all`]: every result, in source order, never fails
//! - [`Batch::try_yield`]: every value in source order, or the first error
//! - [`Batch::for_each`]: a callback per value
//! - [`Batch::publisher`]: a stream of values in completion order
//!
//! Following Parnas's information hiding principle, this module hides how
//! items are scheduled and how source order is reconstructed.

mod parallel;
mod publisher;
mod serial;

pub use parallel::ParallelBatch;
pub use publisher::BatchPublisher;
pub use serial::SerialBatch;

use crate::core::{ExecError, ExecResult};
use crate::executor::{Execution, Operation, Promise};
use std::sync::Arc;

pub(crate) type ExecInit = Arc<dyn Fn(&Execution) + Send + Sync>;

/// The views shared by serial and parallel batches.
pub trait Batch<T: Send + 'static> {
    /// Runs every promise to completion and yields all results in source
    /// order. The returned promise never fails.
    fn yield_all(&self) -> Promise<Vec<ExecResult<T>>>;

    /// Yields all values in source order, or fails with the first error: by
    /// completion time for parallel batches, by source order for serial ones
    /// (later items are then never started).
    fn try_yield(&self) -> Promise<Vec<T>>;

    /// Calls `consumer(index, value)` for every successful item and fails
    /// with the first error. Serial batches call it in source order.
    fn for_each<F>(&self, consumer: F) -> Operation
    where
        F: Fn(usize, T) + Send + Sync + 'static;

    /// A stream of values in completion order that halts after the first
    /// error.
    fn publisher(&self) -> BatchPublisher<T>;
}

/// A batch that forks one execution per promise.
///
/// # Example
///
/// ```no_run
/// use praxis::batch::{self, Batch};
/// use praxis::stream::PublisherExt;
/// use praxis::Promise;
///
/// let sum = batch::parallel((0..100).map(Promise::value))
///     .publisher()
///     .reduce(0, |acc, v| acc + v);
/// ```
pub fn parallel<T, I>(promises: I) -> ParallelBatch<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    ParallelBatch::new(promises.into_iter().collect())
}

/// A batch that runs one promise at a time on the subscribing execution.
pub fn serial<T, I>(promises: I) -> SerialBatch<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    SerialBatch::new(promises.into_iter().collect())
}

fn value_missing(index: usize) -> ExecError {
    ExecError::Message(format!("batch item {index} completed without a value"))
}

/// Unwraps source-ordered slots into values.
fn collect_values<T>(slots: Vec<Option<T>>) -> Result<Vec<T>, ExecError> {
    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| slot.ok_or_else(|| value_missing(index)))
        .collect()
}
