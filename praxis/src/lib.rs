//! Praxis: Promise-based Execution Engine for Rust
//!
//! `praxis` (πρᾶξις, Greek for "action" or "doing") runs asynchronous work as
//! *executions*: logical threads of control that hop between runtime workers
//! but never run two of their own segments at once. Work is composed from
//! lazy [`Promise`]s and [`Operation`]s, and nothing runs until something
//! subscribes.
//!
//! # Features
//!
//! - **Executions**: serialized segments, a per-execution registry, error and
//!   completion hooks
//! - **Promises**: lazy, cold, composable; every subscription reruns the
//!   upstream unless cached
//! - **Caching**: single-flight caching with TTLs, and a stale-while-refresh
//!   cache that keeps serving the last good value while refreshes fail
//! - **Batches**: serial or parallel fan-out with fail-fast, fail-soft and
//!   streaming consumption
//! - **Streams**: a demand-tracking subscription that enforces the
//!   reactive-streams rules
//! - **Recurring services**: a CAS-guarded state machine that repeats an
//!   action on a schedule
//!
//! # Quick Start
//!
//! ```no_run
//! use praxis::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ExecError> {
//!     let controller = ExecController::current()?;
//!
//!     let config = Promise::sync(|| Ok::<_, ExecError>(String::from("loaded")))
//!         .cache_fault_tolerant(Duration::from_secs(30), Duration::from_secs(5));
//!
//!     let both = batch::parallel(vec![config.clone(), config.map(|s| s.to_uppercase())])
//!         .try_yield();
//!
//!     let values = controller.yield_single(both).await.into_result()?;
//!     println!("{values:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! Following Parnas's information hiding principles, each module hides specific design
//! decisions that are likely to change:
//!
//! - [`core`]: Foundation types (hides error representation and retry math)
//! - [`executor`]: Execution engine (hides segment scheduling and thread hopping)
//! - [`cache`]: Promise caches (hides concurrency control of shared results)
//! - [`stream`]: Publisher/subscriber plumbing (hides demand accounting)
//! - [`batch`]: Promise aggregation (hides fan-out and ordering)
//! - [`service`]: Lifecycle services (hides timer management)

pub mod batch;
pub mod cache;
pub mod core;
pub mod executor;
pub mod service;
pub mod stream;

pub use core::{BoxError, ExecError, ExecResult, Result, RetryPolicy, Retryable};

pub use executor::{
    Blocking, Continuation, Downstream, ExecConfig, ExecController, ExecControllerBuilder,
    ExecInterceptor, ExecType, Execution, ExecutionBuilder, ExecutionId, Operation, Promise,
    Throttle, Upstream,
};

pub use cache::{CachingUpstream, TimedFaultTolerantCache, Ttl};

pub use batch::{Batch, BatchPublisher, ParallelBatch, SerialBatch};

pub use stream::{ManagedSubscription, Publisher, PublisherExt, Subscriber, Subscription};

pub use service::{OnStart, RecurringAction, RecurringService, Service, ServiceState};

// Re-export dependencies used in public API
pub use tokio;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```ignore
/// use praxis::prelude::*;
/// ```
pub mod prelude {
    pub use crate::batch::{self, Batch};
    pub use crate::core::{ExecError, ExecResult, RetryPolicy, Retryable};
    pub use crate::executor::{Blocking, ExecController, Execution, Operation, Promise};
    pub use crate::service::{OnStart, RecurringAction, RecurringService, Service};
    pub use crate::stream::{Publisher, PublisherExt};

    pub use std::sync::Arc;
}
