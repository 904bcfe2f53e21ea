//! Execution engine module.
//!
//! This module provides the bound-execution model:
//! - [`ExecController`]: owns or adopts the runtime and starts executions
//! - [`Execution`]: single-writer segment queue with a task-local current
//! - [`Promise`] / [`Operation`]: composable deferred values
//! - [`Downstream`]: the exactly-once producer contract
//! - [`Blocking`]: bridge from the blocking pool back into an execution
//! - [`ExecInterceptor`]: hook wrapped around every segment and blocking call
//! - [`Throttle`]: bound on concurrently subscribed promises
//!
//! Following Parnas's information hiding principle, this module hides how
//! segments are queued, how foreign-thread signals are handed back to their
//! execution, and which threads the work runs on.

mod blocking;
mod controller;
mod downstream;
mod execution;
mod interceptor;
mod operation;
mod promise;
mod throttle;

pub use blocking::Blocking;
pub use controller::{ExecConfig, ExecController, ExecControllerBuilder};
pub use downstream::Downstream;
pub use execution::{Execution, ExecutionBuilder, ExecutionId};
pub use interceptor::{Continuation, ExecInterceptor, ExecType};
pub use operation::Operation;
pub use promise::{Promise, Upstream};
pub use throttle::Throttle;

pub(crate) use promise::connect;
