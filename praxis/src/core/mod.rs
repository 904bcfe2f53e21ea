//! Foundation types shared by every other module.
//!
//! Following Parnas's information hiding principle, this module hides how
//! failures are represented and classified:
//! - [`ExecError`]: the single error channel type
//! - [`ExecResult`]: success / error / complete outcome of a subscription
//! - [`RetryPolicy`] and [`Retryable`]: when and how often to re-subscribe

mod error;
mod result;
mod retry;

pub use error::{BoxError, ExecError, Result, Retryable};
pub(crate) use error::panic_message;
pub use result::ExecResult;
pub use retry::RetryPolicy;
