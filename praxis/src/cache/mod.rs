//! Single-flight caching of promise results.
//!
//! - [`CachingUpstream`]: one physical computation per request window,
//!   replayed to every subscriber that queued during it
//! - [`TimedFaultTolerantCache`]: time-boxed cache that keeps serving the
//!   previous value while one background refresh runs
//!
//! Following Parnas's information hiding principle, this module hides the
//! lock-free bookkeeping (queue, flags, swap cells) behind plain promises.

mod caching_upstream;
mod fault_tolerant;

pub use caching_upstream::CachingUpstream;
pub use fault_tolerant::TimedFaultTolerantCache;

use std::time::Duration;

/// How long a settled result stays servable from a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Served until the cache is dropped.
    Eternal,
    /// Shared with the subscribers of its own flight only.
    Expired,
    /// Served for the given duration after it settled.
    For(Duration),
}
