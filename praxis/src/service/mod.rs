//! Lifecycle hooks for long-lived components.
//!
//! A [`Service`] is started and stopped by whatever hosts it. The one
//! service shipped here is [`RecurringService`], which repeats an action on
//! a schedule of its choosing.

mod recurring;

pub use recurring::{OnStart, RecurringAction, RecurringService, ServiceState};

use crate::core::ExecError;
use async_trait::async_trait;

/// Passed to [`Service::on_start`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartEvent {
    /// True when the host is restarting after a configuration reload.
    pub reload: bool,
}

/// Passed to [`Service::on_stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopEvent {
    pub reload: bool,
}

/// A component with a start/stop lifecycle.
///
/// An error from `on_start` aborts startup of the host.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn on_start(&self, _event: &StartEvent) -> Result<(), ExecError> {
        Ok(())
    }

    async fn on_stop(&self, _event: &StopEvent) -> Result<(), ExecError> {
        Ok(())
    }
}
