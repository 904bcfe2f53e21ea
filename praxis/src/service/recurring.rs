use super::{Service, StartEvent, StopEvent};
use crate::core::ExecError;
use crate::executor::{ExecController, Execution};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The work a [`RecurringService`] repeats.
pub trait RecurringAction: Send + Sync + 'static {
    /// Runs as the first segment of a fresh execution. Promises subscribed
    /// here keep the run going until they settle; errors they raise count
    /// as a failed run.
    fn perform_action(&self) -> Result<(), ExecError>;

    /// How long to wait after a run before the next one.
    fn next_delay(&self) -> Duration;

    /// Called when a stop is requested, before any wait for the running
    /// action.
    fn on_stop_requested(&self) {}
}

/// What a [`RecurringService`] does when its host starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnStart {
    /// Run once before startup completes, failing startup if the run
    /// fails, then repeat on schedule.
    Inline,
    /// Run immediately without blocking startup, then repeat on schedule.
    Exec,
    /// Wait for the first delay before running.
    Next,
    /// Stay unscheduled until [`RecurringService::schedule_next`] or
    /// [`RecurringService::schedule_now`] is called.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Unscheduled = 0,
    Scheduled = 1,
    Running = 2,
    Stopped = 3,
}

impl ServiceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unscheduled,
            1 => Self::Scheduled,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unscheduled => "UNSCHEDULED",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Repeats a [`RecurringAction`], each run on its own execution.
///
/// ```text
/// UNSCHEDULED --schedule--> SCHEDULED --timer--> RUNNING --done--> UNSCHEDULED
///      any --stop--> STOPPED --restart--> UNSCHEDULED
/// ```
///
/// Every transition is a compare-and-swap on one atomic, so a timer that
/// fires after a stop finds `STOPPED` and does nothing. A failed run is
/// logged and the schedule continues.
pub struct RecurringService<A> {
    me: Weak<Self>,
    action: A,
    on_start: OnStart,
    controller: ExecController,
    state: AtomicU8,
    timer: Mutex<Option<CancellationToken>>,
    current: Mutex<Option<Execution>>,
}

impl<A: RecurringAction> RecurringService<A> {
    pub fn new(controller: ExecController, on_start: OnStart, action: A) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            action,
            on_start,
            controller,
            state: AtomicU8::new(ServiceState::Unscheduled as u8),
            timer: Mutex::new(None),
            current: Mutex::new(None),
        })
    }

    pub fn action(&self) -> &A {
        &self.action
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ServiceState::Stopped
    }

    fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Runs the action now.
    ///
    /// Fails with [`ExecError::IllegalState`] unless the service is
    /// `UNSCHEDULED`.
    pub fn schedule_now(&self) -> Result<(), ExecError> {
        if !self.transition(ServiceState::Unscheduled, ServiceState::Scheduled) {
            return Err(ExecError::IllegalState(format!(
                "expected unscheduled state but was {}",
                self.state()
            )));
        }
        self.exec();
        Ok(())
    }

    /// Arms the timer for the next run if the service is `UNSCHEDULED`.
    pub fn schedule_next(&self) {
        if !self.transition(ServiceState::Unscheduled, ServiceState::Scheduled) {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let delay = self.action.next_delay();
        let token = CancellationToken::new();
        *self.timer.lock() = Some(token.clone());

        let fire = token.clone();
        self.controller.handle().spawn(async move {
            tokio::select! {
                _ = fire.cancelled() => debug!("recurring timer cancelled"),
                _ = tokio::time::sleep(delay) => me.exec(),
            }
        });
        debug!(?delay, "recurring run scheduled");

        if self.is_stopped() {
            token.cancel();
        }
    }

    /// Moves to `STOPPED`, cancelling a pending timer. If an action is
    /// running, waits for it to finish, unless called from within that
    /// run's own execution.
    pub async fn stop(&self) {
        let previous = ServiceState::from_u8(
            self.state.swap(ServiceState::Stopped as u8, Ordering::AcqRel),
        );
        self.action.on_stop_requested();
        match previous {
            ServiceState::Scheduled => {
                let timer = self.timer.lock().take();
                if let Some(timer) = timer {
                    timer.cancel();
                }
            }
            ServiceState::Running => {
                let running = self.current.lock().clone();
                if let Some(running) = running {
                    let inside = Execution::current_opt().is_some_and(|e| e.id() == running.id());
                    if !inside {
                        running.completion().await;
                    }
                }
            }
            _ => {}
        }
        info!(service = std::any::type_name::<A>(), "recurring service stopped");
    }

    /// Moves from `STOPPED` back to `UNSCHEDULED`. Returns false in any
    /// other state. Nothing is scheduled until `schedule_next` or
    /// `schedule_now` is called.
    pub fn restart(&self) -> bool {
        self.transition(ServiceState::Stopped, ServiceState::Unscheduled)
    }

    fn exec(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let settled = me.clone();
        self.controller
            .fork()
            .on_error(|e| {
                error!(
                    service = std::any::type_name::<A>(),
                    error = %e,
                    "recurring action failed"
                )
            })
            .on_complete(move |_| {
                settled.current.lock().take();
                settled.transition(ServiceState::Running, ServiceState::Unscheduled);
                settled.schedule_next();
            })
            .start(move |exec| {
                *me.current.lock() = Some(exec.clone());
                if me.transition(ServiceState::Scheduled, ServiceState::Running) {
                    me.action.perform_action()
                } else {
                    Ok(())
                }
            });
    }

    async fn start_inline(&self) -> Result<(), ExecError> {
        let Some(me) = self.me.upgrade() else {
            return Err(ExecError::IllegalState("service dropped".to_string()));
        };
        self.state.store(ServiceState::Running as u8, Ordering::Release);

        let failure: Arc<Mutex<Option<ExecError>>> = Arc::default();
        let record = failure.clone();
        let run = self
            .controller
            .fork()
            .on_error(move |e| {
                let mut slot = record.lock();
                if slot.is_none() {
                    *slot = Some(e);
                }
            })
            .start(move |exec| {
                *me.current.lock() = Some(exec.clone());
                me.action.perform_action()
            });
        run.completion().await;
        self.current.lock().take();

        let failed = failure.lock().take();
        match failed {
            Some(e) => {
                self.state.store(ServiceState::Stopped as u8, Ordering::Release);
                Err(e)
            }
            None => {
                self.transition(ServiceState::Running, ServiceState::Unscheduled);
                self.schedule_next();
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<A: RecurringAction> Service for RecurringService<A> {
    async fn on_start(&self, _event: &StartEvent) -> Result<(), ExecError> {
        info!(
            service = std::any::type_name::<A>(),
            on_start = ?self.on_start,
            "starting recurring service"
        );
        match self.on_start {
            OnStart::Inline => self.start_inline().await,
            OnStart::Exec => self.schedule_now(),
            OnStart::Next => {
                self.schedule_next();
                Ok(())
            }
            OnStart::None => Ok(()),
        }
    }

    async fn on_stop(&self, _event: &StopEvent) -> Result<(), ExecError> {
        self.stop().await;
        Ok(())
    }
}

impl<A> fmt::Debug for RecurringService<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurringService")
            .field("on_start", &self.on_start)
            .field("state", &ServiceState::from_u8(self.state.load(Ordering::Acquire)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Promise;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Counting {
        runs: AtomicUsize,
        fail: bool,
        every: Duration,
    }

    impl Counting {
        fn new(fail: bool) -> Self {
            Self {
                runs: AtomicUsize::new(0),
                fail,
                every: Duration::from_millis(100),
            }
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl RecurringAction for Counting {
        fn perform_action(&self) -> Result<(), ExecError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ExecError::msg("boom"))
            } else {
                Ok(())
            }
        }

        fn next_delay(&self) -> Duration {
            self.every
        }
    }

    fn service(on_start: OnStart, fail: bool) -> Arc<RecurringService<Counting>> {
        let controller = ExecController::current().unwrap();
        RecurringService::new(controller, on_start, Counting::new(fail))
    }

    #[tokio::test(start_paused = true)]
    async fn test_inline_failure_propagates_and_stops() {
        let service = service(OnStart::Inline, true);
        let result = service.on_start(&StartEvent::default()).await;
        assert!(matches!(result, Err(ExecError::Message(ref m)) if m == "boom"));
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(service.action().runs(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(service.action().runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inline_success_schedules_next_run() {
        let service = service(OnStart::Inline, false);
        service.on_start(&StartEvent::default()).await.unwrap();
        assert_eq!(service.action().runs(), 1);
        assert_eq!(service.state(), ServiceState::Scheduled);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(service.action().runs(), 2);
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_scheduled_run_keeps_schedule() {
        let service = service(OnStart::Exec, true);
        service.on_start(&StartEvent::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(service.action().runs() >= 3);
        assert!(!service.is_stopped());
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_waits_for_first_delay() {
        let service = service(OnStart::Next, false);
        service.on_start(&StartEvent::default()).await.unwrap();
        assert_eq!(service.state(), ServiceState::Scheduled);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.action().runs(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(service.action().runs(), 1);
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_none_does_not_schedule() {
        let service = service(OnStart::None, false);
        service.on_start(&StartEvent::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(service.state(), ServiceState::Unscheduled);
        assert_eq!(service.action().runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_timer() {
        let service = service(OnStart::Next, false);
        service.on_start(&StartEvent::default()).await.unwrap();
        service.on_stop(&StopEvent::default()).await.unwrap();
        assert!(service.is_stopped());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(service.action().runs(), 0);
        assert!(service.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_now_requires_unscheduled() {
        let service = service(OnStart::Next, false);
        service.on_start(&StartEvent::default()).await.unwrap();
        let err = service.schedule_now().unwrap_err();
        assert!(matches!(err, ExecError::IllegalState(ref m) if m.contains("SCHEDULED")));
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_only_from_stopped() {
        let service = service(OnStart::None, false);
        assert!(!service.restart());
        service.stop().await;
        assert!(service.restart());
        assert_eq!(service.state(), ServiceState::Unscheduled);

        service.schedule_now().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.action().runs(), 1);
        service.stop().await;
    }

    struct Slow {
        finished: Arc<AtomicBool>,
    }

    impl RecurringAction for Slow {
        fn perform_action(&self) -> Result<(), ExecError> {
            let finished = self.finished.clone();
            Promise::value(())
                .defer(Duration::from_millis(50))
                .then(move |()| finished.store(true, Ordering::SeqCst));
            Ok(())
        }

        fn next_delay(&self) -> Duration {
            Duration::from_secs(60)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_running_action() {
        let finished = Arc::new(AtomicBool::new(false));
        let controller = ExecController::current().unwrap();
        let service = RecurringService::new(
            controller,
            OnStart::Exec,
            Slow {
                finished: finished.clone(),
            },
        );
        service.on_start(&StartEvent::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.state(), ServiceState::Running);

        service.stop().await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(service.is_stopped());
    }
}
