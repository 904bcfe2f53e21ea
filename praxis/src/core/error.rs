use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error accepted from user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type carried on the error channel of promises, operations and streams.
///
/// Errors are data: once a promise is subscribed, every failure travels as an
/// `ExecError` value to the next transform rather than unwinding the stack.
/// The type is `Clone` because caches and batches replay one failure to many
/// subscribers.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ExecError {
    /// A user producer, transform or upstream failed.
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),

    /// A plain failure message.
    #[error("{0}")]
    Message(String),

    /// A panic was captured at a segment or callback boundary.
    #[error("panicked: {0}")]
    Panicked(String),

    /// A reactive-streams rule was violated by a subscriber.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A promise did not produce a signal within the allotted time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A downstream was dropped without receiving a signal.
    #[error("downstream dropped without a signal")]
    Abandoned,

    /// An execution-bound operation was used off any execution.
    #[error("not running on an execution")]
    Unmanaged,

    /// A lifecycle operation was invoked in a state that does not allow it.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

pub type Result<T> = std::result::Result<T, ExecError>;

impl ExecError {
    /// Converts any boxable error into an `ExecError`.
    ///
    /// An `ExecError` that was boxed on the way in is recovered as-is rather
    /// than being wrapped a second time.
    pub fn failed<E: Into<BoxError>>(error: E) -> Self {
        let boxed: BoxError = error.into();
        match boxed.downcast::<ExecError>() {
            Ok(exec) => *exec,
            Err(other) => ExecError::Failed(Arc::from(other)),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        ExecError::Message(message.into())
    }

    /// Builds a `Panicked` error from a payload returned by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        ExecError::Panicked(panic_message(payload.as_ref()))
    }

    /// Returns the wrapped user error, if this is a `Failed` error.
    pub fn source_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            ExecError::Failed(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }

    /// Returns true if the wrapped user error is of type `E`.
    pub fn is<E: std::error::Error + 'static>(&self) -> bool {
        self.source_error().is_some_and(|e| e.is::<E>())
    }
}

impl From<String> for ExecError {
    fn from(s: String) -> Self {
        ExecError::Message(s)
    }
}

impl From<&str> for ExecError {
    fn from(s: &str) -> Self {
        ExecError::Message(s.to_string())
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// =============================================================================
// RETRYABLE ERROR TRAIT
// =============================================================================

/// Decides whether a failed promise should be re-subscribed by
/// [`Promise::retry`](crate::Promise::retry).
///
/// # Example
///
/// ```
/// use praxis::Retryable;
///
/// #[derive(Debug)]
/// enum FetchError {
///     ConnectionReset,
///     NotFound,
/// }
///
/// impl Retryable for FetchError {
///     fn is_retryable(&self) -> bool {
///         matches!(self, FetchError::ConnectionReset)
///     }
/// }
///
/// assert!(FetchError::ConnectionReset.is_retryable());
/// assert!(!FetchError::NotFound.is_retryable());
/// ```
pub trait Retryable {
    /// Returns true if this error is transient and the work should be retried.
    fn is_retryable(&self) -> bool;
}

impl Retryable for ExecError {
    /// Panics, protocol violations and lifecycle misuse are permanent.
    /// Everything else, including opaque user errors, is assumed transient.
    fn is_retryable(&self) -> bool {
        match self {
            ExecError::Failed(inner) => inner
                .downcast_ref::<std::io::Error>()
                .map_or(true, |io| io.is_retryable()),
            ExecError::Message(_) | ExecError::Timeout(_) | ExecError::Abandoned => true,
            ExecError::Panicked(_)
            | ExecError::Protocol(_)
            | ExecError::Unmanaged
            | ExecError::IllegalState(_) => false,
        }
    }
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_failed_unwraps_boxed_exec_error() {
        let original = ExecError::Timeout(Duration::from_millis(5));
        let boxed: BoxError = Box::new(original);
        match ExecError::failed(boxed) {
            ExecError::Timeout(d) => assert_eq!(d, Duration::from_millis(5)),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_wraps_foreign_error() {
        let err = ExecError::failed(io::Error::new(io::ErrorKind::NotFound, "missing"));
        assert!(err.is::<io::Error>());
        assert_eq!(err.to_string(), "missing");
    }

    #[test]
    fn test_failed_from_str() {
        let err = ExecError::failed("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(
            ExecError::from_panic(payload).to_string(),
            "panicked: static message"
        );

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(ExecError::from_panic(payload).to_string(), "panicked: owned");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(
            ExecError::from_panic(payload).to_string(),
            "panicked: opaque panic payload"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ExecError::msg("transient").is_retryable());
        assert!(ExecError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ExecError::Panicked("bug".into()).is_retryable());
        assert!(!ExecError::Protocol("3.9".into()).is_retryable());

        let reset = ExecError::failed(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_retryable());
        let denied =
            ExecError::failed(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_error_is_clone_and_shares_source() {
        let err = ExecError::failed(io::Error::new(io::ErrorKind::Other, "shared"));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert!(copy.is::<io::Error>());
    }
}
