use super::error::ExecError;

/// The settled outcome of one promise subscription.
///
/// `Complete` is distinct from `Error`: it short-circuits a chain without a
/// value, for example after an `on_error` handler consumed a failure.
#[derive(Debug, Clone)]
pub enum ExecResult<T> {
    Success(T),
    Error(ExecError),
    Complete,
}

impl<T> ExecResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecResult::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ExecResult::Error(_))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ExecResult::Complete)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            ExecResult::Success(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ExecError> {
        match self {
            ExecResult::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            ExecResult::Success(v) => Some(v),
            _ => None,
        }
    }

    /// Converts into a standard `Result`; `Complete` maps to `Ok(None)`.
    pub fn into_result(self) -> Result<Option<T>, ExecError> {
        match self {
            ExecResult::Success(v) => Ok(Some(v)),
            ExecResult::Error(e) => Err(e),
            ExecResult::Complete => Ok(None),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExecResult<U> {
        match self {
            ExecResult::Success(v) => ExecResult::Success(f(v)),
            ExecResult::Error(e) => ExecResult::Error(e),
            ExecResult::Complete => ExecResult::Complete,
        }
    }
}

impl<T> From<Result<T, ExecError>> for ExecResult<T> {
    fn from(result: Result<T, ExecError>) -> Self {
        match result {
            Ok(v) => ExecResult::Success(v),
            Err(e) => ExecResult::Error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_result_maps_complete_to_none() {
        let r: ExecResult<u8> = ExecResult::Complete;
        assert!(matches!(r.into_result(), Ok(None)));

        let r = ExecResult::Success(3u8);
        assert!(matches!(r.into_result(), Ok(Some(3))));

        let r: ExecResult<u8> = ExecResult::Error(ExecError::msg("x"));
        assert!(r.into_result().is_err());
    }

    #[test]
    fn test_map_preserves_non_success() {
        let r: ExecResult<u8> = ExecResult::Error(ExecError::msg("x"));
        assert!(r.map(|v| v + 1).is_error());
        assert_eq!(ExecResult::Success(1u8).map(|v| v + 1).into_value(), Some(2));
    }
}
