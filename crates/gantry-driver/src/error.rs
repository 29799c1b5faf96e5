//! Driver error types and status-code checking helpers.

use crate::status::{self, CuResult, CUDA_ERROR_NOT_READY, CUDA_SUCCESS};

/// Result type for raw driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// A non-success status returned by a driver entry point.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{call} failed: {name} ({code})")]
pub struct DriverError {
    /// Raw `CUresult` value.
    pub code: CuResult,
    /// Symbolic name of the status, e.g. `CUDA_ERROR_OUT_OF_MEMORY`.
    pub name: String,
    /// Driver entry point that reported the status.
    pub call: &'static str,
}

impl DriverError {
    /// Build an error named from the static status table.
    pub fn new(code: CuResult, call: &'static str) -> Self {
        Self {
            code,
            name: status::name(code).to_string(),
            call,
        }
    }

    /// Build an error with a name supplied by the driver itself.
    pub fn named(code: CuResult, name: impl Into<String>, call: &'static str) -> Self {
        Self {
            code,
            name: name.into(),
            call,
        }
    }
}

/// Failure to load the native driver library or one of its symbols.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no CUDA driver library found (tried: {tried})")]
    NotFound { tried: String },

    #[error("failed to open driver library {path}: {message}")]
    Open { path: String, message: String },

    #[error("driver library is missing symbol {symbol}")]
    MissingSymbol { symbol: String },
}

/// Check a driver return code.
pub fn check(code: CuResult, call: &'static str) -> DriverResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::new(code, call))
    }
}

/// Check the result of a non-blocking query (`cuStreamQuery`, `cuEventQuery`).
///
/// `Ok(true)` when the work is complete, `Ok(false)` while it is still pending.
pub fn check_query(code: CuResult, call: &'static str) -> DriverResult<bool> {
    match code {
        CUDA_SUCCESS => Ok(true),
        CUDA_ERROR_NOT_READY => Ok(false),
        _ => Err(DriverError::new(code, call)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::CUDA_ERROR_INVALID_CONTEXT;

    #[test]
    fn test_check_success() {
        assert!(check(CUDA_SUCCESS, "cuInit").is_ok());
    }

    #[test]
    fn test_check_failure_carries_name() {
        let err = check(CUDA_ERROR_INVALID_CONTEXT, "cuMemAlloc").unwrap_err();
        assert_eq!(err.code, CUDA_ERROR_INVALID_CONTEXT);
        assert_eq!(err.name, "CUDA_ERROR_INVALID_CONTEXT");
        assert_eq!(err.call, "cuMemAlloc");
        assert_eq!(
            err.to_string(),
            "cuMemAlloc failed: CUDA_ERROR_INVALID_CONTEXT (201)"
        );
    }

    #[test]
    fn test_check_query_tristate() {
        assert_eq!(check_query(CUDA_SUCCESS, "cuStreamQuery"), Ok(true));
        assert_eq!(check_query(CUDA_ERROR_NOT_READY, "cuStreamQuery"), Ok(false));
        assert!(check_query(CUDA_ERROR_INVALID_CONTEXT, "cuStreamQuery").is_err());
    }
}
