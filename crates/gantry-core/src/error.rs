//! Error taxonomy for Gantry.

use gantry_driver::DriverError;

/// Errors raised by the context-scoped resource layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A driver call returned a non-success status.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Operation on a freed, destroyed or misconfigured resource.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Size or bounds mismatch between buffers, or an out-of-range argument.
    #[error("input constraint violated: {0}")]
    InputConstraint(String),

    /// The external device-code compiler failed.
    #[error("compilation failed:\n{diagnostics}")]
    CompileFailure { diagnostics: String },

    #[error("no CUDA device found")]
    NoDeviceFound,

    #[error("no context is current on this thread")]
    NoCurrentContext,

    /// The native driver library could not be loaded.
    #[error("CUDA driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn freed(kind: &str) -> Self {
        Error::InvalidState(format!("{kind} already freed"))
    }

    /// The driver status name, when this is a driver error.
    pub fn driver_status(&self) -> Option<&str> {
        match self {
            Error::Driver(e) => Some(&e.name),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_driver::status::CUDA_ERROR_LAUNCH_FAILED;

    #[test]
    fn test_driver_error_converts() {
        let err: Error = DriverError::new(CUDA_ERROR_LAUNCH_FAILED, "cuLaunchKernel").into();
        assert_eq!(err.driver_status(), Some("CUDA_ERROR_LAUNCH_FAILED"));
        assert!(err.to_string().contains("cuLaunchKernel"));
    }

    #[test]
    fn test_freed_message() {
        let err = Error::freed("stream");
        assert_eq!(err.to_string(), "invalid state: stream already freed");
        assert_eq!(err.driver_status(), None);
    }
}
