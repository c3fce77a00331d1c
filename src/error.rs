//! Custom error types for the acquisition engine.
//!
//! Errors follow the taxonomy the acquisition loop reacts to:
//!
//! - **`Configuration`**: fatal, raised before polling starts (unknown experiment,
//!   invalid bit width, invalid settings). Never retried.
//! - **`Transport`**: transient byte-read failures. The loop tolerates them up to a
//!   consecutive-failure threshold and then ends the run early.
//! - **`Storage`**: transient gateway failures. Retried with backoff, then the record
//!   is parked in the fallback buffer; polling is never blocked by them.
//! - **`FileSystem`**: export failures. Transient for incremental snapshots, fatal for
//!   the end-of-run export once its retry budget is spent.
//!
//! Component errors (`DecodeError`, `TransportError`, `StorageError`, `ExportError`)
//! convert into `DaqError` through `#[from]` so `?` works across module boundaries.

use thiserror::Error;

pub use crate::decoder::DecodeError;
pub use crate::export::ExportError;
pub use crate::storage::StorageError;
pub use crate::transport::TransportError;

/// Convenience alias for results using the application error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Top-level error type of the crate.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("File system error: {0}")]
    FileSystem(#[from] ExportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Whether the acquisition loop may keep running after this error.
    ///
    /// Configuration problems abort a run before it starts; everything else is
    /// handled by retry budgets and graceful degradation.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DaqError::Config(_) | DaqError::Configuration(_) | DaqError::Decode(_) => false,
            DaqError::Storage(StorageError::NotFound(_)) => false,
            DaqError::Transport(_)
            | DaqError::Storage(_)
            | DaqError::FileSystem(_)
            | DaqError::Io(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_fatal() {
        let err = DaqError::Configuration("poll interval must be positive".into());
        assert!(!err.is_recoverable());

        let err: DaqError = DecodeError::WidthOutOfRange(9).into();
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("9"));
    }

    #[test]
    fn unknown_experiment_is_fatal() {
        let err: DaqError = StorageError::NotFound("press_line".into()).into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn io_faults_are_recoverable() {
        let err: DaqError = TransportError::Timeout(500).into();
        assert!(err.is_recoverable());

        let err: DaqError = StorageError::Timeout(250).into();
        assert!(err.is_recoverable());
    }
}
