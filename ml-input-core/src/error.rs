//! Error types for ML input pipelines
//!
//! End of stream is not an error: every pull returns `Result<Option<Record>>`
//! and `Ok(None)` signals that the stage has no further records.

use std::io;
use thiserror::Error;

/// Result type for ML input pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ML input pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Misconfiguration detected at construction or initialization time,
    /// or a record whose structure cannot be processed by a stage
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A record violated a declared fixed size and processing it would
    /// silently drop elements
    #[error("Data loss: {0}")]
    DataLoss(String),

    /// An operation was attempted in a state that does not permit it,
    /// such as pulling from an uninitialized iterator
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// A user supplied per-record computation failed
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// Feature not implemented
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Internal invariant violated (poisoned lock, panicked worker)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Shorthand for [`Error::DataLoss`]
    pub fn data_loss(msg: impl Into<String>) -> Self {
        Error::DataLoss(msg.into())
    }

    /// Shorthand for [`Error::FailedPrecondition`]
    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Error::FailedPrecondition(msg.into())
    }

    /// Shorthand for [`Error::Evaluation`]
    pub fn evaluation(msg: impl Into<String>) -> Self {
        Error::Evaluation(msg.into())
    }

    /// Shorthand for [`Error::Internal`]
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether this error is an invalid argument error
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    /// Whether this error is a data loss error
    pub fn is_data_loss(&self) -> bool {
        matches!(self, Error::DataLoss(_))
    }

    /// Whether this error is a failed precondition error
    pub fn is_failed_precondition(&self) -> bool {
        matches!(self, Error::FailedPrecondition(_))
    }
}
