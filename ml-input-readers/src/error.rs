//! Error types for file-backed readers

use thiserror::Error;

use ml_input_core::error::Error as CoreError;

/// Error type for file-backed readers
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupt or truncated file contents
    #[error("Format error: {0}")]
    Format(String),

    /// Unknown or failing compression codec
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for file-backed readers
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for CoreError {
    fn from(err: Error) -> Self {
        match err {
            Error::Core(e) => e,
            Error::Io(e) => CoreError::Io(e),
            Error::Format(msg) => CoreError::DataLoss(msg),
            Error::Compression(msg) => CoreError::DataLoss(msg),
            Error::InvalidArgument(msg) => CoreError::InvalidArgument(msg),
        }
    }
}
