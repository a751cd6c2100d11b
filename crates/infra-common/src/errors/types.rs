use std::io;
use thiserror::Error;

/// Result type alias using the common [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// Startup and configuration errors shared by the broker binaries
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("{0}")]
    Contextual(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an error for a collaborator (media server, listener) that could not be reached
    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalService(message.into())
    }
}
