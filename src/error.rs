//! Error types for QuickDesk.

use std::fmt;
use thiserror::Error;

/// A rejected input, naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        ValidationError {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid {0}")]
    Validation(ValidationError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// The remote refused the write and will keep refusing it.
    #[error("Remote store rejected write: {0}")]
    Rejected(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn not_found(entity: &'static str, id: &str) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether sending the same write again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_) | Error::Storage(_))
    }

    /// The field a validation failure refers to, if this is one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Error::Validation(v) => Some(v.field),
            _ => None,
        }
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => Error::Rejected(err.to_string()),
            _ => Error::RemoteUnavailable(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
