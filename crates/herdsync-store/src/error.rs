//! Error types for the storage layer.

use thiserror::Error;

/// Errors that can occur while reading or writing local storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("I/O error on {key}: {message}")]
    Io { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn io(key: impl Into<String>, err: std::io::Error) -> Self {
        StoreError::Io {
            key: key.into(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
