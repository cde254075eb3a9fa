//! Error types for the cache layer.

use thiserror::Error;

/// Errors returned by [`crate::CacheStore::get_or_fetch`].
///
/// Storage failures never appear here: they degrade to a cache miss.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
