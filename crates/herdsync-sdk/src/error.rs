//! Error types for the herdsync SDK.

use herdsync_cache::CacheError;
use herdsync_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Error type for SDK operations.
///
/// Only user-initiated actions return these; background work logs its
/// failures and carries on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SdkError {
    /// Local storage rejected a write.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Cache fetch or decode failed.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// The remote API answered with an error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// A remote call did not answer in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// No signed-in user, or the session was rejected.
    #[error("Authentication required")]
    Unauthenticated,

    /// The device is offline.
    #[error("Device is offline")]
    Offline,

    /// Offline with nothing cached for the requested key.
    #[error("Offline and nothing cached")]
    EmptyCache,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;
