//! Keys under which state is persisted in local key-value storage.

/// Ordered array of queued mutations.
pub const OFFLINE_QUEUE: &str = "offline_queue";

/// Array of pending observability events.
pub const OBSERVABILITY_QUEUE: &str = "observability_queue";

/// Last-known onboarding step and form data.
pub const ONBOARDING_CACHE: &str = "onboarding_cache";

/// Marker for an onboarding completion not yet confirmed remotely.
pub const ONBOARDING_PENDING_COMPLETION: &str = "onboarding_pending_completion";

/// Prefix of every cache entry key.
pub const CACHE_PREFIX: &str = "cache:";

/// Storage key of the cache entry for `key`.
pub fn cache_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
}
