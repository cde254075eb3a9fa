//! Cached read results and their persisted form.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached value with absolute expiry, in epoch milliseconds.
///
/// `expires_at >= stored_at` always holds; reading at or past `expires_at` is a miss.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub stored_at: i64,
    pub expires_at: i64,
}

impl<T> CacheEntry<T> {
    pub fn new(key: impl Into<String>, value: T, stored_at: i64, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            key: key.into(),
            value,
            stored_at,
            expires_at: stored_at.saturating_add(ttl_ms),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn into_record(self) -> CacheRecord<T> {
        CacheRecord {
            data: self.value,
            timestamp: self.stored_at,
            expires_at: self.expires_at,
        }
    }

    pub fn from_record(key: impl Into<String>, record: CacheRecord<T>) -> Self {
        Self {
            key: key.into(),
            value: record.data,
            stored_at: record.timestamp,
            expires_at: record.expires_at,
        }
    }
}

/// On-disk shape of a cache entry: `{data, timestamp, expiresAt}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord<T> {
    pub data: T,
    pub timestamp: i64,
    pub expires_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_expiry_boundary_is_a_miss() {
        let entry = CacheEntry::new("herd", 3u32, 1_000, Duration::from_millis(500));
        assert!(!entry.is_expired(1_499));
        assert!(entry.is_expired(1_500));
    }

    #[test]
    fn test_record_uses_persisted_field_names() {
        let record = CacheEntry::new("herd", "x", 10, Duration::from_millis(5)).into_record();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["timestamp"], 10);
        assert_eq!(value["expiresAt"], 15);
    }

    proptest! {
        #[test]
        fn prop_expiry_never_precedes_storage(stored in any::<i64>(), ttl_ms in any::<u64>()) {
            let entry = CacheEntry::new("k", (), stored, Duration::from_millis(ttl_ms));
            prop_assert!(entry.expires_at >= entry.stored_at);
        }
    }
}
