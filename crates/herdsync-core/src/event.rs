//! Telemetry events carried by the observability queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// What kind of telemetry an event carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventCategory {
    Activity,
    HealthLog,
}

/// A best-effort telemetry event. Dropped after a bounded number of failed sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityEvent {
    pub id: String,
    pub category: EventCategory,
    pub payload: Value,
    pub retry_count: u32,
}

impl ObservabilityEvent {
    pub fn new(category: EventCategory, payload: Value) -> Self {
        Self {
            id: Ulid::new().to_string(),
            category,
            payload,
            retry_count: 0,
        }
    }

    pub fn activity(payload: Value) -> Self {
        Self::new(EventCategory::Activity, payload)
    }

    pub fn health_log(payload: Value) -> Self {
        Self::new(EventCategory::HealthLog, payload)
    }

    /// Count one failed send. Returns true once `max_retries` is reached.
    pub fn record_failure(&mut self, max_retries: u32) -> bool {
        self.retry_count += 1;
        self.retry_count >= max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_category_wire_names() {
        let event = ObservabilityEvent::health_log(json!({ "animal": 7 }));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["category"], "health-log");
        assert_eq!(value["retryCount"], 0);
    }

    #[test]
    fn test_record_failure_exhausts_at_max() {
        let mut event = ObservabilityEvent::activity(json!({}));
        assert!(!event.record_failure(3));
        assert!(!event.record_failure(3));
        assert!(event.record_failure(3));
        assert_eq!(event.retry_count, 3);
    }
}
