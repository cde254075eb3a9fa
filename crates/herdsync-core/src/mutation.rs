//! Queued mutations: create/update/delete intents awaiting remote confirmation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Unique, time-sortable identifier of a queued mutation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(pub String);

impl MutationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh ULID-backed id.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MutationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP verb used to deliver a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote endpoint and verb a mutation is delivered to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub endpoint: String,
    pub method: HttpMethod,
}

impl Target {
    pub fn new(endpoint: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
        }
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, HttpMethod::Post)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, HttpMethod::Put)
    }

    pub fn patch(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, HttpMethod::Patch)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, HttpMethod::Delete)
    }
}

/// Lifecycle status of a queued mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStatus {
    /// Waiting for the next drain.
    Pending,
    /// Currently being dispatched.
    InFlight,
    /// Terminal until resolved by hand.
    Failed,
}

/// A mutation as submitted by the caller, before it is queued.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMutation {
    pub kind: String,
    pub target: Target,
    pub payload: Value,
}

impl NewMutation {
    pub fn new(kind: impl Into<String>, target: Target, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            target,
            payload,
        }
    }
}

/// A mutation held in the durable queue.
///
/// Fields are only changed through the transition methods below so that every
/// state change the sync engine makes is named.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    pub id: MutationId,
    pub kind: String,
    pub payload: Value,
    pub target: Target,
    pub created_at: DateTime<Utc>,
    pub status: MutationStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedMutation {
    /// Build a pending entry from a caller submission.
    pub fn from_new(new: NewMutation, created_at: DateTime<Utc>) -> Self {
        Self {
            id: MutationId::generate(),
            kind: new.kind,
            payload: new.payload,
            target: new.target,
            created_at,
            status: MutationStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Pending and past any scheduled backoff.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MutationStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Counts toward the pending total shown to the user.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self.status,
            MutationStatus::Pending | MutationStatus::InFlight
        )
    }

    pub fn mark_in_flight(&mut self) {
        self.status = MutationStatus::InFlight;
    }

    /// Undo `mark_in_flight` without touching any other field.
    pub fn revert_to_pending(&mut self) {
        self.status = MutationStatus::Pending;
    }

    /// Record a retryable failure and schedule the next attempt.
    pub fn record_transient_failure(&mut self, error: impl Into<String>, next: DateTime<Utc>) {
        self.status = MutationStatus::Pending;
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.next_attempt_at = Some(next);
    }

    /// Park the entry until someone resolves it.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = MutationStatus::Failed;
        self.last_error = Some(error.into());
        self.next_attempt_at = None;
    }

    /// Make a failed entry eligible for the next drain again.
    pub fn reset_for_retry(&mut self) {
        self.status = MutationStatus::Pending;
        self.retry_count = 0;
        self.next_attempt_at = None;
    }
}
