//! Seams to the remote backend and the device.
//!
//! Everything the engine talks to outside the process goes through one of
//! these traits, so a real HTTP client, an auth SDK or a platform
//! connectivity API can be plugged in without touching the engine.

use async_trait::async_trait;
use herdsync_core::{HttpMethod, ObservabilityEvent, QueuedMutation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code the backend uses for a missing or rejected session.
pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";

/// How a failed dispatch should be treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// May succeed later (network, 5xx, throttling, expired session).
    Transient,
    /// Will fail the same way every time (validation, not found, forbidden).
    Permanent,
}

/// Error reported by a remote collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    /// HTTP status, if the request reached the server.
    pub status: Option<u16>,
    /// Machine-readable error code.
    pub code: Option<String>,
    pub message: String,
}

impl RemoteError {
    /// The request never got an answer.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: message.into(),
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            status: Some(401),
            code: Some(UNAUTHENTICATED.to_string()),
            message: "session missing or expired".to_string(),
        }
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.code.as_deref() == Some(UNAUTHENTICATED) || self.status == Some(401)
    }

    /// 4xx responses other than 401, 408 and 429 are permanent.
    pub fn class(&self) -> FailureClass {
        match self.status {
            Some(401) | Some(408) | Some(429) => FailureClass::Transient,
            Some(status) if (400..500).contains(&status) => FailureClass::Permanent,
            _ => FailureClass::Transient,
        }
    }
}

/// A mutation as sent over the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub endpoint: String,
    pub method: HttpMethod,
    pub body: Value,
    /// The mutation id, so the backend can drop a replayed delivery.
    pub idempotency_key: Option<String>,
}

impl From<&QueuedMutation> for RemoteRequest {
    fn from(mutation: &QueuedMutation) -> Self {
        Self {
            endpoint: mutation.target.endpoint.clone(),
            method: mutation.target.method,
            body: mutation.payload.clone(),
            idempotency_key: Some(mutation.id.to_string()),
        }
    }
}

/// `{data, error}` envelope returned by the request endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub data: Option<Value>,
    pub error: Option<RemoteError>,
}

impl RemoteResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: RemoteError) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Option<Value>, RemoteError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

/// A signed-in user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }
}

/// Onboarding flags read from the remote profile.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub has_completed_onboarding: bool,
    pub onboarding_step: Option<String>,
}

impl Profile {
    pub fn completed() -> Self {
        Self {
            has_completed_onboarding: true,
            onboarding_step: None,
        }
    }

    pub fn incomplete(step: impl Into<String>) -> Self {
        Self {
            has_completed_onboarding: false,
            onboarding_step: Some(step.into()),
        }
    }
}

/// The mutation request endpoint.
#[async_trait]
pub trait RemoteApi: Send + Sync + 'static {
    async fn request(&self, request: RemoteRequest) -> RemoteResponse;
}

/// The profile-read endpoint.
#[async_trait]
pub trait ProfileSource: Send + Sync + 'static {
    async fn fetch_profile(&self, user: &User) -> Result<Profile, RemoteError>;
}

/// The authentication provider.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// The current user, or `None` when signed out.
    async fn current_user(&self) -> Result<Option<User>, RemoteError>;
}

/// Device connectivity.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + 'static {
    async fn is_online(&self) -> bool;
}

/// Destination for observability events.
#[async_trait]
pub trait TelemetrySink: Send + Sync + 'static {
    async fn send(&self, event: &ObservabilityEvent) -> Result<(), RemoteError>;
}

/// Everything the [`crate::Client`] needs from the outside world.
pub trait Backend:
    RemoteApi + ProfileSource + AuthProvider + ConnectivityProbe + TelemetrySink
{
}

impl<T> Backend for T where
    T: RemoteApi + ProfileSource + AuthProvider + ConnectivityProbe + TelemetrySink
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(RemoteError::http(422, "bad weight").class(), FailureClass::Permanent);
        assert_eq!(RemoteError::http(404, "no such animal").class(), FailureClass::Permanent);
        assert_eq!(RemoteError::http(429, "slow down").class(), FailureClass::Transient);
        assert_eq!(RemoteError::http(408, "timeout").class(), FailureClass::Transient);
        assert_eq!(RemoteError::http(503, "down").class(), FailureClass::Transient);
        assert_eq!(RemoteError::unauthenticated().class(), FailureClass::Transient);
        assert_eq!(RemoteError::network("dns").class(), FailureClass::Transient);
    }

    #[test]
    fn test_unauthenticated_detection() {
        assert!(RemoteError::unauthenticated().is_unauthenticated());
        let coded = RemoteError {
            status: None,
            code: Some(UNAUTHENTICATED.to_string()),
            message: "no session".to_string(),
        };
        assert!(coded.is_unauthenticated());
        assert!(!RemoteError::http(500, "boom").is_unauthenticated());
    }

    #[test]
    fn test_response_envelope() {
        let ok = RemoteResponse::ok(serde_json::json!({ "id": 1 }));
        assert!(ok.into_result().is_ok());

        let err = RemoteResponse::err(RemoteError::http(500, "boom"));
        assert_eq!(err.into_result().unwrap_err().status, Some(500));
    }
}
