//! In-memory backend for testing and simulation.

use crate::remote::{
    AuthProvider, ConnectivityProbe, Profile, ProfileSource, RemoteApi, RemoteError,
    RemoteRequest, RemoteResponse, TelemetrySink, User,
};
use async_trait::async_trait;
use herdsync_core::ObservabilityEvent;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Scriptable stand-in for the remote API, auth provider, profile endpoint,
/// telemetry collector and device connectivity.
///
/// Requests made while offline fail with a network error, as they would on
/// a device.
pub struct MemoryBackend {
    online: AtomicBool,
    requests: Mutex<Vec<RemoteRequest>>,
    request_failures: Mutex<VecDeque<RemoteError>>,
    endpoint_failures: Mutex<HashMap<String, RemoteError>>,
    request_delay: Mutex<Duration>,
    user: Mutex<Option<User>>,
    profiles: Mutex<HashMap<String, Profile>>,
    profile_calls: AtomicUsize,
    profile_delay: Mutex<Duration>,
    profile_error: Mutex<Option<RemoteError>>,
    telemetry: Mutex<Vec<ObservabilityEvent>>,
    telemetry_failures: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
            request_failures: Mutex::new(VecDeque::new()),
            endpoint_failures: Mutex::new(HashMap::new()),
            request_delay: Mutex::new(Duration::ZERO),
            user: Mutex::new(None),
            profiles: Mutex::new(HashMap::new()),
            profile_calls: AtomicUsize::new(0),
            profile_delay: Mutex::new(Duration::ZERO),
            profile_error: Mutex::new(None),
            telemetry: Mutex::new(Vec::new()),
            telemetry_failures: AtomicUsize::new(0),
        }
    }

    pub fn offline() -> Self {
        let backend = Self::new();
        backend.set_online(false);
        backend
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Fail the next request with `error`. Calls stack in order.
    pub fn fail_next_request(&self, error: RemoteError) {
        self.request_failures.lock().push_back(error);
    }

    /// Fail every request to `endpoint` with `error` until cleared.
    pub fn fail_endpoint(&self, endpoint: impl Into<String>, error: RemoteError) {
        self.endpoint_failures.lock().insert(endpoint.into(), error);
    }

    pub fn clear_endpoint_failures(&self) {
        self.endpoint_failures.lock().clear();
    }

    pub fn set_request_delay(&self, delay: Duration) {
        *self.request_delay.lock() = delay;
    }

    /// Every request that reached the backend, successful or not, in order.
    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn sign_in(&self, user: User) {
        *self.user.lock() = Some(user);
    }

    pub fn sign_out(&self) {
        *self.user.lock() = None;
    }

    pub fn set_profile(&self, user_id: impl Into<String>, profile: Profile) {
        self.profiles.lock().insert(user_id.into(), profile);
    }

    pub fn set_profile_delay(&self, delay: Duration) {
        *self.profile_delay.lock() = delay;
    }

    pub fn fail_profile(&self, error: Option<RemoteError>) {
        *self.profile_error.lock() = error;
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    /// Fail the next `count` telemetry sends.
    pub fn fail_telemetry(&self, count: usize) {
        self.telemetry_failures.store(count, Ordering::SeqCst);
    }

    pub fn telemetry(&self) -> Vec<ObservabilityEvent> {
        self.telemetry.lock().clone()
    }

    fn take_failure(&self, endpoint: &str) -> Option<RemoteError> {
        if let Some(error) = self.request_failures.lock().pop_front() {
            return Some(error);
        }
        self.endpoint_failures.lock().get(endpoint).cloned()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApi for MemoryBackend {
    async fn request(&self, request: RemoteRequest) -> RemoteResponse {
        let delay = *self.request_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !self.online.load(Ordering::SeqCst) {
            return RemoteResponse::err(RemoteError::network("network unreachable"));
        }

        self.requests.lock().push(request.clone());
        match self.take_failure(&request.endpoint) {
            Some(error) => RemoteResponse::err(error),
            None => RemoteResponse::ok(json!({
                "endpoint": request.endpoint,
                "accepted": true,
            })),
        }
    }
}

#[async_trait]
impl ProfileSource for MemoryBackend {
    async fn fetch_profile(&self, user: &User) -> Result<Profile, RemoteError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.profile_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.profile_error.lock().clone() {
            return Err(error);
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::network("network unreachable"));
        }

        Ok(self
            .profiles
            .lock()
            .get(&user.id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl AuthProvider for MemoryBackend {
    async fn current_user(&self) -> Result<Option<User>, RemoteError> {
        Ok(self.user.lock().clone())
    }
}

#[async_trait]
impl ConnectivityProbe for MemoryBackend {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySink for MemoryBackend {
    async fn send(&self, event: &ObservabilityEvent) -> Result<(), RemoteError> {
        let remaining = self.telemetry_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.telemetry_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RemoteError::http(503, "collector unavailable"));
        }
        self.telemetry.lock().push(event.clone());
        Ok(())
    }
}
