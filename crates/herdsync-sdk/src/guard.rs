//! Profile and onboarding gate.
//!
//! The guard decides which top-level screen a user may see. `Ready` is only
//! ever set from a profile read off the backend, never predicted locally.

use crate::flag::FlagGuard;
use crate::identity::IdentityContext;
use crate::remote::{AuthProvider, ProfileSource, User};
use herdsync_core::SharedClock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Where the user stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GuardPhase {
    #[default]
    Loading,
    AuthRequired,
    OnboardingRequired,
    Ready,
    Error,
}

/// Why a profile check failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("profile check timed out after {0:?}")]
    Timeout(Duration),

    #[error("profile check failed: {0}")]
    Remote(String),
}

impl GuardError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GuardError::Timeout(_))
    }
}

/// Observable guard state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileGuardState {
    pub phase: GuardPhase,
    pub last_error: Option<GuardError>,
    pub check_in_flight: bool,
}

/// Configuration for the profile guard.
#[derive(Clone, Debug)]
pub struct GuardConfig {
    /// Deadline for the remote profile read.
    pub check_timeout: Duration,
    /// How long a resolved user is trusted before asking the auth provider again.
    pub identity_ttl: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(8),
            identity_ttl: Duration::from_secs(60),
        }
    }
}

/// Runs at most one remote profile check per session and publishes the
/// resulting phase.
pub struct ProfileGuard<A: AuthProvider, P: ProfileSource> {
    identity: IdentityContext<A>,
    profiles: Arc<P>,
    config: GuardConfig,
    check_in_flight: AtomicBool,
    attempted: AtomicBool,
    state: watch::Sender<ProfileGuardState>,
}

impl<A: AuthProvider, P: ProfileSource> ProfileGuard<A, P> {
    pub fn new(auth: Arc<A>, profiles: Arc<P>, clock: SharedClock, config: GuardConfig) -> Self {
        let (state, _) = watch::channel(ProfileGuardState::default());
        Self {
            identity: IdentityContext::new(auth, clock, config.identity_ttl),
            profiles,
            config,
            check_in_flight: AtomicBool::new(false),
            attempted: AtomicBool::new(false),
            state,
        }
    }

    pub fn state(&self) -> ProfileGuardState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> GuardPhase {
        self.state.borrow().phase
    }

    pub fn subscribe(&self) -> watch::Receiver<ProfileGuardState> {
        self.state.subscribe()
    }

    pub fn identity(&self) -> &IdentityContext<A> {
        &self.identity
    }

    /// Resolve auth and, once per session, check the remote profile.
    ///
    /// A call made while a check is in flight, or after one has already
    /// finished, returns the current phase without contacting the backend.
    pub async fn evaluate(&self) -> GuardPhase {
        let user = match self.identity.resolve().await {
            Ok(Some(user)) => user,
            Ok(None) => return self.require_auth(),
            Err(e) if e.is_unauthenticated() => return self.require_auth(),
            Err(e) => {
                tracing::warn!(error = %e, "auth lookup failed");
                return self.finish(GuardPhase::Error, Some(GuardError::Remote(e.to_string())));
            }
        };

        let Some(_in_flight) = FlagGuard::acquire(&self.check_in_flight) else {
            tracing::debug!("profile check already in flight");
            return self.phase();
        };
        if self.attempted.swap(true, Ordering::AcqRel) {
            return self.phase();
        }

        self.state.send_modify(|s| {
            s.phase = GuardPhase::Loading;
            s.check_in_flight = true;
        });
        self.check(&user).await
    }

    async fn check(&self, user: &User) -> GuardPhase {
        let timeout = self.config.check_timeout;
        match tokio::time::timeout(timeout, self.profiles.fetch_profile(user)).await {
            Ok(Ok(profile)) if profile.has_completed_onboarding => {
                tracing::debug!(user_id = %user.id, "onboarding complete");
                self.finish(GuardPhase::Ready, None)
            }
            Ok(Ok(profile)) => {
                tracing::debug!(
                    user_id = %user.id,
                    step = ?profile.onboarding_step,
                    "onboarding required"
                );
                self.finish(GuardPhase::OnboardingRequired, None)
            }
            Ok(Err(e)) if e.is_unauthenticated() => {
                self.identity.invalidate();
                self.require_auth()
            }
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user.id, error = %e, "profile check failed");
                self.finish(GuardPhase::Error, Some(GuardError::Remote(e.to_string())))
            }
            Err(_) => {
                tracing::warn!(user_id = %user.id, ?timeout, "profile check timed out");
                self.finish(GuardPhase::Error, Some(GuardError::Timeout(timeout)))
            }
        }
    }

    /// After an error, allow exactly one more check and run it.
    ///
    /// Does nothing unless the guard is in [`GuardPhase::Error`].
    pub async fn retry(&self) -> GuardPhase {
        if self.phase() != GuardPhase::Error {
            return self.phase();
        }
        self.check_in_flight.store(false, Ordering::Release);
        self.attempted.store(false, Ordering::Release);
        self.evaluate().await
    }

    /// Re-check the profile after the user finished onboarding.
    pub async fn complete_onboarding(&self) -> GuardPhase {
        self.attempted.store(false, Ordering::Release);
        self.evaluate().await
    }

    /// Forget the session, e.g. after sign-in or sign-out.
    pub fn reset(&self) {
        self.identity.invalidate();
        self.attempted.store(false, Ordering::Release);
        self.state.send_replace(ProfileGuardState::default());
    }

    fn require_auth(&self) -> GuardPhase {
        // A later sign-in must get a fresh check.
        self.attempted.store(false, Ordering::Release);
        self.finish(GuardPhase::AuthRequired, None)
    }

    fn finish(&self, phase: GuardPhase, error: Option<GuardError>) -> GuardPhase {
        self.state.send_modify(|s| {
            s.phase = phase;
            s.last_error = error;
            s.check_in_flight = false;
        });
        phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::remote::{Profile, RemoteError};
    use herdsync_core::ManualClock;

    fn guard(backend: &Arc<MemoryBackend>) -> ProfileGuard<MemoryBackend, MemoryBackend> {
        ProfileGuard::new(
            backend.clone(),
            backend.clone(),
            Arc::new(ManualClock::default()),
            GuardConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_no_user_requires_auth() {
        let backend = Arc::new(MemoryBackend::new());
        let guard = guard(&backend);

        assert_eq!(guard.evaluate().await, GuardPhase::AuthRequired);
        assert_eq!(backend.profile_calls(), 0);
    }

    #[tokio::test]
    async fn test_incomplete_profile_requires_onboarding() {
        let backend = Arc::new(MemoryBackend::new());
        backend.sign_in(User::new("u1"));
        backend.set_profile("u1", Profile::incomplete("herd-size"));
        let guard = guard(&backend);

        assert_eq!(guard.evaluate().await, GuardPhase::OnboardingRequired);
        assert!(!guard.state().check_in_flight);
    }

    #[tokio::test]
    async fn test_complete_profile_is_ready_and_checked_once() {
        let backend = Arc::new(MemoryBackend::new());
        backend.sign_in(User::new("u1"));
        backend.set_profile("u1", Profile::completed());
        let guard = guard(&backend);

        assert_eq!(guard.evaluate().await, GuardPhase::Ready);
        assert_eq!(guard.evaluate().await, GuardPhase::Ready);
        assert_eq!(backend.profile_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_checks_make_one_call() {
        let backend = Arc::new(MemoryBackend::new());
        backend.sign_in(User::new("u1"));
        backend.set_profile("u1", Profile::completed());
        backend.set_profile_delay(Duration::from_secs(1));
        let guard = guard(&backend);

        let (first, second) = tokio::join!(guard.evaluate(), guard.evaluate());
        assert_eq!(backend.profile_calls(), 1);
        assert_eq!(first, GuardPhase::Ready);
        assert_eq!(second, GuardPhase::Loading);
        assert_eq!(guard.phase(), GuardPhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_retry() {
        let backend = Arc::new(MemoryBackend::new());
        backend.sign_in(User::new("u1"));
        backend.set_profile("u1", Profile::completed());
        backend.set_profile_delay(Duration::from_secs(30));
        let guard = guard(&backend);

        assert_eq!(guard.evaluate().await, GuardPhase::Error);
        let state = guard.state();
        assert_eq!(state.last_error, Some(GuardError::Timeout(Duration::from_secs(8))));
        assert!(!state.check_in_flight);

        // No automatic second attempt.
        assert_eq!(guard.evaluate().await, GuardPhase::Error);
        assert_eq!(backend.profile_calls(), 1);

        backend.set_profile_delay(Duration::ZERO);
        assert_eq!(guard.retry().await, GuardPhase::Ready);
        assert_eq!(backend.profile_calls(), 2);
        assert!(guard.state().last_error.is_none());
    }

    #[tokio::test]
    async fn test_retry_outside_error_is_a_no_op() {
        let backend = Arc::new(MemoryBackend::new());
        backend.sign_in(User::new("u1"));
        backend.set_profile("u1", Profile::completed());
        let guard = guard(&backend);
        guard.evaluate().await;

        assert_eq!(guard.retry().await, GuardPhase::Ready);
        assert_eq!(backend.profile_calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_session_requires_auth() {
        let backend = Arc::new(MemoryBackend::new());
        backend.sign_in(User::new("u1"));
        backend.fail_profile(Some(RemoteError::unauthenticated()));
        let guard = guard(&backend);

        assert_eq!(guard.evaluate().await, GuardPhase::AuthRequired);
        assert!(guard.state().last_error.is_none());
    }

    #[tokio::test]
    async fn test_remote_failure_is_an_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend.sign_in(User::new("u1"));
        backend.fail_profile(Some(RemoteError::http(500, "profile service down")));
        let guard = guard(&backend);

        assert_eq!(guard.evaluate().await, GuardPhase::Error);
        assert!(matches!(guard.state().last_error, Some(GuardError::Remote(_))));
    }

    #[tokio::test]
    async fn test_completing_onboarding_rechecks_remote() {
        let backend = Arc::new(MemoryBackend::new());
        backend.sign_in(User::new("u1"));
        backend.set_profile("u1", Profile::incomplete("paddocks"));
        let guard = guard(&backend);
        assert_eq!(guard.evaluate().await, GuardPhase::OnboardingRequired);

        // The backend has not recorded completion yet; no optimistic ready.
        assert_eq!(guard.complete_onboarding().await, GuardPhase::OnboardingRequired);

        backend.set_profile("u1", Profile::completed());
        assert_eq!(guard.complete_onboarding().await, GuardPhase::Ready);
        assert_eq!(backend.profile_calls(), 3);
    }
}
