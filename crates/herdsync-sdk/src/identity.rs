//! Cached resolution of the signed-in user.

use crate::remote::{AuthProvider, RemoteError, User};
use herdsync_core::SharedClock;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Remembers the resolved user for `ttl` so repeated checks don't hit the
/// auth provider every time. Only a signed-in user is remembered.
pub struct IdentityContext<A: AuthProvider> {
    auth: Arc<A>,
    clock: SharedClock,
    ttl: Duration,
    cached: Mutex<Option<(User, i64)>>,
}

impl<A: AuthProvider> IdentityContext<A> {
    pub fn new(auth: Arc<A>, clock: SharedClock, ttl: Duration) -> Self {
        Self {
            auth,
            clock,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// The current user, from cache while fresh.
    pub async fn resolve(&self) -> Result<Option<User>, RemoteError> {
        if let Some(user) = self.cached_user() {
            return Ok(Some(user));
        }

        let user = self.auth.current_user().await?;
        *self.cached.lock() = user
            .as_ref()
            .map(|user| (user.clone(), self.clock.now_millis()));
        Ok(user)
    }

    /// The cached user, if resolved less than `ttl` ago.
    pub fn cached_user(&self) -> Option<User> {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let now = self.clock.now_millis();
        self.cached
            .lock()
            .as_ref()
            .filter(|(_, at)| now.saturating_sub(*at) < ttl_ms)
            .map(|(user, _)| user.clone())
    }

    /// Forget the cached user; the next [`Self::resolve`] asks the provider.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}
