//! Local onboarding drafts for offline prefill.

use herdsync_core::keys::{ONBOARDING_CACHE, ONBOARDING_PENDING_COMPLETION};
use herdsync_core::SharedClock;
use herdsync_store::{read_json, write_json, KvStore, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// The last onboarding step the user reached and what they had entered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingDraft {
    pub step: String,
    pub data: Value,
    pub updated_at: i64,
}

/// Onboarding the user finished locally but the backend has not confirmed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCompletion {
    pub data: Value,
    pub requested_at: i64,
}

pub struct OnboardingDrafts<S: KvStore> {
    store: Arc<S>,
    clock: SharedClock,
}

impl<S: KvStore> OnboardingDrafts<S> {
    pub fn new(store: Arc<S>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub async fn save_step(&self, step: impl Into<String>, data: Value) -> Result<()> {
        let draft = OnboardingDraft {
            step: step.into(),
            data,
            updated_at: self.clock.now_millis(),
        };
        write_json(self.store.as_ref(), ONBOARDING_CACHE, &draft).await
    }

    pub async fn load(&self) -> Option<OnboardingDraft> {
        self.read_lenient(ONBOARDING_CACHE).await
    }

    pub async fn mark_pending_completion(&self, data: Value) -> Result<()> {
        let pending = PendingCompletion {
            data,
            requested_at: self.clock.now_millis(),
        };
        write_json(self.store.as_ref(), ONBOARDING_PENDING_COMPLETION, &pending).await
    }

    pub async fn pending_completion(&self) -> Option<PendingCompletion> {
        self.read_lenient(ONBOARDING_PENDING_COMPLETION).await
    }

    /// Drop the draft and any pending-completion marker.
    pub async fn clear(&self) -> Result<()> {
        self.store.remove(ONBOARDING_CACHE).await?;
        self.store.remove(ONBOARDING_PENDING_COMPLETION).await
    }

    async fn read_lenient<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match read_json(self.store.as_ref(), key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "unreadable onboarding state, ignoring");
                None
            }
        }
    }
}
