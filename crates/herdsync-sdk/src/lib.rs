//! herdsync SDK - offline-first sync for field data collection
//!
//! This SDK lets a field client record mutations while disconnected and
//! have them delivered, in order, once the device is back online. It also
//! provides local-first cached reads, best-effort telemetry and the
//! profile/onboarding gate that decides what a signed-in user may see.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use herdsync_sdk::prelude::*;
//! use herdsync_store::MemoryKvStore;
//! use std::sync::Arc;
//!
//! let client = Client::with_defaults(Arc::new(MemoryKvStore::new()), Arc::new(MemoryBackend::new()));
//! client.start().await?;
//!
//! // Committed locally, delivered when online.
//! client
//!     .enqueue(NewMutation::new(
//!         "move-herd",
//!         Target::put("/herds/3/paddock"),
//!         serde_json::json!({ "paddock": "P7" }),
//!     ))
//!     .await?;
//!
//! // Watch the number of unsynced changes.
//! let mut pending = client.pending_watch();
//! pending.changed().await?;
//! ```
//!
//! # Architecture
//!
//! - [`client`] - Facade wiring every component over one store and backend
//! - [`sync`] - Queue draining and retry policy
//! - [`monitor`] - Connectivity and pending-count polling
//! - [`observability`] - Telemetry queue with bounded retries
//! - [`guard`] - Profile/onboarding state machine
//! - [`query`] - Stale-while-revalidate reads
//! - [`remote`] - Traits for the backend and device
//! - [`error`] - Error types

pub mod client;
pub mod error;
mod flag;
pub mod guard;
pub mod identity;
pub mod memory;
pub mod monitor;
pub mod observability;
pub mod onboarding;
pub mod query;
pub mod remote;
pub mod sync;

// Re-exports for convenience
pub use client::{Client, ClientConfig, ClientConfigBuilder};
pub use error::{Result, SdkError};
pub use guard::{GuardConfig, GuardError, GuardPhase, ProfileGuard, ProfileGuardState};
pub use identity::IdentityContext;
pub use memory::MemoryBackend;
pub use monitor::{ConnectivityChange, EdgeDetector, NetworkMonitor, SyncTrigger};
pub use observability::{FlushReport, ObservabilityConfig, ObservabilityQueue, MAX_RETRIES};
pub use onboarding::{OnboardingDraft, OnboardingDrafts, PendingCompletion};
pub use query::{Activation, CachedQuery, Fetcher, QueryState};
pub use remote::{
    AuthProvider, Backend, ConnectivityProbe, FailureClass, Profile, ProfileSource, RemoteApi,
    RemoteError, RemoteRequest, RemoteResponse, TelemetrySink, User,
};
pub use sync::{DrainReport, RetryPolicy, SyncConfig, SyncConfigBuilder, SyncEngine, SyncEvent};

// Re-export commonly used types from the lower layers
pub use herdsync_core::{
    HttpMethod, MutationId, MutationStatus, NewMutation, ObservabilityEvent, QueuedMutation,
    Target,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{Client, ClientConfig};
    pub use crate::error::SdkError;
    pub use crate::guard::GuardPhase;
    pub use crate::memory::MemoryBackend;
    pub use crate::remote::{Backend, RemoteApi};
    pub use crate::sync::{RetryPolicy, SyncConfig};
    pub use herdsync_core::{MutationId, NewMutation, Target};
}
