//! # herdsync-core
//!
//! Core data model for the herdsync offline-first engine.
//!
//! This crate provides:
//! - [`QueuedMutation`] and its transition functions
//! - [`ObservabilityEvent`] for best-effort telemetry
//! - [`CacheEntry`] / [`CacheRecord`] for TTL-bound cached reads
//! - [`Clock`] implementations (system and manually driven)
//! - The storage keys shared by every layer
//!
//! Nothing here performs I/O; persistence lives in `herdsync-store`.

pub mod cache_entry;
pub mod clock;
pub mod event;
pub mod keys;
pub mod mutation;

pub use cache_entry::{CacheEntry, CacheRecord};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use event::{EventCategory, ObservabilityEvent};
pub use mutation::{HttpMethod, MutationId, MutationStatus, NewMutation, QueuedMutation, Target};
