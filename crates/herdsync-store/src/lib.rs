//! # herdsync-store
//!
//! Local persistence for the herdsync engine.
//!
//! This crate provides:
//! - [`KvStore`], the async key-value seam, with in-memory and
//!   directory-backed implementations
//! - [`MutationQueue`], the durable FIFO of pending mutations
//! - [`EventQueue`], the weaker store behind the observability queue
//!
//! ## Example
//!
//! ```rust,ignore
//! use herdsync_core::{NewMutation, SystemClock, Target};
//! use herdsync_store::{FileKvStore, MutationQueue};
//! use std::sync::Arc;
//!
//! let store = Arc::new(FileKvStore::open("/data/herdsync").await?);
//! let queue = MutationQueue::new(store, SystemClock::shared());
//!
//! let id = queue
//!     .enqueue(NewMutation::new("weigh", Target::post("/weights"), json!({ "kg": 410 })))
//!     .await?;
//! ```

pub mod error;
pub mod events;
pub mod file;
pub mod kv;
pub mod queue;
mod snapshot;

pub use error::{Result, StoreError};
pub use events::EventQueue;
pub use file::FileKvStore;
pub use kv::{read_json, write_json, FaultyKvStore, KvStore, MemoryKvStore};
pub use queue::MutationQueue;
