//! # herdsync-cache
//!
//! Local-first cache of remote read results.
//!
//! Values are stored under `cache:<key>` as `{data, timestamp, expiresAt}`
//! and served without touching the network while fresh. Expired entries are
//! evicted by the read that finds them. Concurrent misses on one key are
//! coalesced onto a single fetch.
//!
//! ## Example
//!
//! ```rust,ignore
//! use herdsync_cache::CacheStore;
//! use std::time::Duration;
//!
//! let cache = CacheStore::new(store, clock);
//! let herd: Herd = cache
//!     .get_or_fetch("herd:12", || api.fetch_herd(12), Duration::from_secs(300))
//!     .await?;
//! ```

pub mod error;
pub mod store;

pub use error::{CacheError, Result};
pub use store::CacheStore;
