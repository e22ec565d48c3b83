//! Client-side cache for backend reads.
//!
//! This module provides the in-memory store the rest of the layer reads
//! through:
//! - Entries carry a TTL; past it they are stale but still returnable
//! - Entries carry tags so a write can invalidate every read it affects
//! - Least-recently-accessed entries are evicted past capacity
//! - An optional persistent mirror lets the cache survive a restart

mod storage;
mod store;
mod traits;

pub use storage::{NoopStorage, PersistedEntry, PersistentStore, SqliteStorage};
pub use store::CacheStore;
pub use traits::{CacheEntry, CacheLookup, Cacheable, Freshness};
