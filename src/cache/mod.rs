//! Durable key-value cache with TTL semantics.
//!
//! This module provides the storage half of the cache:
//! - Entries carry a payload, creation time, optional TTL and a write version
//! - Expired entries read as absent and are evicted on read
//! - A sweep removes expired entries eagerly
//! - Keys are partitioned into regions by prefix
//!
//! The storage is owned by the cache worker; callers go through
//! [`crate::worker::CacheClient`].

mod domain;
mod storage;
mod traits;

pub use domain::DomainCache;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheEntry, CacheRegion, CacheSource, CacheStats, Cached, EntryMetadata};
