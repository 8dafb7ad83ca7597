//! Versioned cache buckets for offline support.
//!
//! This module provides a Cache API style store:
//! - Any number of named buckets, one per deployed version
//! - Request/response entries keyed by URL, honouring `Vary`
//! - All-or-nothing bulk population for pre-caching
//! - SQLite persistence so cached content survives restarts

mod bucket;
mod storage;
mod traits;

pub use bucket::Bucket;
pub use storage::SqliteStorage;
pub use traits::CacheStorage;
#[cfg(test)]
pub use traits::{BucketSummary, CachedEntry};
