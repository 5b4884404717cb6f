//! Versioned asset cache for offline use.
//!
//! This module keeps one named bucket of the app's static assets per deployed
//! version and:
//! - Pre-caches the asset manifest as a unit during install
//! - Evicts every stale bucket during activate
//! - Answers intercepted requests cache-first or network-first
//! - Falls back to an offline page (or a synthesized 503) for navigations

mod manager;
mod storage;
mod traits;

pub use manager::{CacheManager, CacheSettings};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{FetchOutcome, ResponseSource, StoredResponse};
