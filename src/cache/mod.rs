//! Offline cache for the worker.
//!
//! This module provides the per-request caching policies:
//! - Classifies each GET into static, API, image, navigation or dynamic
//! - Cache-first for static assets and images, with age-based expiry
//! - Network-first for API calls and page loads, with offline fallbacks
//! - Stale-while-revalidate for everything else
//! - Version-qualified buckets pruned when the cache version changes

mod classify;
mod layer;
mod storage;
mod traits;

pub use classify::{classify, RequestClass};
pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, ResponseSource};
