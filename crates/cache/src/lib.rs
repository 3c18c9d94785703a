//! Disk-backed asset cache.
//!
//! One file per asset, named by asset id (or a pluggable naming function),
//! with a read-only "static assets" directory consulted as a fallback.
//! Recency for pruning comes from filesystem access times.

mod prune;
mod store;

pub use prune::PruneStats;
pub use store::{AssetCache, CacheConfig, FilenameFn, hashed_filename};

/// Errors from cache operations.
///
/// Read/write failures on individual entries are downgraded to misses by
/// [`AssetCache`]; this error surfaces only from setup and pruning.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache directory not available: {0}")]
    NoCacheDir(String),
}
