use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use filetime::FileTime;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use gridlink_types::AssetId;

use crate::CacheError;

/// Maps an asset id to its cache filename.
pub type FilenameFn = Arc<dyn Fn(&AssetId) -> String + Send + Sync>;

/// Cache configuration.
#[derive(Clone)]
pub struct CacheConfig {
    /// Mutable cache directory, created on construction.
    pub dir: PathBuf,
    /// Read-only bundled asset directory, consulted on a miss.
    pub static_dir: Option<PathBuf>,
    /// Pruning starts once the cache exceeds this many bytes.
    pub max_bytes: u64,
    /// Interval of the background prune timer.
    pub prune_interval: Duration,
    /// Optional filename override; default is the asset id string.
    pub filename: Option<FilenameFn>,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            static_dir: None,
            max_bytes: 1024 * 1024 * 1024,
            prune_interval: Duration::from_secs(300),
            filename: None,
        }
    }
}

/// Alternative naming scheme: first 16 bytes of SHA-256 of the id, hex.
pub fn hashed_filename(id: &AssetId) -> String {
    let hash = Sha256::digest(id.as_bytes());
    hex::encode(&hash[..16])
}

/// Disk-backed content store keyed by asset id.
///
/// Individual entry I/O failures are logged and treated as misses, never
/// propagated to the caller. Concurrent writers of the *same* id are
/// last-writer-wins; callers avoid that by checking the cache before
/// fetching.
pub struct AssetCache {
    pub(crate) config: CacheConfig,
    pub(crate) pruning: AtomicBool,
}

impl AssetCache {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| CacheError::NoCacheDir(format!("{}: {e}", config.dir.display())))?;
        Ok(Self {
            config,
            pruning: AtomicBool::new(false),
        })
    }

    fn filename(&self, id: &AssetId) -> String {
        match &self.config.filename {
            Some(f) => f(id),
            None => id.to_string(),
        }
    }

    /// Path of the mutable cache entry for `id`.
    pub fn path_for(&self, id: &AssetId) -> PathBuf {
        self.config.dir.join(self.filename(id))
    }

    fn static_path_for(&self, id: &AssetId) -> Option<PathBuf> {
        self.config
            .static_dir
            .as_ref()
            .map(|d| d.join(self.filename(id)))
    }

    /// Whether `id` is present in the mutable or static store.
    pub fn has(&self, id: &AssetId) -> bool {
        self.path_for(id).is_file()
            || self
                .static_path_for(id)
                .is_some_and(|p| p.is_file())
    }

    /// Reads the cached bytes for `id`, bumping its access time.
    ///
    /// Falls back to the static store. I/O failure is a miss.
    pub fn get(&self, id: &AssetId) -> Option<Vec<u8>> {
        let path = self.path_for(id);
        match std::fs::read(&path) {
            Ok(data) => {
                // Recency signal for pruning; best effort.
                let _ = filetime::set_file_atime(&path, FileTime::now());
                return Some(data);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(asset = %id, error = %e, "cache read failed, treating as miss");
            }
        }

        let static_path = self.static_path_for(id)?;
        match std::fs::read(&static_path) {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(asset = %id, error = %e, "static cache read failed");
                None
            }
        }
    }

    /// Writes `data` as the cache entry for `id`.
    ///
    /// Returns `false` on I/O failure (logged, not propagated).
    pub fn put(&self, id: &AssetId, data: &[u8]) -> bool {
        let path = self.path_for(id);
        match std::fs::write(&path, data) {
            Ok(()) => {
                debug!(asset = %id, bytes = data.len(), "cached");
                true
            }
            Err(e) => {
                warn!(asset = %id, error = %e, "cache write failed");
                false
            }
        }
    }
}
