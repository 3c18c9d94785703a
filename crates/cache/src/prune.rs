//! Size-bounded pruning, oldest-access-time first.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::AssetCache;

/// Pruning stops once the cache is back under this fraction of the maximum.
const PRUNE_TARGET: f64 = 0.9;

/// Result of one prune run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub total_before: u64,
    pub total_after: u64,
    pub deleted_files: usize,
}

struct CandidateFile {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
}

impl AssetCache {
    /// Prunes the mutable cache inline.
    ///
    /// If the total size exceeds the configured maximum, files are deleted
    /// oldest-access-time first until the total drops to 90% of the
    /// maximum. Returns `None` when another prune run is already in flight
    /// (single-flight guard). The static store is never touched.
    pub fn prune(&self) -> Option<PruneStats> {
        if self.pruning.swap(true, Ordering::AcqRel) {
            debug!("prune already running, skipping");
            return None;
        }
        let stats = self.prune_locked();
        self.pruning.store(false, Ordering::Release);
        Some(stats)
    }

    fn prune_locked(&self) -> PruneStats {
        let mut files = Vec::new();
        let entries = match std::fs::read_dir(&self.config.dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "prune: cannot read cache directory");
                return PruneStats::default();
            }
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            // Access time where the filesystem tracks it, else mtime.
            let accessed = meta
                .accessed()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(CandidateFile {
                path: entry.path(),
                size: meta.len(),
                accessed,
            });
        }

        let total_before: u64 = files.iter().map(|f| f.size).sum();
        let mut stats = PruneStats {
            total_before,
            total_after: total_before,
            deleted_files: 0,
        };
        if total_before <= self.config.max_bytes {
            return stats;
        }

        let target = (self.config.max_bytes as f64 * PRUNE_TARGET) as u64;
        files.sort_by_key(|f| f.accessed);

        for file in &files {
            if stats.total_after <= target {
                break;
            }
            match std::fs::remove_file(&file.path) {
                Ok(()) => {
                    stats.total_after -= file.size;
                    stats.deleted_files += 1;
                }
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "prune: delete failed");
                }
            }
        }

        info!(
            before = stats.total_before,
            after = stats.total_after,
            deleted = stats.deleted_files,
            "cache pruned"
        );
        stats
    }

    /// Fire-and-forget prune on the blocking pool.
    ///
    /// Returns immediately; the single-flight guard in [`prune`](Self::prune)
    /// makes overlapping calls no-ops.
    pub fn begin_prune(self: &Arc<Self>) -> tokio::task::JoinHandle<Option<PruneStats>> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.prune())
    }

    /// Starts the periodic prune timer. Cancel via `cancel`.
    pub fn start_prune_timer(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.prune_interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = cache.begin_prune();
                    }
                }
            }
        })
    }
}
