//! Concurrency-bounded batch texture fetching for appearance baking.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::debug;

use gridlink_transfer::UploadCallback;
use gridlink_types::{Asset, AssetId, AssetType, TransferId};

use crate::{AssetDispatcher, AssetError};

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Batches texture downloads through the dispatcher with a bounded number
/// in flight, deduplicating concurrent requests for the same id.
pub struct TexturePipeline {
    dispatcher: Arc<AssetDispatcher>,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<AssetId>>,
    fetch_timeout: Duration,
}

impl TexturePipeline {
    pub fn new(dispatcher: Arc<AssetDispatcher>) -> Self {
        Self::with_concurrency(dispatcher, DEFAULT_CONCURRENCY)
    }

    pub fn with_concurrency(dispatcher: Arc<AssetDispatcher>, concurrency: usize) -> Self {
        Self {
            dispatcher,
            permits: Arc::new(Semaphore::new(concurrency)),
            in_flight: Mutex::new(HashSet::new()),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn set_fetch_timeout(&mut self, timeout: Duration) {
        self.fetch_timeout = timeout;
    }

    /// Fetches one texture, waiting for a concurrency permit first.
    ///
    /// A second request for an id already in flight is rejected rather
    /// than queued; callers retry once the first resolves.
    pub async fn request_texture(&self, asset_id: AssetId) -> Result<Asset, AssetError> {
        if !self.in_flight.lock().unwrap().insert(asset_id) {
            return Err(AssetError::AlreadyInFlight(asset_id));
        }
        let result = self.fetch(asset_id).await;
        self.in_flight.lock().unwrap().remove(&asset_id);
        result
    }

    async fn fetch(&self, asset_id: AssetId) -> Result<Asset, AssetError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AssetError::PipelineClosed)?;
        debug!(%asset_id, "fetching texture layer");
        self.dispatcher
            .fetch_asset(asset_id, AssetType::Texture, self.fetch_timeout)
            .await
    }

    /// Fetches a whole layer set, returning each layer's outcome.
    pub async fn download_layers(
        &self,
        ids: &[AssetId],
    ) -> Vec<(AssetId, Result<Asset, AssetError>)> {
        join_all(
            ids.iter()
                .map(|id| async move { (*id, self.request_texture(*id).await) }),
        )
        .await
    }

    /// Uploads a baked composite texture.
    pub async fn upload_bake(
        &self,
        asset_id: AssetId,
        data: Vec<u8>,
        callback: UploadCallback,
    ) -> Result<TransferId, AssetError> {
        self.dispatcher
            .upload_baked_texture(asset_id, data, callback)
            .await
    }

    /// Rejects all pending and future fetches.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}
