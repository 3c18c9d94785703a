//! Fetch/upload routing across cache, HTTP capabilities and the legacy
//! protocol.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use gridlink_cache::AssetCache;
use gridlink_http::HttpTransport;
use gridlink_transfer::{DownloadCallback, TransferManager, UploadCallback};
use gridlink_types::{
    Asset, AssetId, AssetReceipt, AssetType, CAP_GET_TEXTURE, CAP_NEW_FILE_AGENT_INVENTORY,
    CAP_UPDATE_NOTECARD, CAP_UPDATE_SCRIPT, CAP_UPLOAD_BAKED_TEXTURE, CAP_VIEWER_ASSET, Priority,
    Session, StatusCode, TransferId,
};

use crate::AssetError;

/// Invoked exactly once per fetch with the typed asset, or `None` on
/// failure. Panics inside the callback are caught and logged.
pub type FetchCallback = Box<dyn FnOnce(AssetReceipt, Option<Asset>) + Send>;

/// Routes asset operations to the cheapest available path.
///
/// Fetch order: disk cache, then the HTTP capability when the type is
/// HTTP-fetchable and a capability is known, then the legacy channel
/// download. HTTP failure fails the fetch except for textures, which fall
/// back to the legacy path.
pub struct AssetDispatcher {
    session: Arc<Session>,
    cache: Arc<AssetCache>,
    http: Arc<HttpTransport>,
    transfers: TransferManager,
    cancel: CancellationToken,
}

impl AssetDispatcher {
    pub fn new(
        session: Arc<Session>,
        cache: Arc<AssetCache>,
        http: Arc<HttpTransport>,
        transfers: TransferManager,
    ) -> Self {
        Self {
            session,
            cache,
            http,
            transfers,
            cancel: CancellationToken::new(),
        }
    }

    /// The underlying transfer manager (inbound dispatch, events).
    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }

    /// Aborts in-flight HTTP requests.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // -----------------------------------------------------------------------
    // Fetch
    // -----------------------------------------------------------------------

    /// Fetches an asset, delivering the result through `callback`.
    pub async fn request_asset(
        &self,
        asset_id: AssetId,
        asset_type: AssetType,
        priority: Priority,
        callback: FetchCallback,
    ) -> Result<(), AssetError> {
        if let Some(data) = self.cache.get(&asset_id) {
            debug!(%asset_id, "cache hit");
            invoke_fetch(
                callback,
                AssetReceipt::success(TransferId::random(), asset_id, asset_type),
                Some(Asset::new(asset_id, asset_type, data)),
            );
            return Ok(());
        }

        if asset_type.is_http_fetchable() {
            if let Some(cap) = self.fetch_capability(asset_type) {
                let url = format!(
                    "{cap}/?{tag}_id={asset_id}",
                    tag = asset_type.http_query_tag()
                );
                match self.http.get(&url, None, &self.cancel).await {
                    Ok(data) => {
                        self.cache.put(&asset_id, &data);
                        invoke_fetch(
                            callback,
                            AssetReceipt::success(TransferId::random(), asset_id, asset_type),
                            Some(Asset::new(asset_id, asset_type, data)),
                        );
                        return Ok(());
                    }
                    Err(e) if asset_type == AssetType::Texture => {
                        // Textures keep a legacy fallback; other types fail
                        // here.
                        warn!(%asset_id, error = %e, "texture fetch failed, using legacy path");
                    }
                    Err(e) => {
                        warn!(%asset_id, error = %e, "HTTP asset fetch failed");
                        invoke_fetch(
                            callback,
                            AssetReceipt::failure(
                                TransferId::random(),
                                asset_id,
                                asset_type,
                                StatusCode::Error,
                            ),
                            None,
                        );
                        return Ok(());
                    }
                }
            }
        }

        let host = self
            .session
            .current_host()
            .ok_or(AssetError::NotConnected)?;
        self.transfers.request_asset(
            asset_id,
            asset_type,
            priority,
            host,
            self.wrap_fetch(callback),
        );
        Ok(())
    }

    /// Fetches an asset and waits for it, up to `wait`.
    pub async fn fetch_asset(
        &self,
        asset_id: AssetId,
        asset_type: AssetType,
        wait: Duration,
    ) -> Result<Asset, AssetError> {
        let (tx, rx) = oneshot::channel();
        self.request_asset(
            asset_id,
            asset_type,
            Priority::default(),
            Box::new(move |receipt, asset| {
                let _ = tx.send((receipt, asset));
            }),
        )
        .await?;

        match timeout(wait, rx).await {
            Ok(Ok((_, Some(asset)))) => Ok(asset),
            Ok(Ok((receipt, None))) => Err(AssetError::Fetch {
                asset_id,
                status: receipt.status,
            }),
            Ok(Err(_)) => Err(AssetError::Fetch {
                asset_id,
                status: StatusCode::Error,
            }),
            Err(_) => Err(AssetError::Timeout(wait)),
        }
    }

    fn fetch_capability(&self, asset_type: AssetType) -> Option<String> {
        if asset_type == AssetType::Texture {
            if let Some(url) = self.session.resolve_capability(CAP_GET_TEXTURE) {
                return Some(url);
            }
        }
        self.session.resolve_capability(CAP_VIEWER_ASSET)
    }

    /// Adapts a fetch callback to the transfer layer: persists successful
    /// downloads to the cache and wraps the bytes in a typed [`Asset`].
    fn wrap_fetch(&self, callback: FetchCallback) -> DownloadCallback {
        let cache = Arc::clone(&self.cache);
        Box::new(move |receipt, data| {
            let asset = data.map(|bytes| {
                if receipt.success {
                    cache.put(&receipt.asset_id, &bytes);
                }
                Asset::new(receipt.asset_id, receipt.asset_type, bytes)
            });
            invoke_fetch(callback, receipt, asset);
        })
    }

    // -----------------------------------------------------------------------
    // Upload / update
    // -----------------------------------------------------------------------

    /// Uploads a new asset, preferring the inventory-creation capability.
    pub async fn upload_asset(
        &self,
        asset_id: AssetId,
        asset_type: AssetType,
        data: Vec<u8>,
        temp_file: bool,
        store_local: bool,
        callback: UploadCallback,
    ) -> Result<TransferId, AssetError> {
        // Uploaded content is cached locally up front.
        self.cache.put(&asset_id, &data);

        if let Some(url) = self.session.resolve_capability(CAP_NEW_FILE_AGENT_INVENTORY) {
            return self.upload_via_capability(&url, asset_id, data, callback).await;
        }

        let host = self
            .session
            .current_host()
            .ok_or(AssetError::NotConnected)?;
        Ok(self
            .transfers
            .upload_asset(
                asset_id,
                asset_type,
                data,
                temp_file,
                store_local,
                host,
                guard_upload(callback),
            )
            .await?)
    }

    /// Uploads a baked appearance texture.
    pub async fn upload_baked_texture(
        &self,
        asset_id: AssetId,
        data: Vec<u8>,
        callback: UploadCallback,
    ) -> Result<TransferId, AssetError> {
        if let Some(url) = self.session.resolve_capability(CAP_UPLOAD_BAKED_TEXTURE) {
            return self.upload_via_capability(&url, asset_id, data, callback).await;
        }

        let host = self
            .session
            .current_host()
            .ok_or(AssetError::NotConnected)?;
        // Bakes are transient: temp file, stored sim-side only.
        Ok(self
            .transfers
            .upload_asset(
                asset_id,
                AssetType::Texture,
                data,
                true,
                true,
                host,
                guard_upload(callback),
            )
            .await?)
    }

    /// Replaces the content of an existing notecard. Capability-only.
    pub async fn update_notecard(
        &self,
        item_id: Uuid,
        data: Vec<u8>,
        callback: UploadCallback,
    ) -> Result<(), AssetError> {
        self.update_via_capability(CAP_UPDATE_NOTECARD, item_id, data, callback)
            .await
    }

    /// Replaces the content of an existing script. Capability-only.
    pub async fn update_script(
        &self,
        item_id: Uuid,
        data: Vec<u8>,
        callback: UploadCallback,
    ) -> Result<(), AssetError> {
        self.update_via_capability(CAP_UPDATE_SCRIPT, item_id, data, callback)
            .await
    }

    async fn upload_via_capability(
        &self,
        url: &str,
        asset_id: AssetId,
        data: Vec<u8>,
        callback: UploadCallback,
    ) -> Result<TransferId, AssetError> {
        let transfer_id = TransferId::random();
        match self
            .http
            .post(url, data, "application/octet-stream", &self.cancel)
            .await
        {
            Ok(_) => invoke_upload(callback, true, "complete".into(), asset_id),
            Err(e) => {
                warn!(%asset_id, error = %e, "HTTP upload failed");
                invoke_upload(callback, false, e.to_string(), asset_id);
            }
        }
        Ok(transfer_id)
    }

    async fn update_via_capability(
        &self,
        cap_name: &'static str,
        item_id: Uuid,
        data: Vec<u8>,
        callback: UploadCallback,
    ) -> Result<(), AssetError> {
        let url = self
            .session
            .resolve_capability(cap_name)
            .ok_or(AssetError::NoCapability(cap_name))?;
        match self
            .http
            .post(&url, data, "application/octet-stream", &self.cancel)
            .await
        {
            Ok(_) => invoke_upload(callback, true, "complete".into(), AssetId(item_id)),
            Err(e) => {
                warn!(%item_id, error = %e, "content update failed");
                invoke_upload(callback, false, e.to_string(), AssetId(item_id));
            }
        }
        Ok(())
    }
}

/// Runs a fetch callback, containing any panic it raises.
fn invoke_fetch(callback: FetchCallback, receipt: AssetReceipt, asset: Option<Asset>) {
    let asset_id = receipt.asset_id;
    if std::panic::catch_unwind(AssertUnwindSafe(move || callback(receipt, asset))).is_err() {
        error!(%asset_id, "fetch callback panicked");
    }
}

fn invoke_upload(callback: UploadCallback, success: bool, message: String, asset_id: AssetId) {
    if std::panic::catch_unwind(AssertUnwindSafe(move || callback(success, message, asset_id)))
        .is_err()
    {
        error!(%asset_id, "upload callback panicked");
    }
}

/// Wraps an upload callback with the same panic containment for the legacy
/// path, where it fires inside the transfer manager.
fn guard_upload(callback: UploadCallback) -> UploadCallback {
    Box::new(move |success, message, asset_id| {
        invoke_upload(callback, success, message, asset_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use gridlink_cache::CacheConfig;
    use gridlink_protocol::messages::{TransferInfo, TransferPacket};
    use gridlink_protocol::{Message, MessageSender, params};
    use gridlink_types::{ChannelType, SimHost, StatusCode, TransferConfig};

    struct MockSender {
        sent: Mutex<Vec<Message>>,
    }

    impl MockSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl MessageSender for MockSender {
        fn send(&self, message: Message, _host: &SimHost) {
            self.sent.lock().unwrap().push(message);
        }
    }

    fn test_host() -> SimHost {
        SimHost {
            name: "Test Sim".into(),
            address: "127.0.0.1:9000".parse().unwrap(),
        }
    }

    fn dispatcher() -> (tempfile::TempDir, Arc<Session>, AssetDispatcher, Arc<MockSender>) {
        let tmp = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::new(Uuid::new_v4(), Uuid::new_v4()));
        session.set_current_host(test_host());
        let cache = Arc::new(AssetCache::new(CacheConfig::new(tmp.path().join("cache"))).unwrap());
        let http = Arc::new(HttpTransport::new(Duration::from_secs(2)).unwrap());
        let sender = MockSender::new();
        let transfers = TransferManager::new(
            TransferConfig::default(),
            Arc::clone(&sender) as Arc<dyn MessageSender>,
        );
        let dispatcher = AssetDispatcher::new(Arc::clone(&session), cache, http, transfers);
        (tmp, session, dispatcher, sender)
    }

    type Slot = Arc<Mutex<Option<(AssetReceipt, Option<Asset>)>>>;

    fn fetch_slot() -> (Slot, FetchCallback) {
        let slot: Slot = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let callback = Box::new(move |receipt, asset| {
            *inner.lock().unwrap() = Some((receipt, asset));
        });
        (slot, callback)
    }

    /// One-shot HTTP server answering every request with `status` and `body`.
    async fn http_server(status: u16, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(&body).await;
                let _ = stream.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    fn transfer_id_of(sender: &MockSender) -> TransferId {
        sender
            .sent()
            .iter()
            .find_map(|m| match m {
                Message::TransferRequest(r) => Some(r.transfer_id),
                _ => None,
            })
            .expect("a transfer request was sent")
    }

    fn feed_download(
        dispatcher: &AssetDispatcher,
        transfer_id: TransferId,
        asset_id: AssetId,
        chunks: &[&[u8]],
        order: &[usize],
    ) {
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        dispatcher
            .transfers()
            .handle_message(Message::TransferInfo(TransferInfo {
                transfer_id,
                channel: ChannelType::Asset.code(),
                target: 2,
                status: StatusCode::Ok.code(),
                size: total as i32,
                params: params::AssetParams {
                    asset_id,
                    asset_type: AssetType::Texture,
                }
                .encode(),
            }));
        for &i in order {
            dispatcher
                .transfers()
                .handle_message(Message::TransferPacket(TransferPacket {
                    transfer_id,
                    channel: ChannelType::Asset.code(),
                    packet_num: i as u32,
                    status: StatusCode::Ok.code(),
                    data: chunks[i].to_vec(),
                }));
        }
    }

    // -------------------------------------------------------------------
    // End to end
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn texture_without_capability_uses_legacy_and_caches() {
        let (_tmp, _session, dispatcher, sender) = dispatcher();
        let (slot, callback) = fetch_slot();
        let asset_id = AssetId::random();

        dispatcher
            .request_asset(asset_id, AssetType::Texture, Priority::default(), callback)
            .await
            .unwrap();

        // No capability known: the legacy channel request goes out.
        let transfer_id = transfer_id_of(&sender);
        let first = vec![1u8; 1000];
        let second = vec![2u8; 1000];
        // Packets arrive out of order.
        feed_download(
            &dispatcher,
            transfer_id,
            asset_id,
            &[&first, &second],
            &[1, 0],
        );

        let (receipt, asset) = slot.lock().unwrap().take().expect("one callback");
        assert!(receipt.success);
        let asset = asset.unwrap();
        assert_eq!(asset.id, asset_id);
        assert_eq!(asset.data.len(), 2000);
        assert_eq!(&asset.data[..1000], &first[..]);
        assert!(dispatcher.cache().has(&asset_id), "download must be cached");
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let (_tmp, _session, dispatcher, sender) = dispatcher();
        let asset_id = AssetId::random();

        let (slot, callback) = fetch_slot();
        dispatcher
            .request_asset(asset_id, AssetType::Sound, Priority::default(), callback)
            .await
            .unwrap();
        let transfer_id = transfer_id_of(&sender);
        feed_download(&dispatcher, transfer_id, asset_id, &[b"ding"], &[0]);
        assert!(slot.lock().unwrap().take().is_some());

        let sent_before = sender.sent().len();
        let (slot, callback) = fetch_slot();
        dispatcher
            .request_asset(asset_id, AssetType::Sound, Priority::default(), callback)
            .await
            .unwrap();

        let (receipt, asset) = slot.lock().unwrap().take().expect("cache hit callback");
        assert!(receipt.success);
        assert_eq!(asset.unwrap().data, b"ding");
        assert_eq!(
            sender.sent().len(),
            sent_before,
            "cache hit must not touch the network"
        );
    }

    #[tokio::test]
    async fn http_capability_fetch_caches_and_skips_legacy() {
        let (_tmp, session, dispatcher, sender) = dispatcher();
        let url = http_server(200, b"texture-bytes".to_vec()).await;
        session.set_capability(CAP_GET_TEXTURE, url);

        let (slot, callback) = fetch_slot();
        let asset_id = AssetId::random();
        dispatcher
            .request_asset(asset_id, AssetType::Texture, Priority::default(), callback)
            .await
            .unwrap();

        let (receipt, asset) = slot.lock().unwrap().take().expect("callback fired");
        assert!(receipt.success);
        assert_eq!(asset.unwrap().data, b"texture-bytes");
        assert!(dispatcher.cache().has(&asset_id));
        assert!(sender.sent().is_empty(), "no legacy messages expected");
    }

    #[tokio::test]
    async fn texture_http_failure_falls_back_to_legacy() {
        let (_tmp, session, dispatcher, sender) = dispatcher();
        let url = http_server(404, Vec::new()).await;
        session.set_capability(CAP_GET_TEXTURE, url);

        let (_slot, callback) = fetch_slot();
        dispatcher
            .request_asset(
                AssetId::random(),
                AssetType::Texture,
                Priority::default(),
                callback,
            )
            .await
            .unwrap();

        assert!(
            sender
                .sent()
                .iter()
                .any(|m| matches!(m, Message::TransferRequest(_))),
            "texture must fall back to the legacy channel"
        );
    }

    #[tokio::test]
    async fn non_texture_http_failure_fails_fetch() {
        let (_tmp, session, dispatcher, sender) = dispatcher();
        let url = http_server(500, Vec::new()).await;
        session.set_capability(CAP_VIEWER_ASSET, url);

        let (slot, callback) = fetch_slot();
        dispatcher
            .request_asset(
                AssetId::random(),
                AssetType::Sound,
                Priority::default(),
                callback,
            )
            .await
            .unwrap();

        let (receipt, asset) = slot.lock().unwrap().take().expect("callback fired");
        assert!(!receipt.success);
        assert!(asset.is_none());
        assert!(sender.sent().is_empty(), "no legacy fallback for sounds");
    }

    #[tokio::test]
    async fn panicking_callback_is_contained() {
        let (_tmp, _session, dispatcher, _sender) = dispatcher();
        let asset_id = AssetId::random();
        dispatcher.cache().put(&asset_id, b"cached");

        dispatcher
            .request_asset(
                asset_id,
                AssetType::Notecard,
                Priority::default(),
                Box::new(|_, _| panic!("user callback bug")),
            )
            .await
            .unwrap();

        // A later fetch still works.
        let (slot, callback) = fetch_slot();
        dispatcher
            .request_asset(asset_id, AssetType::Notecard, Priority::default(), callback)
            .await
            .unwrap();
        assert!(slot.lock().unwrap().take().is_some());
    }

    // -------------------------------------------------------------------
    // Uploads
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn upload_without_capability_uses_legacy() {
        let (_tmp, _session, dispatcher, sender) = dispatcher();
        let asset_id = AssetId::random();

        dispatcher
            .upload_asset(
                asset_id,
                AssetType::Gesture,
                vec![5u8; 100],
                false,
                false,
                Box::new(|_, _, _| {}),
            )
            .await
            .unwrap();

        assert!(
            sender
                .sent()
                .iter()
                .any(|m| matches!(m, Message::AssetUploadRequest(r) if r.data.len() == 100)),
            "small upload goes inline over the legacy path"
        );
        assert!(dispatcher.cache().has(&asset_id));
    }

    #[tokio::test]
    async fn upload_with_capability_posts_http() {
        let (_tmp, session, dispatcher, sender) = dispatcher();
        let url = http_server(200, b"ok".to_vec()).await;
        session.set_capability(CAP_NEW_FILE_AGENT_INVENTORY, url);

        let slot = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        dispatcher
            .upload_asset(
                AssetId::random(),
                AssetType::Animation,
                vec![1u8; 50],
                false,
                false,
                Box::new(move |success, message, id| {
                    *inner.lock().unwrap() = Some((success, message, id));
                }),
            )
            .await
            .unwrap();

        let (success, _, _) = slot.lock().unwrap().take().expect("callback fired");
        assert!(success);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn update_script_requires_capability() {
        let (_tmp, _session, dispatcher, _sender) = dispatcher();
        let result = dispatcher
            .update_script(Uuid::new_v4(), b"default {}".to_vec(), Box::new(|_, _, _| {}))
            .await;
        assert!(matches!(result, Err(AssetError::NoCapability(_))));
    }

    #[tokio::test]
    async fn update_notecard_posts_to_capability() {
        let (_tmp, session, dispatcher, _sender) = dispatcher();
        let url = http_server(200, Vec::new()).await;
        session.set_capability(CAP_UPDATE_NOTECARD, url);

        let slot = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        dispatcher
            .update_notecard(
                Uuid::new_v4(),
                b"notes".to_vec(),
                Box::new(move |success, _, _| {
                    *inner.lock().unwrap() = Some(success);
                }),
            )
            .await
            .unwrap();

        assert_eq!(slot.lock().unwrap().take(), Some(true));
    }
}
