//! Transfer orchestration.
//!
//! The manager owns the registry, the outbound sender and the event
//! channel, and is the single inbound dispatch surface: the framing layer
//! hands it one decoded [`Message`] at a time. All per-transfer state lives
//! in the individual state machines; the manager routes, confirms, emits
//! events and tears transfers down exactly once.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use gridlink_protocol::messages::{
    AbortXfer, AssetUploadComplete, AssetUploadRequest, ConfirmXferPacket, RequestXfer,
    RequestXferUpload, SendXferPacket, TransferAbort, TransferInfo, TransferPacket,
    TransferRequest,
};
use gridlink_protocol::{Message, MessageSender, packet, params};
use gridlink_types::{
    AssetId, AssetType, ChannelType, Priority, SimHost, SourceType, StatusCode, TargetType,
    TransferConfig, TransferId, XferId,
};

use crate::download::{AssetDownload, HeaderOutcome, PacketOutcome};
use crate::registry::{TransferEntry, TransferRegistry};
use crate::upload::AssetUpload;
use crate::xfer::{XferDownload, XferOutcome};
use crate::{DownloadCallback, TransferError, UploadCallback};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle notifications emitted alongside the per-transfer callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        transfer_id: TransferId,
        asset_id: AssetId,
        transferred: usize,
        total: usize,
    },
    Completed {
        transfer_id: TransferId,
        asset_id: AssetId,
        asset_type: AssetType,
        size: usize,
    },
    Failed {
        transfer_id: TransferId,
        status: StatusCode,
    },
    UploadCompleted {
        transfer_id: TransferId,
        asset_id: AssetId,
        success: bool,
    },
}

/// Coordinates all in-flight transfers against one simulator connection.
///
/// Cheap to clone; clones share the registry, gate and event channel.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: TransferConfig,
    sender: Arc<dyn MessageSender>,
    registry: TransferRegistry,
    /// Held by whichever upload is awaiting its handshake; the protocol
    /// supports one pending upload announce at a time.
    upload_gate: Arc<tokio::sync::Mutex<()>>,
    /// The upload the next inbound `RequestXferUpload` belongs to.
    pending_upload: Mutex<Option<TransferId>>,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransferEvent>>>,
}

impl TransferManager {
    pub fn new(config: TransferConfig, sender: Arc<dyn MessageSender>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                sender,
                registry: TransferRegistry::new(),
                upload_gate: Arc::new(tokio::sync::Mutex::new(())),
                pending_upload: Mutex::new(None),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Takes the event receiver. Callable once; later calls return `None`.
    pub fn take_events(&self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.inner.events_rx.lock().unwrap().take()
    }

    pub fn active_transfers(&self) -> usize {
        self.inner.registry.len()
    }

    // -----------------------------------------------------------------------
    // Outbound requests
    // -----------------------------------------------------------------------

    /// Starts a channel-mode download of an asset by id and type.
    pub fn request_asset(
        &self,
        asset_id: AssetId,
        asset_type: AssetType,
        priority: Priority,
        host: SimHost,
        callback: DownloadCallback,
    ) -> TransferId {
        let blob = params::AssetParams {
            asset_id,
            asset_type,
        }
        .encode();
        self.start_download(
            asset_id,
            asset_type,
            SourceType::Asset,
            priority,
            blob,
            host,
            callback,
        )
    }

    /// Starts a channel-mode download of content held in another object's
    /// inventory, which needs the extended source locator.
    pub fn request_asset_from_task(
        &self,
        locator: params::TaskInventoryParams,
        priority: Priority,
        host: SimHost,
        callback: DownloadCallback,
    ) -> TransferId {
        let blob = locator.encode();
        self.start_download(
            locator.asset_id,
            locator.asset_type,
            SourceType::SimInventoryItem,
            priority,
            blob,
            host,
            callback,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn start_download(
        &self,
        asset_id: AssetId,
        asset_type: AssetType,
        source: SourceType,
        priority: Priority,
        params_blob: Vec<u8>,
        host: SimHost,
        callback: DownloadCallback,
    ) -> TransferId {
        let transfer_id = TransferId::random();
        let download = Arc::new(AssetDownload::new(
            transfer_id,
            asset_id,
            asset_type,
            source,
            host.clone(),
            callback,
        ));
        self.inner
            .registry
            .register(TransferEntry::Download(download));
        debug!(%transfer_id, %asset_id, ?asset_type, "requesting asset download");
        self.inner.sender.send(
            Message::TransferRequest(TransferRequest {
                transfer_id,
                channel: ChannelType::Asset.code(),
                source: source.code(),
                priority: priority.0,
                params: params_blob,
            }),
            &host,
        );
        transfer_id
    }

    /// Starts a legacy Xfer download of a named server-side file.
    pub fn request_file(
        &self,
        filename: String,
        delete_on_completion: bool,
        host: SimHost,
        callback: DownloadCallback,
    ) -> XferId {
        let xfer_id = XferId::random();
        let mut download =
            XferDownload::by_filename(xfer_id, filename.clone(), host.clone(), callback);
        download.delete_on_completion = delete_on_completion;
        self.inner
            .registry
            .register(TransferEntry::Xfer(Arc::new(download)));
        debug!(%xfer_id, filename, "requesting file xfer");
        self.inner.sender.send(
            Message::RequestXfer(RequestXfer {
                xfer_id,
                filename,
                vfile_id: AssetId::default(),
                vfile_type: AssetType::Unknown.code(),
                delete_on_completion,
                use_big_packets: false,
            }),
            &host,
        );
        xfer_id
    }

    /// Starts a legacy Xfer download of a typed content blob by id.
    pub fn request_vfile(
        &self,
        asset_id: AssetId,
        asset_type: AssetType,
        host: SimHost,
        callback: DownloadCallback,
    ) -> XferId {
        let xfer_id = XferId::random();
        let download =
            XferDownload::by_asset(xfer_id, asset_id, asset_type, host.clone(), callback);
        self.inner
            .registry
            .register(TransferEntry::Xfer(Arc::new(download)));
        debug!(%xfer_id, %asset_id, ?asset_type, "requesting vfile xfer");
        self.inner.sender.send(
            Message::RequestXfer(RequestXfer {
                xfer_id,
                filename: String::new(),
                vfile_id: asset_id,
                vfile_type: asset_type.code(),
                delete_on_completion: false,
                use_big_packets: false,
            }),
            &host,
        );
        xfer_id
    }

    /// Uploads an asset.
    ///
    /// Payloads at or under the inline threshold ride in the announce
    /// message; larger ones go through the chunked Xfer handshake, which
    /// admits one pending upload at a time. A second concurrent upload
    /// waits up to the confirm timeout for the gate, then fails with
    /// [`TransferError::UploadBusy`].
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_asset(
        &self,
        asset_id: AssetId,
        asset_type: AssetType,
        data: Vec<u8>,
        temp_file: bool,
        store_local: bool,
        host: SimHost,
        callback: UploadCallback,
    ) -> Result<TransferId, TransferError> {
        let transfer_id = TransferId::random();

        if data.len() <= self.inner.config.inline_upload_max {
            // Payload rides in the announce; no handshake, no gate.
            let upload = Arc::new(AssetUpload::new(
                transfer_id,
                asset_id,
                asset_type,
                Vec::new(),
                host.clone(),
                callback,
                None,
            ));
            self.inner.registry.register(TransferEntry::Upload(upload));
            debug!(%transfer_id, %asset_id, bytes = data.len(), "inline upload");
            self.inner.sender.send(
                Message::AssetUploadRequest(AssetUploadRequest {
                    transaction_id: transfer_id,
                    asset_type: asset_type.code(),
                    temp_file,
                    store_local,
                    data,
                }),
                &host,
            );
            return Ok(transfer_id);
        }

        let gate = match timeout(
            self.inner.config.confirm_timeout,
            Arc::clone(&self.inner.upload_gate).lock_owned(),
        )
        .await
        {
            Ok(guard) => guard,
            Err(_) => {
                warn!(%asset_id, "upload rejected, another upload handshake is pending");
                return Err(TransferError::UploadBusy(self.inner.config.confirm_timeout));
            }
        };

        let upload = Arc::new(AssetUpload::new(
            transfer_id,
            asset_id,
            asset_type,
            data,
            host.clone(),
            callback,
            Some(gate),
        ));
        self.inner.registry.register(TransferEntry::Upload(upload));
        *self.inner.pending_upload.lock().unwrap() = Some(transfer_id);
        debug!(%transfer_id, %asset_id, "announcing chunked upload");
        self.inner.sender.send(
            Message::AssetUploadRequest(AssetUploadRequest {
                transaction_id: transfer_id,
                asset_type: asset_type.code(),
                temp_file,
                store_local,
                data: Vec::new(),
            }),
            &host,
        );
        Ok(transfer_id)
    }

    /// Cancels an in-flight transfer, notifying the remote host.
    pub fn cancel(&self, transfer_id: TransferId) -> Result<(), TransferError> {
        let entry = self
            .inner
            .registry
            .lookup(transfer_id)
            .ok_or(TransferError::UnknownTransfer(transfer_id))?;
        info!(%transfer_id, "cancelling transfer");
        match entry {
            TransferEntry::Download(download) => {
                self.inner.sender.send(
                    Message::TransferAbort(TransferAbort {
                        transfer_id,
                        channel: download.channel.code(),
                    }),
                    &download.host,
                );
                self.conclude_download(&download, false, StatusCode::Abort);
                // Wake any packet parked on the header signal.
                download.signal_header();
            }
            TransferEntry::Xfer(xfer) => {
                self.inner.sender.send(
                    Message::AbortXfer(AbortXfer {
                        xfer_id: xfer.xfer_id,
                        result: StatusCode::Abort.code(),
                    }),
                    &xfer.host,
                );
                self.conclude_xfer(&xfer, false, StatusCode::Abort);
            }
            TransferEntry::Upload(upload) => {
                // Once the handshake has assigned an xfer id the host is
                // waiting on chunks and must be told to stop.
                if let Some(xfer_id) = upload.xfer_id() {
                    self.inner.sender.send(
                        Message::AbortXfer(AbortXfer {
                            xfer_id,
                            result: StatusCode::Abort.code(),
                        }),
                        &upload.host,
                    );
                }
                self.conclude_upload(&upload, false, "cancelled".into());
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    /// Routes one inbound message to its transfer.
    ///
    /// Messages for unknown transfers are logged and dropped; a terminated
    /// transfer's stragglers never resurrect it.
    pub fn handle_message(&self, message: Message) {
        match message {
            Message::TransferInfo(m) => self.handle_transfer_info(m),
            Message::TransferPacket(m) => self.handle_transfer_packet(m),
            Message::TransferAbort(m) => self.handle_transfer_abort(m),
            Message::SendXferPacket(m) => self.handle_send_xfer_packet(m),
            Message::ConfirmXferPacket(m) => self.handle_confirm_xfer_packet(m),
            Message::RequestXferUpload(m) => self.handle_request_xfer_upload(m),
            Message::AbortXfer(m) => self.handle_abort_xfer(m),
            Message::AssetUploadComplete(m) => self.handle_upload_complete(m),
            other => debug!(kind = other.kind(), "ignoring client-originated message"),
        }
    }

    fn handle_transfer_info(&self, msg: TransferInfo) {
        let Some(TransferEntry::Download(download)) =
            self.inner.registry.lookup(msg.transfer_id)
        else {
            debug!(transfer = %msg.transfer_id, "header for unknown transfer");
            return;
        };

        // The header params carry the definitive identity; an unknown
        // layout keeps the requested one.
        let identity = match params::decode(&msg.params) {
            Ok(p) => Some(p.asset()),
            Err(e) => {
                warn!(transfer = %msg.transfer_id, error = %e, "undecodable header params");
                None
            }
        };

        let status = StatusCode::from_code(msg.status);
        let outcome = download.apply_header(
            status,
            TargetType::from_code(msg.target),
            msg.size.max(0) as usize,
            identity,
        );
        download.signal_header();

        match outcome {
            HeaderOutcome::Ready { empty: false } => {}
            HeaderOutcome::Ready { empty: true } => {
                self.conclude_download(&download, true, StatusCode::Done);
            }
            HeaderOutcome::Failed(status) => {
                info!(transfer = %msg.transfer_id, ?status, "transfer refused by host");
                self.conclude_download(&download, false, status);
            }
            HeaderOutcome::AlreadyDone => {}
        }
    }

    fn handle_transfer_packet(&self, msg: TransferPacket) {
        let Some(TransferEntry::Download(download)) =
            self.inner.registry.lookup(msg.transfer_id)
        else {
            debug!(transfer = %msg.transfer_id, "packet for unknown transfer");
            return;
        };

        if download.header_known() {
            self.apply_download_packet(&download, msg.packet_num, &msg.data);
            return;
        }

        // Packet raced ahead of its header: park it until the header lands
        // or the wait expires.
        let manager = self.clone();
        let mut header_rx = download.subscribe_header();
        let wait = self.inner.config.header_timeout;
        tokio::spawn(async move {
            match timeout(wait, header_rx.wait_for(|ready| *ready)).await {
                Ok(Ok(_)) => {
                    manager.apply_download_packet(&download, msg.packet_num, &msg.data);
                }
                Ok(Err(_)) | Err(_) => {
                    warn!(
                        transfer = %download.transfer_id,
                        timeout = ?wait,
                        "no header for transfer, aborting"
                    );
                    manager.inner.sender.send(
                        Message::TransferAbort(TransferAbort {
                            transfer_id: download.transfer_id,
                            channel: download.channel.code(),
                        }),
                        &download.host,
                    );
                    manager.conclude_download(&download, false, StatusCode::Abort);
                }
            }
        });
    }

    fn apply_download_packet(&self, download: &AssetDownload, packet_num: u32, data: &[u8]) {
        match download.apply_packet(packet_num, data) {
            PacketOutcome::Appended { transferred, total } => {
                self.emit(TransferEvent::Progress {
                    transfer_id: download.transfer_id,
                    asset_id: download.asset_id(),
                    transferred,
                    total,
                });
            }
            PacketOutcome::Completed { .. } => {
                self.conclude_download(download, true, StatusCode::Done);
            }
            PacketOutcome::Buffered { pending } => {
                debug!(
                    transfer = %download.transfer_id,
                    packet = packet_num,
                    pending,
                    "buffered out-of-order packet"
                );
            }
            PacketOutcome::Duplicate => {
                debug!(transfer = %download.transfer_id, packet = packet_num, "duplicate packet");
            }
            PacketOutcome::Oversize | PacketOutcome::AlreadyDone => {}
        }
    }

    fn handle_transfer_abort(&self, msg: TransferAbort) {
        let Some(TransferEntry::Download(download)) =
            self.inner.registry.lookup(msg.transfer_id)
        else {
            debug!(transfer = %msg.transfer_id, "abort for unknown transfer");
            return;
        };
        warn!(transfer = %msg.transfer_id, "transfer aborted by host");
        self.conclude_download(&download, false, StatusCode::Abort);
        download.signal_header();
    }

    fn handle_send_xfer_packet(&self, msg: SendXferPacket) {
        let Some(TransferEntry::Xfer(xfer)) = self.inner.registry.lookup_by_xfer(msg.xfer_id)
        else {
            debug!(xfer = %msg.xfer_id, "data packet for unknown xfer");
            return;
        };

        let (number, is_final) = packet::decode(msg.packet);
        match xfer.apply_packet(number, is_final, &msg.data) {
            XferOutcome::Accepted { finished } => {
                self.confirm(&xfer, number);
                self.emit(TransferEvent::Progress {
                    transfer_id: xfer.transfer_id,
                    asset_id: AssetId::default(),
                    transferred: xfer.transferred(),
                    total: xfer.declared_size().unwrap_or(0) as usize,
                });
                if finished {
                    self.conclude_xfer(&xfer, true, StatusCode::Done);
                }
            }
            // The sender missed our confirm; re-confirm, data already held.
            XferOutcome::Retransmit { packet } => self.confirm(&xfer, packet),
            XferOutcome::OutOfSequence { last_accepted } => {
                if let Some(last) = last_accepted {
                    self.confirm(&xfer, last);
                }
            }
            XferOutcome::Malformed => {
                self.inner.sender.send(
                    Message::AbortXfer(AbortXfer {
                        xfer_id: xfer.xfer_id,
                        result: StatusCode::Error.code(),
                    }),
                    &xfer.host,
                );
                self.conclude_xfer(&xfer, false, StatusCode::Error);
            }
            XferOutcome::AlreadyDone => {}
        }
    }

    fn confirm(&self, xfer: &XferDownload, number: u32) {
        self.inner.sender.send(
            Message::ConfirmXferPacket(ConfirmXferPacket {
                xfer_id: xfer.xfer_id,
                packet: number,
            }),
            &xfer.host,
        );
    }

    fn handle_confirm_xfer_packet(&self, msg: ConfirmXferPacket) {
        let Some(TransferEntry::Upload(upload)) = self.inner.registry.lookup_by_xfer(msg.xfer_id)
        else {
            debug!(xfer = %msg.xfer_id, "confirm for unknown xfer");
            return;
        };

        if let Some((field, body)) = upload.next_chunk(self.inner.config.chunk_size) {
            self.inner.sender.send(
                Message::SendXferPacket(SendXferPacket {
                    xfer_id: msg.xfer_id,
                    packet: field,
                    data: body,
                }),
                &upload.host,
            );
            self.emit(TransferEvent::Progress {
                transfer_id: upload.transfer_id,
                asset_id: upload.asset_id,
                transferred: upload.sent_bytes(),
                total: upload.total_bytes(),
            });
        }
        // All chunks confirmed: the host announces the result with an
        // upload-complete message, nothing to do here.
    }

    fn handle_request_xfer_upload(&self, msg: RequestXferUpload) {
        let pending = self.inner.pending_upload.lock().unwrap().take();
        let Some(transfer_id) = pending else {
            warn!(xfer = %msg.xfer_id, "unsolicited upload handshake");
            return;
        };
        let Some(TransferEntry::Upload(upload)) = self.inner.registry.lookup(transfer_id) else {
            warn!(%transfer_id, "pending upload no longer registered");
            return;
        };
        if !upload.set_xfer_id(msg.xfer_id) {
            warn!(xfer = %msg.xfer_id, %transfer_id, "duplicate upload handshake");
            return;
        }
        self.inner.registry.map_xfer(msg.xfer_id, transfer_id);
        upload.release_gate();
        debug!(xfer = %msg.xfer_id, %transfer_id, "upload handshake complete");

        if let Some((field, body)) = upload.next_chunk(self.inner.config.chunk_size) {
            self.inner.sender.send(
                Message::SendXferPacket(SendXferPacket {
                    xfer_id: msg.xfer_id,
                    packet: field,
                    data: body,
                }),
                &upload.host,
            );
        }
    }

    fn handle_abort_xfer(&self, msg: AbortXfer) {
        let Some(entry) = self.inner.registry.lookup_by_xfer(msg.xfer_id) else {
            debug!(xfer = %msg.xfer_id, "abort for unknown xfer");
            return;
        };
        warn!(xfer = %msg.xfer_id, result = msg.result, "xfer aborted by host");
        match entry {
            TransferEntry::Xfer(xfer) => {
                self.conclude_xfer(&xfer, false, StatusCode::from_code(msg.result));
            }
            TransferEntry::Upload(upload) => {
                self.conclude_upload(
                    &upload,
                    false,
                    format!("xfer aborted by host (code {})", msg.result),
                );
            }
            TransferEntry::Download(_) => {
                debug!(xfer = %msg.xfer_id, "abort-xfer resolved to a channel download");
            }
        }
    }

    /// Upload completion is correlated by asset id, not transfer id.
    fn handle_upload_complete(&self, msg: AssetUploadComplete) {
        let Some(upload) = self.inner.registry.lookup_upload_by_asset(msg.asset_id) else {
            debug!(asset = %msg.asset_id, "completion for unknown upload");
            return;
        };
        let message = if msg.success {
            "complete".to_string()
        } else {
            "upload rejected by host".to_string()
        };
        self.conclude_upload(&upload, msg.success, message);
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    fn conclude_download(&self, download: &AssetDownload, success: bool, status: StatusCode) {
        self.inner.registry.remove(download.transfer_id);
        if let Some((receipt, data, callback)) = download.finalize(success, status) {
            if success {
                self.emit(TransferEvent::Completed {
                    transfer_id: receipt.transfer_id,
                    asset_id: receipt.asset_id,
                    asset_type: receipt.asset_type,
                    size: data.as_ref().map_or(0, Vec::len),
                });
            } else {
                self.emit(TransferEvent::Failed {
                    transfer_id: receipt.transfer_id,
                    status,
                });
            }
            callback(receipt, data);
        }
    }

    fn conclude_xfer(&self, xfer: &XferDownload, success: bool, status: StatusCode) {
        self.inner.registry.remove(xfer.transfer_id);
        if let Some((receipt, data, callback)) = xfer.finalize(success, status) {
            if success {
                self.emit(TransferEvent::Completed {
                    transfer_id: receipt.transfer_id,
                    asset_id: receipt.asset_id,
                    asset_type: receipt.asset_type,
                    size: data.as_ref().map_or(0, Vec::len),
                });
            } else {
                self.emit(TransferEvent::Failed {
                    transfer_id: receipt.transfer_id,
                    status,
                });
            }
            callback(receipt, data);
        }
    }

    fn conclude_upload(&self, upload: &AssetUpload, success: bool, message: String) {
        self.inner.registry.remove(upload.transfer_id);
        {
            let mut pending = self.inner.pending_upload.lock().unwrap();
            if *pending == Some(upload.transfer_id) {
                *pending = None;
            }
        }
        if let Some(callback) = upload.finalize(success) {
            self.emit(TransferEvent::UploadCompleted {
                transfer_id: upload.transfer_id,
                asset_id: upload.asset_id,
                success,
            });
            callback(success, message, upload.asset_id);
        }
    }

    fn emit(&self, event: TransferEvent) {
        if self.inner.events_tx.try_send(event).is_err() {
            debug!("event channel full or closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use gridlink_types::AssetReceipt;

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

    fn manager_with(config: TransferConfig) -> (TransferManager, Arc<MockSender>) {
        let sender = MockSender::new();
        let manager = TransferManager::new(config, Arc::clone(&sender) as Arc<dyn MessageSender>);
        (manager, sender)
    }

    type DownloadSlot = Arc<Mutex<Option<(AssetReceipt, Option<Vec<u8>>)>>>;

    fn download_slot() -> (DownloadSlot, DownloadCallback) {
        let slot: DownloadSlot = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let callback = Box::new(move |receipt, data| {
            *inner.lock().unwrap() = Some((receipt, data));
        });
        (slot, callback)
    }

    type UploadSlot = Arc<Mutex<Option<(bool, String, AssetId)>>>;

    fn upload_slot() -> (UploadSlot, UploadCallback) {
        let slot: UploadSlot = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let callback = Box::new(move |success, message, asset_id| {
            *inner.lock().unwrap() = Some((success, message, asset_id));
        });
        (slot, callback)
    }

    fn header_for(transfer_id: TransferId, asset_id: AssetId, size: i32) -> Message {
        Message::TransferInfo(TransferInfo {
            transfer_id,
            channel: ChannelType::Asset.code(),
            target: 2,
            status: StatusCode::Ok.code(),
            size,
            params: params::AssetParams {
                asset_id,
                asset_type: AssetType::Texture,
            }
            .encode(),
        })
    }

    fn data_packet(transfer_id: TransferId, packet_num: u32, data: Vec<u8>) -> Message {
        Message::TransferPacket(TransferPacket {
            transfer_id,
            channel: ChannelType::Asset.code(),
            packet_num,
            status: StatusCode::Ok.code(),
            data,
        })
    }

    // -------------------------------------------------------------------
    // Channel downloads
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn download_reassembles_out_of_order_packets() {
        let (manager, sender) = manager_with(TransferConfig::default());
        let (slot, callback) = download_slot();
        let asset_id = AssetId::random();

        let transfer_id = manager.request_asset(
            asset_id,
            AssetType::Texture,
            Priority::default(),
            test_host(),
            callback,
        );

        let sent = sender.sent();
        assert!(
            matches!(&sent[0], Message::TransferRequest(r) if r.transfer_id == transfer_id),
            "expected a transfer request, got {:?}",
            sent[0]
        );

        manager.handle_message(header_for(transfer_id, asset_id, 2000));
        // Second packet arrives first.
        manager.handle_message(data_packet(transfer_id, 1, vec![2u8; 1000]));
        manager.handle_message(data_packet(transfer_id, 0, vec![1u8; 1000]));

        let (receipt, data) = slot.lock().unwrap().take().expect("callback fired");
        assert!(receipt.success);
        assert_eq!(receipt.asset_id, asset_id);
        let data = data.unwrap();
        assert_eq!(data.len(), 2000);
        assert!(data[..1000].iter().all(|&b| b == 1));
        assert!(data[1000..].iter().all(|&b| b == 2));
        assert_eq!(manager.active_transfers(), 0);
    }

    #[tokio::test]
    async fn early_packet_waits_for_header() {
        let (manager, _sender) = manager_with(TransferConfig::default());
        let (slot, callback) = download_slot();
        let asset_id = AssetId::random();

        let transfer_id = manager.request_asset(
            asset_id,
            AssetType::Texture,
            Priority::default(),
            test_host(),
            callback,
        );

        // Data before header: the packet parks on the header signal.
        manager.handle_message(data_packet(transfer_id, 0, vec![7u8; 100]));
        manager.handle_message(header_for(transfer_id, asset_id, 100));

        for _ in 0..20 {
            tokio::task::yield_now().await;
            if slot.lock().unwrap().is_some() {
                break;
            }
        }

        let (receipt, data) = slot.lock().unwrap().take().expect("callback fired");
        assert!(receipt.success);
        assert_eq!(data.unwrap(), vec![7u8; 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn header_timeout_aborts_download() {
        let config = TransferConfig {
            header_timeout: Duration::from_millis(50),
            ..TransferConfig::default()
        };
        let (manager, sender) = manager_with(config);
        let (slot, callback) = download_slot();

        let transfer_id = manager.request_asset(
            AssetId::random(),
            AssetType::Texture,
            Priority::default(),
            test_host(),
            callback,
        );
        manager.handle_message(data_packet(transfer_id, 0, vec![0u8; 100]));

        tokio::time::sleep(Duration::from_millis(100)).await;

        let (receipt, data) = slot.lock().unwrap().take().expect("callback fired");
        assert!(!receipt.success);
        assert_eq!(receipt.status, StatusCode::Abort);
        assert!(data.is_none());
        assert!(
            sender
                .sent()
                .iter()
                .any(|m| matches!(m, Message::TransferAbort(a) if a.transfer_id == transfer_id)),
            "abort must be sent on header timeout"
        );
        assert_eq!(manager.active_transfers(), 0);
    }

    #[tokio::test]
    async fn refused_header_fails_download() {
        let (manager, _sender) = manager_with(TransferConfig::default());
        let (slot, callback) = download_slot();
        let asset_id = AssetId::random();

        let transfer_id = manager.request_asset(
            asset_id,
            AssetType::Texture,
            Priority::default(),
            test_host(),
            callback,
        );
        manager.handle_message(Message::TransferInfo(TransferInfo {
            transfer_id,
            channel: ChannelType::Asset.code(),
            target: 0,
            status: StatusCode::UnknownSource.code(),
            size: 0,
            params: Vec::new(),
        }));

        let (receipt, data) = slot.lock().unwrap().take().expect("callback fired");
        assert!(!receipt.success);
        assert_eq!(receipt.status, StatusCode::UnknownSource);
        assert!(data.is_none());
        assert_eq!(manager.active_transfers(), 0);
    }

    #[tokio::test]
    async fn zero_size_download_completes_on_header() {
        let (manager, _sender) = manager_with(TransferConfig::default());
        let (slot, callback) = download_slot();
        let asset_id = AssetId::random();

        let transfer_id = manager.request_asset(
            asset_id,
            AssetType::Texture,
            Priority::default(),
            test_host(),
            callback,
        );
        manager.handle_message(header_for(transfer_id, asset_id, 0));

        let (receipt, data) = slot.lock().unwrap().take().expect("callback fired");
        assert!(receipt.success);
        assert_eq!(data.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn cancel_download_sends_abort() {
        let (manager, sender) = manager_with(TransferConfig::default());
        let (slot, callback) = download_slot();

        let transfer_id = manager.request_asset(
            AssetId::random(),
            AssetType::Sound,
            Priority::default(),
            test_host(),
            callback,
        );
        manager.cancel(transfer_id).unwrap();

        assert!(
            sender
                .sent()
                .iter()
                .any(|m| matches!(m, Message::TransferAbort(a) if a.transfer_id == transfer_id))
        );
        let (receipt, _) = slot.lock().unwrap().take().expect("callback fired");
        assert!(!receipt.success);
        assert!(matches!(
            manager.cancel(transfer_id),
            Err(TransferError::UnknownTransfer(_))
        ));
    }

    #[tokio::test]
    async fn packet_for_unknown_transfer_is_ignored() {
        let (manager, sender) = manager_with(TransferConfig::default());
        manager.handle_message(data_packet(TransferId::random(), 0, vec![1, 2, 3]));
        assert!(sender.sent().is_empty());
        assert_eq!(manager.active_transfers(), 0);
    }

    // -------------------------------------------------------------------
    // Xfer downloads
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn xfer_download_confirms_every_packet() {
        let (manager, sender) = manager_with(TransferConfig::default());
        let (slot, callback) = download_slot();

        let xfer_id = manager.request_file("terrain.raw".into(), false, test_host(), callback);

        let sent = sender.sent();
        assert!(
            matches!(&sent[0], Message::RequestXfer(r) if r.xfer_id == xfer_id && r.filename == "terrain.raw")
        );

        manager.handle_message(Message::SendXferPacket(SendXferPacket {
            xfer_id,
            packet: packet::encode(0, false),
            data: packet::prepend_size(1500, &[1u8; 1000]),
        }));
        manager.handle_message(Message::SendXferPacket(SendXferPacket {
            xfer_id,
            packet: packet::encode(1, true),
            data: vec![2u8; 500],
        }));

        let confirms: Vec<u32> = sender
            .sent()
            .iter()
            .filter_map(|m| match m {
                Message::ConfirmXferPacket(c) if c.xfer_id == xfer_id => Some(c.packet),
                _ => None,
            })
            .collect();
        assert_eq!(confirms, vec![0, 1]);

        let (receipt, data) = slot.lock().unwrap().take().expect("callback fired");
        assert!(receipt.success);
        assert_eq!(data.unwrap().len(), 1500);
        assert_eq!(manager.active_transfers(), 0);
    }

    #[tokio::test]
    async fn xfer_retransmit_reconfirms_without_duplication() {
        let (manager, sender) = manager_with(TransferConfig::default());
        let (slot, callback) = download_slot();

        let xfer_id = manager.request_file("mute.dat".into(), false, test_host(), callback);
        let first = packet::prepend_size(2000, &[1u8; 1000]);

        manager.handle_message(Message::SendXferPacket(SendXferPacket {
            xfer_id,
            packet: packet::encode(0, false),
            data: first.clone(),
        }));
        // Lost confirm: the host resends packet 0.
        manager.handle_message(Message::SendXferPacket(SendXferPacket {
            xfer_id,
            packet: packet::encode(0, false),
            data: first,
        }));
        manager.handle_message(Message::SendXferPacket(SendXferPacket {
            xfer_id,
            packet: packet::encode(1, true),
            data: vec![2u8; 1000],
        }));

        let confirms: Vec<u32> = sender
            .sent()
            .iter()
            .filter_map(|m| match m {
                Message::ConfirmXferPacket(c) => Some(c.packet),
                _ => None,
            })
            .collect();
        assert_eq!(confirms, vec![0, 0, 1]);

        let (_, data) = slot.lock().unwrap().take().expect("callback fired");
        assert_eq!(
            data.unwrap().len(),
            2000,
            "retransmit must not duplicate data"
        );
    }

    #[tokio::test]
    async fn inbound_abort_fails_xfer() {
        let (manager, _sender) = manager_with(TransferConfig::default());
        let (slot, callback) = download_slot();

        let xfer_id = manager.request_file("terrain.raw".into(), false, test_host(), callback);
        manager.handle_message(Message::AbortXfer(AbortXfer {
            xfer_id,
            result: StatusCode::Error.code(),
        }));

        let (receipt, data) = slot.lock().unwrap().take().expect("callback fired");
        assert!(!receipt.success);
        assert!(data.is_none());
        assert_eq!(manager.active_transfers(), 0);
    }

    // -------------------------------------------------------------------
    // Uploads
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn chunked_upload_handshake_and_confirm_loop() {
        let (manager, sender) = manager_with(TransferConfig::default());
        let (slot, callback) = upload_slot();
        let asset_id = AssetId::random();
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();

        manager
            .upload_asset(
                asset_id,
                AssetType::Animation,
                data.clone(),
                false,
                false,
                test_host(),
                callback,
            )
            .await
            .unwrap();

        // Announce goes out without the payload.
        let sent = sender.sent();
        assert!(
            matches!(&sent[0], Message::AssetUploadRequest(r) if r.data.is_empty()),
            "chunked upload announce must carry no data"
        );

        let xfer_id = XferId(77);
        manager.handle_message(Message::RequestXferUpload(RequestXferUpload {
            xfer_id,
            filename: String::new(),
        }));
        manager.handle_message(Message::ConfirmXferPacket(ConfirmXferPacket {
            xfer_id,
            packet: 0,
        }));
        manager.handle_message(Message::ConfirmXferPacket(ConfirmXferPacket {
            xfer_id,
            packet: 1,
        }));
        manager.handle_message(Message::ConfirmXferPacket(ConfirmXferPacket {
            xfer_id,
            packet: 2,
        }));

        let packets: Vec<(u32, bool, Vec<u8>)> = sender
            .sent()
            .iter()
            .filter_map(|m| match m {
                Message::SendXferPacket(p) => {
                    let (num, fin) = packet::decode(p.packet);
                    Some((num, fin, p.data.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(packets.len(), 3);
        assert_eq!((packets[0].0, packets[0].1), (0, false));
        let (size, payload) = packet::split_size_prefix(&packets[0].2).unwrap();
        assert_eq!(size, 3000);
        assert_eq!(payload, &data[..1000]);
        assert_eq!((packets[1].0, packets[1].1), (1, false));
        assert_eq!((packets[2].0, packets[2].1), (2, true));
        assert_eq!(packets[2].2, &data[2000..]);

        // Completion is keyed by asset id.
        manager.handle_message(Message::AssetUploadComplete(AssetUploadComplete {
            asset_id,
            asset_type: AssetType::Animation.code(),
            success: true,
        }));

        let (success, _message, completed_id) =
            slot.lock().unwrap().take().expect("callback fired");
        assert!(success);
        assert_eq!(completed_id, asset_id);
        assert_eq!(manager.active_transfers(), 0);
    }

    #[tokio::test]
    async fn cancelling_chunked_upload_aborts_xfer() {
        let (manager, sender) = manager_with(TransferConfig::default());
        let (slot, callback) = upload_slot();

        let transfer_id = manager
            .upload_asset(
                AssetId::random(),
                AssetType::Animation,
                vec![0u8; 3000],
                false,
                false,
                test_host(),
                callback,
            )
            .await
            .unwrap();

        let xfer_id = XferId(9);
        manager.handle_message(Message::RequestXferUpload(RequestXferUpload {
            xfer_id,
            filename: String::new(),
        }));

        manager.cancel(transfer_id).unwrap();

        // The host assigned an xfer id, so it gets told to stop.
        assert!(
            sender
                .sent()
                .iter()
                .any(|m| matches!(m, Message::AbortXfer(a) if a.xfer_id == xfer_id)),
            "cancel must abort the xfer on the wire"
        );
        let (success, message, _) = slot.lock().unwrap().take().expect("callback fired");
        assert!(!success);
        assert_eq!(message, "cancelled");
        assert_eq!(manager.active_transfers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_upload_waits_then_fails_busy() {
        let config = TransferConfig {
            confirm_timeout: Duration::from_millis(50),
            ..TransferConfig::default()
        };
        let (manager, _sender) = manager_with(config);
        let (_slot_a, cb_a) = upload_slot();
        let (_slot_b, cb_b) = upload_slot();

        manager
            .upload_asset(
                AssetId::random(),
                AssetType::Animation,
                vec![0u8; 3000],
                false,
                false,
                test_host(),
                cb_a,
            )
            .await
            .unwrap();

        // First handshake still pending: the second upload times out on
        // the gate.
        let err = manager
            .upload_asset(
                AssetId::random(),
                AssetType::Animation,
                vec![0u8; 3000],
                false,
                false,
                test_host(),
                cb_b,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::UploadBusy(_)));

        // Handshake lands, gate frees, the next upload gets through.
        manager.handle_message(Message::RequestXferUpload(RequestXferUpload {
            xfer_id: XferId(5),
            filename: String::new(),
        }));
        let (_slot_c, cb_c) = upload_slot();
        assert!(
            manager
                .upload_asset(
                    AssetId::random(),
                    AssetType::Animation,
                    vec![0u8; 3000],
                    false,
                    false,
                    test_host(),
                    cb_c,
                )
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn inline_upload_skips_handshake() {
        let (manager, sender) = manager_with(TransferConfig::default());
        let (slot, callback) = upload_slot();
        let asset_id = AssetId::random();

        manager
            .upload_asset(
                asset_id,
                AssetType::Gesture,
                vec![3u8; 200],
                false,
                false,
                test_host(),
                callback,
            )
            .await
            .unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Message::AssetUploadRequest(r) if r.data.len() == 200));

        manager.handle_message(Message::AssetUploadComplete(AssetUploadComplete {
            asset_id,
            asset_type: AssetType::Gesture.code(),
            success: true,
        }));
        let (success, _, _) = slot.lock().unwrap().take().expect("callback fired");
        assert!(success);
    }

    #[tokio::test]
    async fn unsolicited_handshake_is_ignored() {
        let (manager, sender) = manager_with(TransferConfig::default());
        manager.handle_message(Message::RequestXferUpload(RequestXferUpload {
            xfer_id: XferId(9),
            filename: String::new(),
        }));
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_upload_reports_failure() {
        let (manager, _sender) = manager_with(TransferConfig::default());
        let (slot, callback) = upload_slot();
        let asset_id = AssetId::random();

        manager
            .upload_asset(
                asset_id,
                AssetType::Notecard,
                vec![1u8; 10],
                false,
                false,
                test_host(),
                callback,
            )
            .await
            .unwrap();
        manager.handle_message(Message::AssetUploadComplete(AssetUploadComplete {
            asset_id,
            asset_type: AssetType::Notecard.code(),
            success: false,
        }));

        let (success, message, _) = slot.lock().unwrap().take().expect("callback fired");
        assert!(!success);
        assert!(!message.is_empty());
    }

    // -------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn events_report_progress_and_completion() {
        let (manager, _sender) = manager_with(TransferConfig::default());
        let mut events = manager.take_events().expect("first take succeeds");
        assert!(manager.take_events().is_none(), "take_events is one-shot");

        let (_slot, callback) = download_slot();
        let asset_id = AssetId::random();
        let transfer_id = manager.request_asset(
            asset_id,
            AssetType::Texture,
            Priority::default(),
            test_host(),
            callback,
        );
        manager.handle_message(header_for(transfer_id, asset_id, 2000));
        manager.handle_message(data_packet(transfer_id, 0, vec![1u8; 1000]));
        manager.handle_message(data_packet(transfer_id, 1, vec![2u8; 1000]));

        assert_eq!(
            events.try_recv().unwrap(),
            TransferEvent::Progress {
                transfer_id,
                asset_id,
                transferred: 1000,
                total: 2000,
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            TransferEvent::Completed {
                transfer_id,
                asset_id,
                asset_type: AssetType::Texture,
                size: 2000,
            }
        );
    }
}
