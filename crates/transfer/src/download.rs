//! Channel-mode download state machine.
//!
//! Lifecycle: `AwaitingHeader → Receiving → Complete | Aborted`. The header
//! packet declares the size and status; data packets may arrive in any
//! order and are resequenced through an out-of-order buffer keyed by packet
//! sequence number.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::watch;
use tracing::warn;

use gridlink_types::{
    AssetId, AssetReceipt, AssetType, ChannelType, SimHost, SourceType, StatusCode, TargetType,
    TransferId,
};

use crate::DownloadCallback;

/// What applying a header packet produced.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HeaderOutcome {
    /// Status OK; data packets may now be applied. `empty` flags a
    /// zero-size transfer that is already complete.
    Ready { empty: bool },
    /// Non-OK status; no payload will ever arrive.
    Failed(StatusCode),
    AlreadyDone,
}

/// What applying a data packet produced.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PacketOutcome {
    /// In-sequence data appended (possibly draining buffered packets).
    Appended { transferred: usize, total: usize },
    /// Appended and the transfer is now complete.
    Completed { transferred: usize, total: usize },
    /// Out-of-sequence packet parked in the resequencing buffer.
    Buffered { pending: usize },
    /// Sequence number below the expected counter; dropped.
    Duplicate,
    /// Data longer than the declared remainder; dropped.
    Oversize,
    AlreadyDone,
}

/// One in-flight channel-mode download.
pub struct AssetDownload {
    pub transfer_id: TransferId,
    pub channel: ChannelType,
    pub source: SourceType,
    pub host: SimHost,
    state: Mutex<State>,
    header_tx: watch::Sender<bool>,
}

struct State {
    asset_id: AssetId,
    asset_type: AssetType,
    target: TargetType,
    status: StatusCode,
    header_received: bool,
    size: usize,
    buffer: Vec<u8>,
    next_packet: u32,
    out_of_order: HashMap<u32, Vec<u8>>,
    last_packet_at: Instant,
    done: bool,
    callback: Option<DownloadCallback>,
}

impl AssetDownload {
    pub fn new(
        transfer_id: TransferId,
        asset_id: AssetId,
        asset_type: AssetType,
        source: SourceType,
        host: SimHost,
        callback: DownloadCallback,
    ) -> Self {
        let (header_tx, _) = watch::channel(false);
        Self {
            transfer_id,
            channel: ChannelType::Asset,
            source,
            host,
            state: Mutex::new(State {
                asset_id,
                asset_type,
                target: TargetType::Unknown,
                status: StatusCode::Ok,
                header_received: false,
                size: 0,
                buffer: Vec::new(),
                next_packet: 0,
                out_of_order: HashMap::new(),
                last_packet_at: Instant::now(),
                done: false,
                callback: Some(callback),
            }),
            header_tx,
        }
    }

    /// A receiver that flips to `true` once the header has been applied.
    pub(crate) fn subscribe_header(&self) -> watch::Receiver<bool> {
        self.header_tx.subscribe()
    }

    pub(crate) fn signal_header(&self) {
        let _ = self.header_tx.send(true);
    }

    pub(crate) fn header_known(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.header_received || s.done
    }

    /// Applies the header: status, target, declared size and — when the
    /// params blob decoded — the definitive asset identity.
    pub(crate) fn apply_header(
        &self,
        status: StatusCode,
        target: TargetType,
        size: usize,
        identity: Option<(AssetId, AssetType)>,
    ) -> HeaderOutcome {
        let mut s = self.state.lock().unwrap();
        if s.done || s.header_received {
            return HeaderOutcome::AlreadyDone;
        }
        s.status = status;
        s.target = target;
        s.header_received = true;
        s.last_packet_at = Instant::now();
        if let Some((asset_id, asset_type)) = identity {
            s.asset_id = asset_id;
            s.asset_type = asset_type;
        }
        if !status.is_ok() {
            return HeaderOutcome::Failed(status);
        }
        s.size = size;
        s.buffer = Vec::with_capacity(size);
        HeaderOutcome::Ready { empty: size == 0 }
    }

    /// Applies one data packet, resequencing through the out-of-order map.
    pub(crate) fn apply_packet(&self, packet_num: u32, data: &[u8]) -> PacketOutcome {
        let mut s = self.state.lock().unwrap();
        if s.done {
            return PacketOutcome::AlreadyDone;
        }
        s.last_packet_at = Instant::now();

        if packet_num < s.next_packet {
            return PacketOutcome::Duplicate;
        }
        if packet_num > s.next_packet {
            let pending = &mut s.out_of_order;
            if pending.insert(packet_num, data.to_vec()).is_some() {
                warn!(
                    transfer = %self.transfer_id,
                    packet = packet_num,
                    "duplicate out-of-order packet, overwriting"
                );
            }
            return PacketOutcome::Buffered {
                pending: s.out_of_order.len(),
            };
        }

        // In sequence: append, then drain whatever became contiguous.
        if s.buffer.len() + data.len() > s.size {
            warn!(
                transfer = %self.transfer_id,
                packet = packet_num,
                have = s.buffer.len(),
                extra = data.len(),
                declared = s.size,
                "packet exceeds declared size, dropping"
            );
            return PacketOutcome::Oversize;
        }
        s.buffer.extend_from_slice(data);
        s.next_packet += 1;
        loop {
            let next = s.next_packet;
            let Some(chunk) = s.out_of_order.remove(&next) else {
                break;
            };
            if s.buffer.len() + chunk.len() > s.size {
                warn!(
                    transfer = %self.transfer_id,
                    packet = next,
                    "buffered packet exceeds declared size, dropping"
                );
                s.next_packet += 1;
                continue;
            }
            s.buffer.extend_from_slice(&chunk);
            s.next_packet += 1;
        }

        let transferred = s.buffer.len();
        let total = s.size;
        if transferred >= total {
            PacketOutcome::Completed { transferred, total }
        } else {
            PacketOutcome::Appended { transferred, total }
        }
    }

    /// Marks the transfer terminal and hands back the callback.
    ///
    /// Returns `None` if already finalized; the callback therefore fires at
    /// most once.
    pub(crate) fn finalize(
        &self,
        success: bool,
        status: StatusCode,
    ) -> Option<(AssetReceipt, Option<Vec<u8>>, DownloadCallback)> {
        let mut s = self.state.lock().unwrap();
        if s.done {
            return None;
        }
        s.done = true;
        s.status = status;
        let callback = s.callback.take()?;
        let receipt = if success {
            AssetReceipt::success(self.transfer_id, s.asset_id, s.asset_type)
        } else {
            AssetReceipt::failure(self.transfer_id, s.asset_id, s.asset_type, status)
        };
        let data = success.then(|| std::mem::take(&mut s.buffer));
        Some((receipt, data, callback))
    }

    /// Best known asset identity (requested, or definitive once the header
    /// params have been decoded).
    pub fn asset_id(&self) -> AssetId {
        self.state.lock().unwrap().asset_id
    }

    pub fn transferred(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap().size
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// Time since the last header/data packet, for staleness checks.
    pub fn idle_time(&self) -> std::time::Duration {
        self.state.lock().unwrap().last_packet_at.elapsed()
    }
}
