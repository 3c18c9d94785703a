//! Legacy Xfer download state machine.
//!
//! Unlike the channel path, Xfer delivery is strictly sequential: every
//! packet is confirmed, and anything out of sequence is discarded after
//! re-confirming the last accepted packet so the sender can resume. Packet 0
//! carries a 4-byte little-endian size prefix ahead of its payload.

use std::sync::Mutex;

use tracing::warn;

use gridlink_protocol::packet;
use gridlink_types::{AssetId, AssetReceipt, AssetType, SimHost, StatusCode, TransferId, XferId};

use crate::DownloadCallback;

/// What applying an Xfer packet produced.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum XferOutcome {
    /// In-sequence packet appended; confirm it. `finished` is set by the
    /// final-flagged packet.
    Accepted { finished: bool },
    /// Exactly one behind the expected number: the sender missed our
    /// confirm. Re-confirm, discard the data.
    Retransmit { packet: u32 },
    /// Any other gap. Re-confirm the last accepted packet (if any) and
    /// discard.
    OutOfSequence { last_accepted: Option<u32> },
    /// Packet 0 too short to carry its size prefix.
    Malformed,
    AlreadyDone,
}

/// What the Xfer was requested by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XferSource {
    Filename(String),
    VFile { asset_id: AssetId, asset_type: AssetType },
}

/// One in-flight legacy Xfer download.
pub struct XferDownload {
    pub transfer_id: TransferId,
    pub xfer_id: XferId,
    pub source: XferSource,
    pub host: SimHost,
    pub delete_on_completion: bool,
    state: Mutex<State>,
}

struct State {
    declared_size: Option<u32>,
    buffer: Vec<u8>,
    next_packet: u32,
    done: bool,
    callback: Option<DownloadCallback>,
}

impl XferDownload {
    /// Download of a named server-side file (terrain, mutelists, ...).
    pub fn by_filename(
        xfer_id: XferId,
        filename: String,
        host: SimHost,
        callback: DownloadCallback,
    ) -> Self {
        Self::new(xfer_id, XferSource::Filename(filename), host, callback)
    }

    /// Download of a typed content blob by id.
    pub fn by_asset(
        xfer_id: XferId,
        asset_id: AssetId,
        asset_type: AssetType,
        host: SimHost,
        callback: DownloadCallback,
    ) -> Self {
        Self::new(
            xfer_id,
            XferSource::VFile {
                asset_id,
                asset_type,
            },
            host,
            callback,
        )
    }

    fn new(xfer_id: XferId, source: XferSource, host: SimHost, callback: DownloadCallback) -> Self {
        Self {
            transfer_id: TransferId::random(),
            xfer_id,
            source,
            host,
            delete_on_completion: false,
            state: Mutex::new(State {
                declared_size: None,
                buffer: Vec::new(),
                next_packet: 0,
                done: false,
                callback: Some(callback),
            }),
        }
    }

    /// Applies one inbound packet. Never completes the transfer itself;
    /// callers act on the outcome (confirm, re-confirm, finalize).
    pub(crate) fn apply_packet(&self, packet_num: u32, is_final: bool, data: &[u8]) -> XferOutcome {
        let mut s = self.state.lock().unwrap();
        if s.done {
            return XferOutcome::AlreadyDone;
        }

        if packet_num != s.next_packet {
            // One behind means our confirm was lost in flight.
            if s.next_packet > 0 && packet_num == s.next_packet - 1 {
                return XferOutcome::Retransmit { packet: packet_num };
            }
            warn!(
                xfer = %self.xfer_id,
                got = packet_num,
                expected = s.next_packet,
                "out-of-sequence xfer packet, discarding"
            );
            return XferOutcome::OutOfSequence {
                last_accepted: s.next_packet.checked_sub(1),
            };
        }

        let payload = if packet_num == 0 {
            match packet::split_size_prefix(data) {
                Ok((size, payload)) => {
                    s.declared_size = Some(size);
                    s.buffer.reserve(size as usize);
                    payload
                }
                Err(_) => {
                    warn!(xfer = %self.xfer_id, "first xfer packet missing size prefix");
                    return XferOutcome::Malformed;
                }
            }
        } else {
            data
        };

        s.buffer.extend_from_slice(payload);
        s.next_packet += 1;
        XferOutcome::Accepted { finished: is_final }
    }

    /// Marks the transfer terminal and hands back the callback, at most once.
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
        let callback = s.callback.take()?;

        if let Some(declared) = s.declared_size {
            if success && s.buffer.len() as u64 != declared as u64 {
                warn!(
                    xfer = %self.xfer_id,
                    declared,
                    received = s.buffer.len(),
                    "xfer size mismatch"
                );
            }
        }

        let (asset_id, asset_type) = match &self.source {
            XferSource::VFile {
                asset_id,
                asset_type,
            } => (*asset_id, *asset_type),
            XferSource::Filename(_) => (AssetId::default(), AssetType::Unknown),
        };
        let receipt = if success {
            AssetReceipt::success(self.transfer_id, asset_id, asset_type)
        } else {
            AssetReceipt::failure(self.transfer_id, asset_id, asset_type, status)
        };
        let data = success.then(|| std::mem::take(&mut s.buffer));
        Some((receipt, data, callback))
    }

    pub fn transferred(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }

    pub fn declared_size(&self) -> Option<u32> {
        self.state.lock().unwrap().declared_size
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }
}
