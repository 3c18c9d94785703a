//! Chunked asset upload over the legacy Xfer path.
//!
//! The client announces the upload, waits for the sim to answer with its
//! assigned Xfer id, then drip-feeds chunks: one packet per confirm. The
//! sim-wide handshake gate (one pending announce at a time) is held as an
//! owned mutex guard and dropped the moment the handshake lands.

use std::sync::{Mutex, OnceLock};

use tokio::sync::OwnedMutexGuard;

use gridlink_protocol::packet;
use gridlink_types::{AssetId, AssetType, SimHost, TransferId, XferId};

use crate::UploadCallback;

/// One in-flight asset upload.
pub struct AssetUpload {
    pub transfer_id: TransferId,
    pub asset_id: AssetId,
    pub asset_type: AssetType,
    pub host: SimHost,
    xfer_id: OnceLock<XferId>,
    state: Mutex<State>,
}

struct State {
    data: Vec<u8>,
    next_packet: u32,
    sent_bytes: usize,
    done: bool,
    callback: Option<UploadCallback>,
    gate: Option<OwnedMutexGuard<()>>,
}

impl AssetUpload {
    pub fn new(
        transfer_id: TransferId,
        asset_id: AssetId,
        asset_type: AssetType,
        data: Vec<u8>,
        host: SimHost,
        callback: UploadCallback,
        gate: Option<OwnedMutexGuard<()>>,
    ) -> Self {
        Self {
            transfer_id,
            asset_id,
            asset_type,
            host,
            xfer_id: OnceLock::new(),
            state: Mutex::new(State {
                data,
                next_packet: 0,
                sent_bytes: 0,
                done: false,
                callback: Some(callback),
                gate,
            }),
        }
    }

    /// The sim-assigned Xfer id, once the handshake has arrived.
    pub fn xfer_id(&self) -> Option<XferId> {
        self.xfer_id.get().copied()
    }

    /// Records the sim-assigned id. Returns `false` if one was already set
    /// (a duplicate handshake).
    pub(crate) fn set_xfer_id(&self, xfer_id: XferId) -> bool {
        self.xfer_id.set(xfer_id).is_ok()
    }

    /// Drops the handshake gate so the next upload may announce itself.
    pub(crate) fn release_gate(&self) {
        self.state.lock().unwrap().gate = None;
    }

    /// Produces the next packet to send: `(packet_field, body)`.
    ///
    /// Packet 0's body is prefixed with the little-endian total size; the
    /// last chunk gets the final flag. `None` once everything has been
    /// handed out.
    pub(crate) fn next_chunk(&self, chunk_size: usize) -> Option<(u32, Vec<u8>)> {
        let mut s = self.state.lock().unwrap();
        if s.done {
            return None;
        }
        if s.sent_bytes >= s.data.len() && s.next_packet > 0 {
            return None;
        }

        let remaining = &s.data[s.sent_bytes..];
        let take = remaining.len().min(chunk_size);
        let chunk = &remaining[..take];
        let is_final = s.sent_bytes + take >= s.data.len();

        let body = if s.next_packet == 0 {
            packet::prepend_size(s.data.len() as u32, chunk)
        } else {
            chunk.to_vec()
        };
        let field = packet::encode(s.next_packet, is_final);

        s.sent_bytes += take;
        s.next_packet += 1;
        Some((field, body))
    }

    pub fn sent_bytes(&self) -> usize {
        self.state.lock().unwrap().sent_bytes
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().unwrap().data.len()
    }

    /// Marks the upload terminal and hands back the callback, at most once.
    /// Also drops the gate in case the handshake never arrived.
    pub(crate) fn finalize(&self, _success: bool) -> Option<UploadCallback> {
        let mut s = self.state.lock().unwrap();
        if s.done {
            return None;
        }
        s.done = true;
        s.gate = None;
        s.data = Vec::new();
        s.callback.take()
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }
}
