//! The concurrent table of in-flight transfers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gridlink_types::{AssetId, TransferId, XferId};

use crate::download::AssetDownload;
use crate::upload::AssetUpload;
use crate::xfer::XferDownload;

/// One live transfer of any kind.
#[derive(Clone)]
pub enum TransferEntry {
    Download(Arc<AssetDownload>),
    Xfer(Arc<XferDownload>),
    Upload(Arc<AssetUpload>),
}

impl TransferEntry {
    pub fn transfer_id(&self) -> TransferId {
        match self {
            TransferEntry::Download(t) => t.transfer_id,
            TransferEntry::Xfer(t) => t.transfer_id,
            TransferEntry::Upload(t) => t.transfer_id,
        }
    }
}

/// Registry of in-flight transfers.
///
/// One lock guards the primary map and both secondary indices: the legacy
/// `XferId` mapping (a distinct 64-bit identifier space) and the
/// `AssetId` index used to correlate upload-complete messages, which the
/// protocol keys by asset id rather than transfer id.
///
/// Entries are never dropped implicitly; callers remove them on terminal
/// success or failure.
#[derive(Default)]
pub struct TransferRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    transfers: HashMap<TransferId, TransferEntry>,
    by_xfer: HashMap<XferId, TransferId>,
    by_asset: HashMap<AssetId, TransferId>,
}

impl Inner {
    fn unmap_xfer(&mut self, xfer_id: XferId, id: TransferId) {
        if self.by_xfer.get(&xfer_id) == Some(&id) {
            self.by_xfer.remove(&xfer_id);
        }
    }
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a transfer, indexing any identifiers it already carries.
    pub fn register(&self, entry: TransferEntry) {
        let mut inner = self.inner.lock().unwrap();
        let id = entry.transfer_id();
        match &entry {
            TransferEntry::Xfer(x) => {
                inner.by_xfer.insert(x.xfer_id, id);
            }
            TransferEntry::Upload(u) => {
                inner.by_asset.insert(u.asset_id, id);
                if let Some(xfer_id) = u.xfer_id() {
                    inner.by_xfer.insert(xfer_id, id);
                }
            }
            TransferEntry::Download(_) => {}
        }
        inner.transfers.insert(id, entry);
    }

    /// Adds the Xfer-space mapping for an upload once the remote host has
    /// assigned its id.
    pub fn map_xfer(&self, xfer_id: XferId, transfer_id: TransferId) {
        self.inner
            .lock()
            .unwrap()
            .by_xfer
            .insert(xfer_id, transfer_id);
    }

    pub fn lookup(&self, id: TransferId) -> Option<TransferEntry> {
        self.inner.lock().unwrap().transfers.get(&id).cloned()
    }

    pub fn lookup_by_xfer(&self, xfer_id: XferId) -> Option<TransferEntry> {
        let inner = self.inner.lock().unwrap();
        let id = inner.by_xfer.get(&xfer_id)?;
        inner.transfers.get(id).cloned()
    }

    /// Upload lookup by asset id (the upload-complete correlation key).
    pub fn lookup_upload_by_asset(&self, asset_id: AssetId) -> Option<Arc<AssetUpload>> {
        let inner = self.inner.lock().unwrap();
        let id = inner.by_asset.get(&asset_id)?;
        match inner.transfers.get(id) {
            Some(TransferEntry::Upload(u)) => Some(Arc::clone(u)),
            _ => None,
        }
    }

    /// Removes a transfer and all of its index entries.
    ///
    /// Index entries are dropped only while they still point at the
    /// transfer being removed; a later registration for the same asset or
    /// xfer id must keep its mapping.
    pub fn remove(&self, id: TransferId) -> Option<TransferEntry> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.transfers.remove(&id)?;
        match &entry {
            TransferEntry::Xfer(x) => {
                inner.unmap_xfer(x.xfer_id, id);
            }
            TransferEntry::Upload(u) => {
                if inner.by_asset.get(&u.asset_id) == Some(&id) {
                    inner.by_asset.remove(&u.asset_id);
                }
                if let Some(xfer_id) = u.xfer_id() {
                    inner.unmap_xfer(xfer_id, id);
                }
            }
            TransferEntry::Download(_) => {}
        }
        Some(entry)
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.inner.lock().unwrap().transfers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
