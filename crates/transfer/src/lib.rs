//! In-flight transfer tracking and reassembly.
//!
//! Two wire protocols share this machinery: the channel-mode download path
//! (out-of-order tolerant, header-then-packets) and the legacy strictly
//! sequential Xfer path used for uploads and some downloads. The
//! [`TransferManager`] owns the registry of live transfers and is the
//! inbound dispatch surface the framing layer feeds one message at a time.

mod download;
mod manager;
mod registry;
mod upload;
mod xfer;

pub use download::AssetDownload;
pub use manager::{TransferEvent, TransferManager};
pub use registry::{TransferEntry, TransferRegistry};
pub use upload::AssetUpload;
pub use xfer::{XferDownload, XferSource};

use std::time::Duration;

use gridlink_types::{AssetId, AssetReceipt, TransferId};

/// Invoked exactly once per download with the reassembled bytes, or `None`
/// on failure.
pub type DownloadCallback = Box<dyn FnOnce(AssetReceipt, Option<Vec<u8>>) + Send>;

/// Invoked exactly once per upload: `(success, status_message, asset_id)`.
pub type UploadCallback = Box<dyn FnOnce(bool, String, AssetId) + Send>;

/// Errors surfaced by transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no transfer registered under {0}")]
    UnknownTransfer(TransferId),

    #[error("another upload handshake is still pending after {0:?}")]
    UploadBusy(Duration),
}
