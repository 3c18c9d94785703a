//! High-level asset access.
//!
//! The [`AssetDispatcher`] is the crate's front door: it answers fetches
//! from the disk cache when it can, prefers the HTTP capability routes the
//! simulator advertises, and falls back to the legacy binary protocol via
//! the transfer manager. The [`TexturePipeline`] batches concurrent texture
//! fetches for appearance baking on top of it.

mod dispatcher;
mod texture;

pub use dispatcher::{AssetDispatcher, FetchCallback};
pub use texture::TexturePipeline;

use std::time::Duration;

use gridlink_http::HttpError;
use gridlink_transfer::TransferError;
use gridlink_types::{AssetId, StatusCode};

/// Errors surfaced by the dispatcher and texture pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("not connected to a simulator")]
    NotConnected,

    #[error("no {0} capability available")]
    NoCapability(&'static str),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("fetch of {asset_id} failed with status {status:?}")]
    Fetch {
        asset_id: AssetId,
        status: StatusCode,
    },

    #[error("no result within {0:?}")]
    Timeout(Duration),

    #[error("texture {0} is already being fetched")]
    AlreadyInFlight(AssetId),

    #[error("texture pipeline shut down")]
    PipelineClosed,
}
