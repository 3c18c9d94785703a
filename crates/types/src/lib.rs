//! Core types shared across the gridlink workspace.
//!
//! Identifiers, asset type tags, transfer classification enums, the session
//! context with its capability table, and tunable configuration.

mod asset;
mod config;
mod session;

pub use asset::{Asset, AssetId, AssetReceipt, AssetType, TransferId, XferId};
pub use config::TransferConfig;
pub use session::{
    CAP_GET_TEXTURE, CAP_NEW_FILE_AGENT_INVENTORY, CAP_UPDATE_NOTECARD, CAP_UPDATE_SCRIPT,
    CAP_UPLOAD_BAKED_TEXTURE, CAP_VIEWER_ASSET, Session, SimHost,
};

use serde::{Deserialize, Serialize};

/// Status carried by transfer header packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    Done,
    Skip,
    Abort,
    Error,
    UnknownSource,
    InsufficientPermissions,
}

impl StatusCode {
    /// Wire code used by the legacy binary protocol.
    pub fn code(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Done => 1,
            StatusCode::Skip => 2,
            StatusCode::Abort => 3,
            StatusCode::Error => -1,
            StatusCode::UnknownSource => -2,
            StatusCode::InsufficientPermissions => -3,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Done,
            2 => StatusCode::Skip,
            3 => StatusCode::Abort,
            -2 => StatusCode::UnknownSource,
            -3 => StatusCode::InsufficientPermissions,
            _ => StatusCode::Error,
        }
    }

    /// `true` for statuses under which payload data can still arrive.
    pub fn is_ok(self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::Done)
    }
}

/// Logical channel of a channel-mode transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    Unknown,
    Misc,
    Asset,
}

impl ChannelType {
    pub fn code(self) -> i32 {
        match self {
            ChannelType::Unknown => 0,
            ChannelType::Misc => 1,
            ChannelType::Asset => 2,
        }
    }
}

/// Where the simulator should read the requested content from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    Unknown,
    Asset,
    SimInventoryItem,
    SimEstate,
}

impl SourceType {
    pub fn code(self) -> i32 {
        match self {
            SourceType::Unknown => 0,
            SourceType::Asset => 2,
            SourceType::SimInventoryItem => 3,
            SourceType::SimEstate => 4,
        }
    }
}

/// Target classification reported back in the transfer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    Unknown,
    File,
    VFile,
}

impl TargetType {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => TargetType::File,
            2 => TargetType::VFile,
            _ => TargetType::Unknown,
        }
    }
}

/// Request priority, higher is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Priority(pub f32);

impl Default for Priority {
    fn default() -> Self {
        Priority(100.0)
    }
}
