//! Source-locator parameter blob codecs.
//!
//! Transfer requests and headers carry an opaque byte blob identifying what
//! to fetch. Two layouts exist on the wire:
//!
//! ```text
//! ASSET (20 bytes):           [16: asset_id][4: asset_type LE i32]
//! TASK INVENTORY (100 bytes): [16: agent_id][16: session_id][16: owner_id]
//!                             [16: task_id][16: item_id][16: asset_id]
//!                             [4: asset_type LE i32]
//! ```
//!
//! Any other length is a protocol warning for the caller, not a fatal
//! error — the transfer continues with its requested identity.

use uuid::Uuid;

use gridlink_types::{AssetId, AssetType};

use crate::ProtocolError;

pub const ASSET_PARAMS_LEN: usize = 20;
pub const TASK_INVENTORY_PARAMS_LEN: usize = 100;

/// Plain asset fetch locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetParams {
    pub asset_id: AssetId,
    pub asset_type: AssetType,
}

/// Locator for content inside another object's (task's) inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInventoryParams {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub task_id: Uuid,
    pub item_id: Uuid,
    pub asset_id: AssetId,
    pub asset_type: AssetType,
}

/// A decoded source-locator blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceParams {
    Asset(AssetParams),
    TaskInventory(TaskInventoryParams),
}

impl SourceParams {
    /// The definitive asset identity carried by either layout.
    pub fn asset(&self) -> (AssetId, AssetType) {
        match self {
            SourceParams::Asset(p) => (p.asset_id, p.asset_type),
            SourceParams::TaskInventory(p) => (p.asset_id, p.asset_type),
        }
    }
}

impl AssetParams {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ASSET_PARAMS_LEN);
        out.extend_from_slice(self.asset_id.as_bytes());
        out.extend_from_slice(&(self.asset_type.code() as i32).to_le_bytes());
        out
    }
}

impl TaskInventoryParams {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TASK_INVENTORY_PARAMS_LEN);
        for id in [
            &self.agent_id,
            &self.session_id,
            &self.owner_id,
            &self.task_id,
            &self.item_id,
        ] {
            out.extend_from_slice(id.as_bytes());
        }
        out.extend_from_slice(self.asset_id.as_bytes());
        out.extend_from_slice(&(self.asset_type.code() as i32).to_le_bytes());
        out
    }
}

/// Decodes a params blob, selecting the layout by length.
pub fn decode(blob: &[u8]) -> Result<SourceParams, ProtocolError> {
    match blob.len() {
        ASSET_PARAMS_LEN => Ok(SourceParams::Asset(AssetParams {
            asset_id: AssetId::from_bytes(read_uuid(blob, 0).into_bytes()),
            asset_type: read_type(blob, 16),
        })),
        TASK_INVENTORY_PARAMS_LEN => Ok(SourceParams::TaskInventory(TaskInventoryParams {
            agent_id: read_uuid(blob, 0),
            session_id: read_uuid(blob, 16),
            owner_id: read_uuid(blob, 32),
            task_id: read_uuid(blob, 48),
            item_id: read_uuid(blob, 64),
            asset_id: AssetId::from_bytes(read_uuid(blob, 80).into_bytes()),
            asset_type: read_type(blob, 96),
        })),
        other => Err(ProtocolError::UnknownParamsLayout(other)),
    }
}

fn read_uuid(blob: &[u8], offset: usize) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&blob[offset..offset + 16]);
    Uuid::from_bytes(bytes)
}

fn read_type(blob: &[u8], offset: usize) -> AssetType {
    let code = i32::from_le_bytes([
        blob[offset],
        blob[offset + 1],
        blob[offset + 2],
        blob[offset + 3],
    ]);
    AssetType::from_code(code as i8)
}
