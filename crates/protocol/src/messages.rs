use serde::{Deserialize, Serialize};

use gridlink_types::{AssetId, AssetType, SimHost, TransferId, XferId};

// ---------------------------------------------------------------------------
// Channel-transfer payloads
// ---------------------------------------------------------------------------

/// Client → sim: start a channel-mode download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub transfer_id: TransferId,
    pub channel: i32,
    pub source: i32,
    pub priority: f32,
    /// Opaque source-locator blob, see [`crate::params`].
    #[serde(with = "base64_bytes")]
    pub params: Vec<u8>,
}

/// Sim → client: transfer header carrying status and declared size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInfo {
    pub transfer_id: TransferId,
    pub channel: i32,
    pub target: i32,
    pub status: i32,
    pub size: i32,
    #[serde(with = "base64_bytes")]
    pub params: Vec<u8>,
}

/// Sim → client: one data packet of a channel-mode download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPacket {
    pub transfer_id: TransferId,
    pub channel: i32,
    pub packet_num: u32,
    pub status: i32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Client → sim: abort a channel-mode download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAbort {
    pub transfer_id: TransferId,
    pub channel: i32,
}

// ---------------------------------------------------------------------------
// Legacy Xfer payloads
// ---------------------------------------------------------------------------

/// Client → sim: start an Xfer download by filename or by content id.
///
/// `filename` and `vfile_id` are mutually exclusive; the unused one is
/// empty/nil.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestXfer {
    pub xfer_id: XferId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    pub vfile_id: AssetId,
    pub vfile_type: i8,
    pub delete_on_completion: bool,
    pub use_big_packets: bool,
}

/// One Xfer data packet, either direction.
///
/// `packet` encodes the number and the final flag, see [`crate::packet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendXferPacket {
    pub xfer_id: XferId,
    pub packet: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Acknowledges one Xfer packet by echoing its number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmXferPacket {
    pub xfer_id: XferId,
    pub packet: u32,
}

/// Terminates an Xfer with an error code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortXfer {
    pub xfer_id: XferId,
    pub result: i32,
}

// ---------------------------------------------------------------------------
// Upload payloads
// ---------------------------------------------------------------------------

/// Client → sim: announce an upload.
///
/// Small payloads ride inline in `data` and skip the Xfer handshake
/// entirely; otherwise `data` is empty and the sim answers with
/// [`RequestXferUpload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetUploadRequest {
    pub transaction_id: TransferId,
    pub asset_type: i8,
    pub temp_file: bool,
    pub store_local: bool,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Sim → client: "send me the file" — carries the sim-assigned Xfer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestXferUpload {
    pub xfer_id: XferId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
}

/// Sim → client: upload finished.
///
/// Correlated by asset id, not by transfer id — a protocol property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetUploadComplete {
    pub asset_id: AssetId,
    pub asset_type: i8,
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Message envelope and send boundary
// ---------------------------------------------------------------------------

/// Every payload the transfer subsystem sends or receives, tagged by type.
///
/// The framing layer owns (de)serialization to the actual wire format;
/// pattern matching here gives the dispatch table its exhaustiveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    TransferRequest(TransferRequest),
    TransferInfo(TransferInfo),
    TransferPacket(TransferPacket),
    TransferAbort(TransferAbort),
    RequestXfer(RequestXfer),
    SendXferPacket(SendXferPacket),
    ConfirmXferPacket(ConfirmXferPacket),
    AbortXfer(AbortXfer),
    AssetUploadRequest(AssetUploadRequest),
    RequestXferUpload(RequestXferUpload),
    AssetUploadComplete(AssetUploadComplete),
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::TransferRequest(_) => "TransferRequest",
            Message::TransferInfo(_) => "TransferInfo",
            Message::TransferPacket(_) => "TransferPacket",
            Message::TransferAbort(_) => "TransferAbort",
            Message::RequestXfer(_) => "RequestXfer",
            Message::SendXferPacket(_) => "SendXferPacket",
            Message::ConfirmXferPacket(_) => "ConfirmXferPacket",
            Message::AbortXfer(_) => "AbortXfer",
            Message::AssetUploadRequest(_) => "AssetUploadRequest",
            Message::RequestXferUpload(_) => "RequestXferUpload",
            Message::AssetUploadComplete(_) => "AssetUploadComplete",
        }
    }
}

impl AssetUploadRequest {
    pub fn asset_type(&self) -> AssetType {
        AssetType::from_code(self.asset_type)
    }
}

/// Outbound message boundary, implemented by the transport/framing layer.
///
/// Fire-and-forget: no delivery guarantee, no ordering guarantee across
/// message types.
pub trait MessageSender: Send + Sync {
    fn send(&self, message: Message, host: &SimHost);
}

/// Serde adapter encoding binary payload fields as base64 strings.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
