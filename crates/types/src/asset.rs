use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::StatusCode;

/// Content identifier of an asset (UUID space).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct AssetId(pub Uuid);

impl AssetId {
    pub fn random() -> Self {
        AssetId(Uuid::new_v4())
    }

    pub fn is_nil(self) -> bool {
        self.0.is_nil()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        AssetId(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one in-flight transfer (UUID space, unique per session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn random() -> Self {
        TransferId(Uuid::new_v4())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Legacy 64-bit Xfer identifier.
///
/// A separate identifier space from [`TransferId`]; the registry keeps the
/// mapping between the two, nothing is ever cast across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XferId(pub u64);

impl XferId {
    pub fn random() -> Self {
        let (hi, _) = Uuid::new_v4().as_u64_pair();
        XferId(hi)
    }
}

impl fmt::Display for XferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Asset content types with their legacy wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetType {
    Texture,
    Sound,
    CallingCard,
    Landmark,
    Clothing,
    Object,
    Notecard,
    LslText,
    LslBytecode,
    TextureTga,
    Bodypart,
    Animation,
    Gesture,
    Settings,
    Material,
    Unknown,
}

impl AssetType {
    pub fn code(self) -> i8 {
        match self {
            AssetType::Texture => 0,
            AssetType::Sound => 1,
            AssetType::CallingCard => 2,
            AssetType::Landmark => 3,
            AssetType::Clothing => 5,
            AssetType::Object => 6,
            AssetType::Notecard => 7,
            AssetType::LslText => 10,
            AssetType::LslBytecode => 11,
            AssetType::TextureTga => 12,
            AssetType::Bodypart => 13,
            AssetType::Animation => 20,
            AssetType::Gesture => 21,
            AssetType::Settings => 56,
            AssetType::Material => 57,
            AssetType::Unknown => -1,
        }
    }

    pub fn from_code(code: i8) -> Self {
        match code {
            0 => AssetType::Texture,
            1 => AssetType::Sound,
            2 => AssetType::CallingCard,
            3 => AssetType::Landmark,
            5 => AssetType::Clothing,
            6 => AssetType::Object,
            7 => AssetType::Notecard,
            10 => AssetType::LslText,
            11 => AssetType::LslBytecode,
            12 => AssetType::TextureTga,
            13 => AssetType::Bodypart,
            20 => AssetType::Animation,
            21 => AssetType::Gesture,
            56 => AssetType::Settings,
            57 => AssetType::Material,
            _ => AssetType::Unknown,
        }
    }

    /// Fixed allowlist of types the ViewerAsset HTTP capability serves.
    ///
    /// Everything else must use the legacy binary protocol.
    pub fn is_http_fetchable(self) -> bool {
        matches!(
            self,
            AssetType::Texture
                | AssetType::Sound
                | AssetType::Landmark
                | AssetType::Clothing
                | AssetType::Bodypart
                | AssetType::Animation
                | AssetType::Gesture
                | AssetType::Settings
                | AssetType::Material
        )
    }

    /// Query tag used by the capability URL (`?{tag}_id={asset_id}`).
    pub fn http_query_tag(self) -> &'static str {
        match self {
            AssetType::Texture | AssetType::TextureTga => "texture",
            AssetType::Sound => "sound",
            AssetType::CallingCard => "callcard",
            AssetType::Landmark => "landmark",
            AssetType::Clothing => "clothing",
            AssetType::Object => "object",
            AssetType::Notecard => "notecard",
            AssetType::LslText => "lsltext",
            AssetType::LslBytecode => "lslbyte",
            AssetType::Bodypart => "bodypart",
            AssetType::Animation => "animatn",
            AssetType::Gesture => "gesture",
            AssetType::Settings => "settings",
            AssetType::Material => "material",
            AssetType::Unknown => "unknown",
        }
    }
}

/// A typed immutable binary blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: AssetId,
    pub asset_type: AssetType,
    pub data: Vec<u8>,
}

impl Asset {
    pub fn new(id: AssetId, asset_type: AssetType, data: Vec<u8>) -> Self {
        Self {
            id,
            asset_type,
            data,
        }
    }
}

/// Outcome metadata delivered alongside every fetch callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetReceipt {
    pub transfer_id: TransferId,
    pub asset_id: AssetId,
    pub asset_type: AssetType,
    pub success: bool,
    pub status: StatusCode,
}

impl AssetReceipt {
    pub fn success(transfer_id: TransferId, asset_id: AssetId, asset_type: AssetType) -> Self {
        Self {
            transfer_id,
            asset_id,
            asset_type,
            success: true,
            status: StatusCode::Done,
        }
    }

    pub fn failure(
        transfer_id: TransferId,
        asset_id: AssetId,
        asset_type: AssetType,
        status: StatusCode,
    ) -> Self {
        Self {
            transfer_id,
            asset_id,
            asset_type,
            success: false,
            status,
        }
    }
}
