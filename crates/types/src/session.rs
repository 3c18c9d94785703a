use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use uuid::Uuid;

/// Capability name for generic asset fetch over HTTP.
pub const CAP_VIEWER_ASSET: &str = "ViewerAsset";
/// Capability name for texture fetch over HTTP.
pub const CAP_GET_TEXTURE: &str = "GetTexture";
/// Capability name for baked-texture upload.
pub const CAP_UPLOAD_BAKED_TEXTURE: &str = "UploadBakedTexture";
/// Capability name for notecard content updates.
pub const CAP_UPDATE_NOTECARD: &str = "UpdateNotecardAgentInventory";
/// Capability name for script content updates.
pub const CAP_UPDATE_SCRIPT: &str = "UpdateScriptAgent";
/// Capability name for creating new inventory assets.
pub const CAP_NEW_FILE_AGENT_INVENTORY: &str = "NewFileAgentInventory";

/// A simulator endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimHost {
    pub name: String,
    pub address: SocketAddr,
}

/// Per-login session context.
///
/// Holds the agent/session identity, the currently connected simulator and
/// the capability-URL table discovered from it. Capabilities come and go as
/// the client moves between hosts, so the table is mutable behind a lock.
pub struct Session {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    host: RwLock<Option<SimHost>>,
    capabilities: RwLock<HashMap<String, String>>,
}

impl Session {
    pub fn new(agent_id: Uuid, session_id: Uuid) -> Self {
        Self {
            agent_id,
            session_id,
            host: RwLock::new(None),
            capabilities: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the currently connected simulator, if any.
    pub fn current_host(&self) -> Option<SimHost> {
        self.host.read().unwrap().clone()
    }

    pub fn set_current_host(&self, host: SimHost) {
        *self.host.write().unwrap() = Some(host);
    }

    /// Resolves a capability name to its URL for the active host.
    ///
    /// `None` means the feature must use the legacy binary protocol.
    pub fn resolve_capability(&self, name: &str) -> Option<String> {
        self.capabilities.read().unwrap().get(name).cloned()
    }

    pub fn set_capability(&self, name: impl Into<String>, url: impl Into<String>) {
        self.capabilities
            .write()
            .unwrap()
            .insert(name.into(), url.into());
    }

    /// Drops all known capabilities (host change / region restart).
    pub fn clear_capabilities(&self) {
        self.capabilities.write().unwrap().clear();
    }
}
