use std::time::Duration;

/// Tunables for the transfer machinery.
///
/// Defaults match the wire protocol's conventions; tests shrink the
/// timeouts instead of waiting them out.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long a data packet waits for the transfer header before the
    /// download is aborted.
    pub header_timeout: Duration,
    /// How long a second upload waits for the pending upload handshake to
    /// clear before failing.
    pub confirm_timeout: Duration,
    /// Payload bytes per Xfer packet.
    pub chunk_size: usize,
    /// Largest payload that rides inline in the upload request instead of
    /// going through the chunked Xfer handshake.
    pub inline_upload_max: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            header_timeout: Duration::from_secs(15),
            confirm_timeout: Duration::from_secs(20),
            chunk_size: 1000,
            inline_upload_max: 1000,
        }
    }
}
