//! Message payloads and byte-level codecs for the legacy binary
//! asset-transfer protocol.
//!
//! Wire framing (datagram packing, reliability, acks) lives in the
//! transport layer outside this workspace; this crate defines the typed
//! payloads that cross that boundary, plus the two pieces of byte-level
//! encoding that belong to the transfer subsystem itself: the
//! source-locator parameter blob and the Xfer packet-number field.

pub mod messages;
pub mod packet;
pub mod params;

pub use messages::{Message, MessageSender};

/// Errors produced while encoding or decoding protocol payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Parameter blob of a length that matches no known layout.
    #[error("unknown source-locator params layout: {0} bytes")]
    UnknownParamsLayout(usize),

    #[error("truncated payload: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}
