//! Xfer packet-number encoding and the size-prefixed first packet.
//!
//! The packet field is a u32 whose top bit flags the final packet; the low
//! 31 bits carry the ascending packet number. Packet 0 of every Xfer is
//! self-describing: its first 4 bytes are the little-endian total size of
//! the transfer, followed by ordinary payload bytes.

use crate::ProtocolError;

/// High bit of the packet field marks the final packet.
pub const FINAL_PACKET_FLAG: u32 = 0x8000_0000;

/// Encodes a packet number, optionally flagged final.
pub fn encode(number: u32, is_final: bool) -> u32 {
    if is_final {
        number | FINAL_PACKET_FLAG
    } else {
        number & !FINAL_PACKET_FLAG
    }
}

/// Splits a packet field into `(number, is_final)`.
pub fn decode(field: u32) -> (u32, bool) {
    (field & !FINAL_PACKET_FLAG, field & FINAL_PACKET_FLAG != 0)
}

/// Prepends the little-endian total size to the first packet's payload.
pub fn prepend_size(total_size: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&total_size.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Splits a first-packet body into `(total_size, payload)`.
pub fn split_size_prefix(data: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::Truncated {
            expected: 4,
            got: data.len(),
        });
    }
    let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    Ok((size, &data[4..]))
}
