#![deny(unreachable_pub, unsafe_code)]

//! STUN binding-message framing for the peermesh connectivity core.
//!
//! This is not a general STUN implementation. It covers exactly the
//! two message types the mesh exchanges (Binding Request and Binding
//! Success Response) and the attribute set needed for ICE-style
//! connectivity checks between peers that share a symmetric session
//! key:
//!
//! - `USERNAME` carrying a pair of 64-bit peer ids
//! - `MESSAGE-INTEGRITY` (HMAC-SHA-1 keyed on the session key)
//! - `XOR-MAPPED-ADDRESS` / `MAPPED-ADDRESS`
//! - `ICE-PRIORITY`, `ICE-USE-CANDIDATE`
//! - `ICE-CONTROLLED` / `ICE-CONTROLLING`
//! - `FINGERPRINT` (CRC-32)
//!
//! Messages are built into caller-provided buffers with
//! position-passing writers: every `append_*` returns the offset at
//! which the next attribute starts. The attribute length in the
//! header is the final total and must be passed up front, since
//! `MESSAGE-INTEGRITY` and `FINGERPRINT` digest the header as it will
//! appear on the wire.

pub mod crypto;
mod message;

pub use message::{
    append_fingerprint, append_ice_control, append_ice_priority, append_message_integrity,
    append_use_candidate, append_username, append_xor_mapped_address, is_binding_request,
    is_binding_response, matches_transaction_id, parse_binding_request, parse_binding_response,
    transaction_id, write_binding_request, write_binding_response, BindingRequest,
    BindingResponse, FINGERPRINT_LEN, ICE_CONTROL_LEN, ICE_PRIORITY_LEN, MESSAGE_INTEGRITY_LEN,
    USERNAME_LEN, USE_CANDIDATE_LEN, XOR_MAPPED_ADDRESS_V4_LEN, XOR_MAPPED_ADDRESS_V6_LEN,
};

/// The fixed STUN magic cookie.
pub const MAGIC: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];

/// Size of the STUN message header.
pub const HEADER_LEN: usize = 20;

/// Parse failure for an incoming datagram.
///
/// The mesh treats every variant the same way (the datagram is
/// dropped), but distinguishing them keeps the codec testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("packet length does not match the header attribute length")]
    LengthMismatch,
    #[error("truncated or overlong attribute")]
    MalformedAttribute,
    #[error("unknown address family {0:#04x}")]
    UnknownFamily(u8),
    #[error("fingerprint mismatch")]
    BadFingerprint,
    #[error("message integrity check failed")]
    BadIntegrity,
    #[error("session key is set but the message carries no integrity attribute")]
    MissingIntegrity,
    #[error("response carries no mapped address")]
    MissingMappedAddress,
}
