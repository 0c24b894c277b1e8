use std::net::SocketAddr;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;

use peermesh_stun::{self as stun, crypto};

use crate::candidate::Candidate;
use crate::check::ConnectivityCheck;

/// First byte of an application datagram. The two STUN message types
/// sharing the socket start with 0x00 / 0x01, so the high bits
/// distinguish the families.
pub(crate) const MEDIA_PREFIX: u8 = 0xC0;

/// Connection status of a peer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Connectivity checks are running.
    Negotiating,
    /// A nominated pair carries traffic.
    Connected,
    /// The slot is free, or the peer was disconnected or lost.
    Invalid,
}

/// Per-peer connection state, stored in the mesh's fixed slot table.
pub(crate) struct PeerConn {
    pub(crate) id: u64,
    pub(crate) state: PeerState,
    /// localId > remoteId; the controlling side nominates.
    pub(crate) controlling: bool,
    pub(crate) remote_candidates: Vec<Candidate>,
    /// Sorted by descending pair priority, at most 50 entries.
    pub(crate) checks: Vec<ConnectivityCheck>,
    /// Messages delivered by the current tick; recycled on the next.
    pub(crate) inbox: Vec<Bytes>,
    /// Index of the nominated local candidate once connected.
    pub(crate) selected_local: usize,
    /// Nominated remote address once connected.
    pub(crate) selected_addr: Option<SocketAddr>,
    /// Prebuilt keepalive Binding Request.
    pub(crate) keepalive: Vec<u8>,
    /// Slot handle value; also guards against stale handles.
    pub(crate) sequence: u32,
    /// Next keepalive while connected, or the close-wait deadline
    /// while negotiating. None means no deadline armed.
    pub(crate) send_deadline: Option<Instant>,
    /// Inbound silence deadline; crossing it invalidates the peer.
    pub(crate) recv_deadline: Option<Instant>,
}

impl PeerConn {
    pub(crate) fn vacant() -> Self {
        Self {
            id: 0,
            state: PeerState::Invalid,
            controlling: false,
            remote_candidates: Vec::new(),
            checks: Vec::new(),
            inbox: Vec::new(),
            selected_local: 0,
            selected_addr: None,
            keepalive: Vec::new(),
            sequence: 0,
            send_deadline: None,
            recv_deadline: None,
        }
    }
}

/// Build the keepalive Binding Request sent while connected.
pub(crate) fn build_keepalive(
    rng: &mut StdRng,
    local_id: u64,
    remote_id: u64,
    key: &[u8],
) -> Vec<u8> {
    let attrs = stun::USERNAME_LEN + stun::MESSAGE_INTEGRITY_LEN + stun::FINGERPRINT_LEN;

    let mut packet = vec![0u8; stun::HEADER_LEN + attrs];
    let mut at = stun::write_binding_request(rng, &mut packet, attrs as u16);
    at = stun::append_username(&mut packet, at, local_id, remote_id);
    at = stun::append_message_integrity(&mut packet, at, key);
    stun::append_fingerprint(&mut packet, at);

    packet
}

/// Does this datagram belong to the application datagram family?
pub(crate) fn is_media_datagram(datagram: &[u8]) -> bool {
    datagram.len() > 1 + crypto::DIGEST_LEN && (datagram[0] & MEDIA_PREFIX) == MEDIA_PREFIX
}

/// Frame an outbound application datagram:
/// `0xC0 ‖ payload ‖ HMAC-SHA-1(key, sender_id ‖ payload)`.
///
/// The MAC covers the sender id, so a datagram captured at one peer
/// cannot be replayed as another peer's traffic.
pub(crate) fn seal_datagram(key: &[u8], sender_id: u64, payload: &[u8]) -> BytesMut {
    let mac = crypto::hmac_sha1(key, &[&sender_id.to_be_bytes(), payload]);

    let mut out = BytesMut::with_capacity(1 + payload.len() + mac.len());
    out.put_u8(MEDIA_PREFIX);
    out.put_slice(payload);
    out.put_slice(&mac);
    out
}

/// Authenticate an inbound application datagram against the id of the
/// peer it arrived from. Returns the owned payload, or None for
/// anything that fails to verify.
pub(crate) fn open_datagram(key: &[u8], sender_id: u64, datagram: &[u8]) -> Option<Bytes> {
    if !is_media_datagram(datagram) {
        return None;
    }

    let (body, tag) = datagram.split_at(datagram.len() - crypto::DIGEST_LEN);
    let payload = &body[1..];

    if !crypto::hmac_sha1_verify(key, &[&sender_id.to_be_bytes(), payload], tag) {
        return None;
    }

    Some(Bytes::copy_from_slice(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    const KEY: &[u8] = b"session key";

    #[test]
    fn datagram_roundtrip() {
        let sealed = seal_datagram(KEY, 7, b"hello mesh");
        assert_eq!(sealed[0], MEDIA_PREFIX);
        assert!(is_media_datagram(&sealed));

        let payload = open_datagram(KEY, 7, &sealed).unwrap();
        assert_eq!(&payload[..], b"hello mesh");
    }

    #[test]
    fn forged_key_is_rejected() {
        let sealed = seal_datagram(b"some other key", 7, b"hello mesh");
        assert!(open_datagram(KEY, 7, &sealed).is_none());
    }

    #[test]
    fn replay_across_peer_ids_is_rejected() {
        // sealed as peer 7's traffic, replayed at a slot expecting peer 9
        let sealed = seal_datagram(KEY, 7, b"hello mesh");
        assert!(open_datagram(KEY, 9, &sealed).is_none());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let mut sealed = seal_datagram(KEY, 7, b"hello mesh");
        sealed[3] ^= 0x01;
        assert!(open_datagram(KEY, 7, &sealed).is_none());
    }

    #[test]
    fn short_and_unmarked_datagrams_are_not_media() {
        assert!(!is_media_datagram(&[MEDIA_PREFIX; 21]));
        assert!(is_media_datagram(&[MEDIA_PREFIX; 22]));
        // STUN binding request and response leads
        assert!(!is_media_datagram(&[0x00; 64]));
        assert!(!is_media_datagram(&[0x01; 64]));
        assert!(open_datagram(KEY, 7, &[MEDIA_PREFIX; 21]).is_none());
    }

    #[test]
    fn keepalive_is_a_parsable_binding_request() {
        let mut rng = StdRng::seed_from_u64(9);
        let keepalive = build_keepalive(&mut rng, 7, 3, KEY);

        assert!(stun::is_binding_request(&keepalive));
        let req = stun::parse_binding_request(&keepalive, KEY).unwrap();
        assert_eq!(req.incoming_username, 7);
        assert_eq!(req.target_username, 3);
        assert!(!req.use_candidate);
    }
}
