use std::net::{IpAddr, SocketAddr};

use rand::RngCore;

use crate::{crypto, ProtocolError, HEADER_LEN, MAGIC};

const BINDING_REQUEST: [u8; 2] = [0x00, 0x01];
const BINDING_SUCCESS: [u8; 2] = [0x01, 0x01];

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_ICE_PRIORITY: u16 = 0x0024;
const ATTR_ICE_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

/// On-wire size of the USERNAME attribute including its header.
pub const USERNAME_LEN: usize = 20;
/// On-wire size of the MESSAGE-INTEGRITY attribute including its header.
pub const MESSAGE_INTEGRITY_LEN: usize = 24;
/// On-wire size of a v4 XOR-MAPPED-ADDRESS attribute including its header.
pub const XOR_MAPPED_ADDRESS_V4_LEN: usize = 12;
/// On-wire size of a v6 XOR-MAPPED-ADDRESS attribute including its header.
pub const XOR_MAPPED_ADDRESS_V6_LEN: usize = 24;
/// On-wire size of the ICE-PRIORITY attribute including its header.
pub const ICE_PRIORITY_LEN: usize = 8;
/// On-wire size of the ICE-USE-CANDIDATE attribute including its header.
pub const USE_CANDIDATE_LEN: usize = 4;
/// On-wire size of an ICE-CONTROLLED/ICE-CONTROLLING attribute including its header.
pub const ICE_CONTROL_LEN: usize = 12;
/// On-wire size of the FINGERPRINT attribute including its header.
pub const FINGERPRINT_LEN: usize = 8;

/// Write a Binding Request header into `packet[..20]` with a fresh
/// random transaction id.
///
/// `attribute_len` is the total length of all attributes that will
/// follow; it lands in the header immediately so integrity and
/// fingerprint digests cover the final header bytes. Returns the
/// offset of the first attribute.
pub fn write_binding_request(
    rng: &mut dyn RngCore,
    packet: &mut [u8],
    attribute_len: u16,
) -> usize {
    packet[0..2].copy_from_slice(&BINDING_REQUEST);
    packet[2..4].copy_from_slice(&attribute_len.to_be_bytes());
    packet[4..8].copy_from_slice(&MAGIC);
    rng.fill_bytes(&mut packet[8..HEADER_LEN]);
    HEADER_LEN
}

/// Write a Binding Success Response header into `packet[..20]`,
/// copying magic cookie and transaction id from `request`.
pub fn write_binding_response(packet: &mut [u8], attribute_len: u16, request: &[u8]) -> usize {
    packet[0..2].copy_from_slice(&BINDING_SUCCESS);
    packet[2..4].copy_from_slice(&attribute_len.to_be_bytes());
    packet[4..HEADER_LEN].copy_from_slice(&request[4..HEADER_LEN]);
    HEADER_LEN
}

/// Append a USERNAME attribute: `local_id ‖ remote_id`, both big-endian.
pub fn append_username(packet: &mut [u8], at: usize, local_id: u64, remote_id: u64) -> usize {
    packet[at..at + 4].copy_from_slice(&[0x00, 0x06, 0x00, 0x10]);
    packet[at + 4..at + 12].copy_from_slice(&local_id.to_be_bytes());
    packet[at + 12..at + 20].copy_from_slice(&remote_id.to_be_bytes());
    at + USERNAME_LEN
}

/// Append an ICE-CONTROLLING or ICE-CONTROLLED attribute carrying the
/// role tie-breaker.
pub fn append_ice_control(
    packet: &mut [u8],
    at: usize,
    controlling: bool,
    tie_breaker: u64,
) -> usize {
    let ty = if controlling { 0x2A } else { 0x29 };
    packet[at..at + 4].copy_from_slice(&[0x80, ty, 0x00, 0x08]);
    packet[at + 4..at + 12].copy_from_slice(&tie_breaker.to_be_bytes());
    at + ICE_CONTROL_LEN
}

/// Append an ICE-PRIORITY attribute.
pub fn append_ice_priority(packet: &mut [u8], at: usize, priority: u32) -> usize {
    packet[at..at + 4].copy_from_slice(&[0x00, 0x24, 0x00, 0x04]);
    packet[at + 4..at + 8].copy_from_slice(&priority.to_be_bytes());
    at + ICE_PRIORITY_LEN
}

/// Append the zero-length ICE-USE-CANDIDATE flag attribute.
pub fn append_use_candidate(packet: &mut [u8], at: usize) -> usize {
    packet[at..at + 4].copy_from_slice(&[0x00, 0x25, 0x00, 0x00]);
    at + USE_CANDIDATE_LEN
}

/// Append an XOR-MAPPED-ADDRESS attribute for `addr`.
///
/// The port is masked with the upper half of the magic cookie, the
/// address bytes with `magic ‖ transaction id` as already present in
/// `packet[4..20]`.
pub fn append_xor_mapped_address(packet: &mut [u8], at: usize, addr: SocketAddr) -> usize {
    let port = (addr.port() ^ 0x2112).to_be_bytes();

    match addr.ip() {
        IpAddr::V4(ip) => {
            packet[at..at + 4].copy_from_slice(&[0x00, 0x20, 0x00, 0x08]);
            packet[at + 4] = 0x00;
            packet[at + 5] = FAMILY_V4;
            packet[at + 6..at + 8].copy_from_slice(&port);

            let octets = ip.octets();
            for (i, octet) in octets.iter().enumerate() {
                packet[at + 8 + i] = octet ^ packet[4 + i];
            }

            at + XOR_MAPPED_ADDRESS_V4_LEN
        }
        IpAddr::V6(ip) => {
            packet[at..at + 4].copy_from_slice(&[0x00, 0x20, 0x00, 0x14]);
            packet[at + 4] = 0x00;
            packet[at + 5] = FAMILY_V6;
            packet[at + 6..at + 8].copy_from_slice(&port);

            let octets = ip.octets();
            for (i, octet) in octets.iter().enumerate() {
                packet[at + 8 + i] = octet ^ packet[4 + i];
            }

            at + XOR_MAPPED_ADDRESS_V6_LEN
        }
    }
}

/// Append a MESSAGE-INTEGRITY attribute digesting `packet[..at]`.
pub fn append_message_integrity(packet: &mut [u8], at: usize, key: &[u8]) -> usize {
    packet[at..at + 4].copy_from_slice(&[0x00, 0x08, 0x00, 0x14]);
    let digest = crypto::hmac_sha1(key, &[&packet[..at]]);
    packet[at + 4..at + 24].copy_from_slice(&digest);
    at + MESSAGE_INTEGRITY_LEN
}

/// Append a FINGERPRINT attribute digesting `packet[..at]`. Must be
/// the last attribute of the message.
pub fn append_fingerprint(packet: &mut [u8], at: usize) -> usize {
    packet[at..at + 4].copy_from_slice(&[0x80, 0x28, 0x00, 0x04]);
    let crc = crypto::fingerprint(&packet[..at]);
    packet[at + 4..at + 8].copy_from_slice(&crc.to_be_bytes());
    at + FINGERPRINT_LEN
}

/// Cheap classification: does this datagram look like a Binding Request?
pub fn is_binding_request(packet: &[u8]) -> bool {
    packet.len() >= HEADER_LEN && packet[0..2] == BINDING_REQUEST && packet[4..8] == MAGIC
}

/// Cheap classification: does this datagram look like a Binding
/// Success Response? A bare header is not a valid response.
pub fn is_binding_response(packet: &[u8]) -> bool {
    packet.len() > HEADER_LEN && packet[0..2] == BINDING_SUCCESS && packet[4..8] == MAGIC
}

/// The 12-byte transaction id of a message.
pub fn transaction_id(packet: &[u8]) -> &[u8] {
    &packet[8..HEADER_LEN]
}

/// Whether two messages carry the same transaction id.
pub fn matches_transaction_id(a: &[u8], b: &[u8]) -> bool {
    a.len() >= HEADER_LEN && b.len() >= HEADER_LEN && a[8..HEADER_LEN] == b[8..HEADER_LEN]
}

/// Decoded contents of an authenticated Binding Request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BindingRequest {
    /// Peer id of the sender.
    pub incoming_username: u64,
    /// Peer id the request is addressed to.
    pub target_username: u64,
    /// Role tie-breaker from ICE-CONTROLLED/ICE-CONTROLLING.
    pub tie_breaker: u64,
    /// Candidate priority from ICE-PRIORITY.
    pub priority: u32,
    /// True when the sender claims the controlling role.
    pub controlling: bool,
    /// True when the request nominates this candidate pair.
    pub use_candidate: bool,
}

/// Decoded contents of an authenticated Binding Success Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingResponse {
    /// The reflexive transport address the sender observed.
    pub mapped: SocketAddr,
    /// Candidate priority from ICE-PRIORITY, zero when absent.
    pub priority: u32,
}

struct Attribute<'a> {
    ty: u16,
    /// Offset of the attribute header within the packet.
    header: usize,
    value: &'a [u8],
}

struct Attributes<'a> {
    packet: &'a [u8],
    at: usize,
}

impl<'a> Attributes<'a> {
    fn new(packet: &'a [u8]) -> Self {
        Self {
            packet,
            at: HEADER_LEN,
        }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = Result<Attribute<'a>, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.packet.len() - self.at;
        if remaining == 0 {
            return None;
        }
        if remaining < 4 {
            self.at = self.packet.len();
            return Some(Err(ProtocolError::MalformedAttribute));
        }

        let ty = u16::from_be_bytes([self.packet[self.at], self.packet[self.at + 1]]);
        let len = u16::from_be_bytes([self.packet[self.at + 2], self.packet[self.at + 3]]) as usize;
        let header = self.at;
        let start = self.at + 4;

        if self.packet.len() - start < len {
            self.at = self.packet.len();
            return Some(Err(ProtocolError::MalformedAttribute));
        }

        self.at = start + len;
        Some(Ok(Attribute {
            ty,
            header,
            value: &self.packet[start..start + len],
        }))
    }
}

fn check_packet_length(packet: &[u8]) -> Result<(), ProtocolError> {
    if packet.len() < HEADER_LEN {
        return Err(ProtocolError::LengthMismatch);
    }

    let attribute_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if packet.len() != HEADER_LEN + attribute_len {
        return Err(ProtocolError::LengthMismatch);
    }

    Ok(())
}

/// MESSAGE-INTEGRITY must be the last attribute, or be followed only
/// by FINGERPRINT.
fn check_integrity_placement(packet: &[u8], value_end: usize) -> Result<(), ProtocolError> {
    if value_end == packet.len() {
        return Ok(());
    }
    if packet.len() - value_end >= 2 && packet[value_end] == 0x80 && packet[value_end + 1] == 0x28 {
        return Ok(());
    }

    Err(ProtocolError::MalformedAttribute)
}

fn verify_message_integrity(
    packet: &[u8],
    attr: &Attribute<'_>,
    key: &[u8],
) -> Result<(), ProtocolError> {
    if attr.value.len() != crypto::DIGEST_LEN {
        return Err(ProtocolError::MalformedAttribute);
    }
    check_integrity_placement(packet, attr.header + 4 + attr.value.len())?;

    if !crypto::hmac_sha1_verify(key, &[&packet[..attr.header]], attr.value) {
        return Err(ProtocolError::BadIntegrity);
    }

    Ok(())
}

fn verify_fingerprint(packet: &[u8], attr: &Attribute<'_>) -> Result<(), ProtocolError> {
    if attr.value.len() != 4 {
        return Err(ProtocolError::MalformedAttribute);
    }
    // must be the last attribute
    if attr.header + 4 + attr.value.len() != packet.len() {
        return Err(ProtocolError::MalformedAttribute);
    }

    let crc = crypto::fingerprint(&packet[..attr.header]);
    if attr.value != crc.to_be_bytes() {
        return Err(ProtocolError::BadFingerprint);
    }

    Ok(())
}

fn parse_mapped_address(
    packet: &[u8],
    attr: &Attribute<'_>,
) -> Result<SocketAddr, ProtocolError> {
    if attr.value.len() < 8 {
        return Err(ProtocolError::MalformedAttribute);
    }

    let xored = attr.ty == ATTR_XOR_MAPPED_ADDRESS;
    let mut port = u16::from_be_bytes([attr.value[2], attr.value[3]]);
    if xored {
        port ^= 0x2112;
    }

    // value[0] is ignored per RFC
    match attr.value[1] {
        FAMILY_V4 => {
            if attr.value.len() != 8 {
                return Err(ProtocolError::MalformedAttribute);
            }

            let mut octets = [0u8; 4];
            octets.copy_from_slice(&attr.value[4..8]);
            if xored {
                for (i, octet) in octets.iter_mut().enumerate() {
                    *octet ^= packet[4 + i];
                }
            }

            Ok(SocketAddr::from((octets, port)))
        }
        FAMILY_V6 => {
            if attr.value.len() != 20 {
                return Err(ProtocolError::MalformedAttribute);
            }

            let mut octets = [0u8; 16];
            octets.copy_from_slice(&attr.value[4..20]);
            if xored {
                for (i, octet) in octets.iter_mut().enumerate() {
                    *octet ^= packet[4 + i];
                }
            }

            Ok(SocketAddr::from((octets, port)))
        }
        family => Err(ProtocolError::UnknownFamily(family)),
    }
}

/// Parse and authenticate a Binding Request.
///
/// A non-empty `key` requires the message to carry a valid
/// MESSAGE-INTEGRITY attribute.
pub fn parse_binding_request(packet: &[u8], key: &[u8]) -> Result<BindingRequest, ProtocolError> {
    check_packet_length(packet)?;

    let mut req = BindingRequest::default();
    let mut found_mac = false;

    for attr in Attributes::new(packet) {
        let attr = attr?;
        match attr.ty {
            ATTR_USERNAME => {
                if attr.value.len() != 16 {
                    return Err(ProtocolError::MalformedAttribute);
                }

                req.incoming_username =
                    u64::from_be_bytes(attr.value[0..8].try_into().expect("slice is 8 bytes"));
                req.target_username =
                    u64::from_be_bytes(attr.value[8..16].try_into().expect("slice is 8 bytes"));
            }
            ATTR_MESSAGE_INTEGRITY => {
                verify_message_integrity(packet, &attr, key)?;
                found_mac = true;
            }
            ATTR_ICE_PRIORITY => {
                if attr.value.len() != 4 {
                    return Err(ProtocolError::MalformedAttribute);
                }

                req.priority = u32::from_be_bytes(attr.value.try_into().expect("slice is 4 bytes"));
            }
            ATTR_ICE_USE_CANDIDATE => {
                if !attr.value.is_empty() {
                    return Err(ProtocolError::MalformedAttribute);
                }

                req.use_candidate = true;
            }
            ATTR_FINGERPRINT => verify_fingerprint(packet, &attr)?,
            ATTR_ICE_CONTROLLED | ATTR_ICE_CONTROLLING => {
                if attr.value.len() != 8 {
                    return Err(ProtocolError::MalformedAttribute);
                }

                req.controlling = attr.ty == ATTR_ICE_CONTROLLING;
                req.tie_breaker =
                    u64::from_be_bytes(attr.value.try_into().expect("slice is 8 bytes"));
            }
            // comprehension-required unknowns never occur between mesh
            // implementations; drop them like the optional range
            _ => {}
        }
    }

    if !key.is_empty() && !found_mac {
        return Err(ProtocolError::MissingIntegrity);
    }

    Ok(req)
}

/// Parse and authenticate a Binding Success Response. The response
/// must carry a mapped address.
pub fn parse_binding_response(packet: &[u8], key: &[u8]) -> Result<BindingResponse, ProtocolError> {
    check_packet_length(packet)?;

    let mut mapped = None;
    let mut priority = 0;
    let mut found_mac = false;

    for attr in Attributes::new(packet) {
        let attr = attr?;
        match attr.ty {
            ATTR_MESSAGE_INTEGRITY => {
                verify_message_integrity(packet, &attr, key)?;
                found_mac = true;
            }
            ATTR_ICE_PRIORITY => {
                if attr.value.len() != 4 {
                    return Err(ProtocolError::MalformedAttribute);
                }

                priority = u32::from_be_bytes(attr.value.try_into().expect("slice is 4 bytes"));
            }
            ATTR_XOR_MAPPED_ADDRESS | ATTR_MAPPED_ADDRESS => {
                mapped = Some(parse_mapped_address(packet, &attr)?);
            }
            ATTR_FINGERPRINT => verify_fingerprint(packet, &attr)?,
            _ => {}
        }
    }

    if !key.is_empty() && !found_mac {
        return Err(ProtocolError::MissingIntegrity);
    }

    let mapped = mapped.ok_or(ProtocolError::MissingMappedAddress)?;

    Ok(BindingResponse { mapped, priority })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use rand::SeedableRng;

    const KEY: &[u8] = b"twopeers-session-key";

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(0x5EED)
    }

    fn build_check_request(use_candidate: bool) -> Vec<u8> {
        let attrs = USERNAME_LEN
            + ICE_CONTROL_LEN
            + ICE_PRIORITY_LEN
            + if use_candidate { USE_CANDIDATE_LEN } else { 0 }
            + MESSAGE_INTEGRITY_LEN
            + FINGERPRINT_LEN;

        let mut packet = vec![0u8; HEADER_LEN + attrs];
        let mut at = write_binding_request(&mut rng(), &mut packet, attrs as u16);
        at = append_username(&mut packet, at, 7, 3);
        at = append_ice_control(&mut packet, at, true, 7);
        at = append_ice_priority(&mut packet, at, 0x7530_6E);
        if use_candidate {
            at = append_use_candidate(&mut packet, at);
        }
        at = append_message_integrity(&mut packet, at, KEY);
        at = append_fingerprint(&mut packet, at);
        assert_eq!(at, packet.len());

        packet
    }

    fn build_success_response(request: &[u8], mapped: SocketAddr) -> Vec<u8> {
        let mapped_len = if mapped.is_ipv4() {
            XOR_MAPPED_ADDRESS_V4_LEN
        } else {
            XOR_MAPPED_ADDRESS_V6_LEN
        };
        let attrs = mapped_len + MESSAGE_INTEGRITY_LEN + FINGERPRINT_LEN;

        let mut packet = vec![0u8; HEADER_LEN + attrs];
        let mut at = write_binding_response(&mut packet, attrs as u16, request);
        at = append_xor_mapped_address(&mut packet, at, mapped);
        at = append_message_integrity(&mut packet, at, KEY);
        at = append_fingerprint(&mut packet, at);
        assert_eq!(at, packet.len());

        packet
    }

    #[test]
    fn request_roundtrip() {
        let packet = build_check_request(false);
        assert!(is_binding_request(&packet));
        assert!(!is_binding_response(&packet));

        let req = parse_binding_request(&packet, KEY).unwrap();
        assert_eq!(req.incoming_username, 7);
        assert_eq!(req.target_username, 3);
        assert_eq!(req.tie_breaker, 7);
        assert_eq!(req.priority, 0x7530_6E);
        assert!(req.controlling);
        assert!(!req.use_candidate);
    }

    #[test]
    fn request_with_use_candidate() {
        let packet = build_check_request(true);
        let req = parse_binding_request(&packet, KEY).unwrap();
        assert!(req.use_candidate);
    }

    #[test]
    fn reencoding_parsed_content_is_stable() {
        let packet = build_check_request(true);
        let req = parse_binding_request(&packet, KEY).unwrap();

        // Re-encode the same semantic content (modulo transaction id)
        // and parse again.
        let attrs = (packet.len() - HEADER_LEN) as u16;
        let mut again = vec![0u8; packet.len()];
        let mut at = write_binding_request(&mut rng(), &mut again, attrs);
        again[8..20].copy_from_slice(&packet[8..20]);
        at = append_username(&mut again, at, req.incoming_username, req.target_username);
        at = append_ice_control(&mut again, at, req.controlling, req.tie_breaker);
        at = append_ice_priority(&mut again, at, req.priority);
        at = append_use_candidate(&mut again, at);
        at = append_message_integrity(&mut again, at, KEY);
        append_fingerprint(&mut again, at);

        assert_eq!(packet, again);
        assert_eq!(req, parse_binding_request(&again, KEY).unwrap());
    }

    #[test]
    fn response_roundtrip_v4() {
        let request = build_check_request(false);
        let mapped: SocketAddr = "203.0.113.9:41641".parse().unwrap();
        let response = build_success_response(&request, mapped);

        assert!(is_binding_response(&response));
        assert!(matches_transaction_id(&request, &response));

        let res = parse_binding_response(&response, KEY).unwrap();
        assert_eq!(res.mapped, mapped);
    }

    #[test]
    fn response_roundtrip_v6() {
        let request = build_check_request(false);
        let mapped: SocketAddr = "[2001:db8::dead:beef]:5000".parse().unwrap();
        let response = build_success_response(&request, mapped);

        let res = parse_binding_response(&response, KEY).unwrap();
        assert_eq!(res.mapped, mapped);
    }

    #[test]
    fn tampered_integrity_is_rejected() {
        let mut packet = build_check_request(false);
        // flip one bit inside the USERNAME value
        packet[HEADER_LEN + 5] ^= 0x01;
        assert_eq!(
            parse_binding_request(&packet, KEY),
            Err(ProtocolError::BadIntegrity)
        );
    }

    #[test]
    fn wrong_key_is_rejected() {
        let packet = build_check_request(false);
        assert_eq!(
            parse_binding_request(&packet, b"a different key"),
            Err(ProtocolError::BadIntegrity)
        );
    }

    #[test]
    fn tampered_fingerprint_is_rejected() {
        let mut packet = build_check_request(false);
        let last = packet.len() - 1;
        packet[last] ^= 0x01;
        assert_eq!(
            parse_binding_request(&packet, KEY),
            Err(ProtocolError::BadFingerprint)
        );
    }

    #[test]
    fn missing_integrity_with_key_is_rejected() {
        let attrs = FINGERPRINT_LEN;
        let mut packet = vec![0u8; HEADER_LEN + attrs];
        let at = write_binding_request(&mut rng(), &mut packet, attrs as u16);
        append_fingerprint(&mut packet, at);

        assert_eq!(
            parse_binding_request(&packet, KEY),
            Err(ProtocolError::MissingIntegrity)
        );
        // ...but fine without a session key
        assert!(parse_binding_request(&packet, &[]).is_ok());
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut packet = build_check_request(false);
        packet.push(0);
        assert_eq!(
            parse_binding_request(&packet, KEY),
            Err(ProtocolError::LengthMismatch)
        );

        let short = &packet[..HEADER_LEN - 1];
        assert!(!is_binding_request(short));
        assert_eq!(
            parse_binding_request(short, KEY),
            Err(ProtocolError::LengthMismatch)
        );
    }

    #[test]
    fn truncated_attribute_is_rejected() {
        let mut packet = vec![0u8; HEADER_LEN + 6];
        write_binding_request(&mut StepRng::new(1, 1), &mut packet, 6);
        packet[HEADER_LEN..HEADER_LEN + 4].copy_from_slice(&[0x00, 0x24, 0x00, 0x04]);

        assert_eq!(
            parse_binding_request(&packet, &[]),
            Err(ProtocolError::MalformedAttribute)
        );
    }

    #[test]
    fn integrity_must_precede_only_fingerprint() {
        // USERNAME placed after MESSAGE-INTEGRITY
        let attrs = MESSAGE_INTEGRITY_LEN + USERNAME_LEN;
        let mut packet = vec![0u8; HEADER_LEN + attrs];
        let mut at = write_binding_request(&mut rng(), &mut packet, attrs as u16);
        at = append_message_integrity(&mut packet, at, KEY);
        append_username(&mut packet, at, 1, 2);

        assert_eq!(
            parse_binding_request(&packet, KEY),
            Err(ProtocolError::MalformedAttribute)
        );
    }

    #[test]
    fn fingerprint_must_be_last() {
        let attrs = FINGERPRINT_LEN + ICE_PRIORITY_LEN;
        let mut packet = vec![0u8; HEADER_LEN + attrs];
        let mut at = write_binding_request(&mut rng(), &mut packet, attrs as u16);
        at = append_fingerprint(&mut packet, at);
        append_ice_priority(&mut packet, at, 99);

        assert_eq!(
            parse_binding_request(&packet, &[]),
            Err(ProtocolError::MalformedAttribute)
        );
    }

    #[test]
    fn response_without_mapped_address_is_rejected() {
        let attrs = MESSAGE_INTEGRITY_LEN + FINGERPRINT_LEN;
        let request = build_check_request(false);
        let mut packet = vec![0u8; HEADER_LEN + attrs];
        let mut at = write_binding_response(&mut packet, attrs as u16, &request);
        at = append_message_integrity(&mut packet, at, KEY);
        append_fingerprint(&mut packet, at);

        assert_eq!(
            parse_binding_response(&packet, KEY),
            Err(ProtocolError::MissingMappedAddress)
        );
    }

    #[test]
    fn unknown_family_is_rejected() {
        let request = build_check_request(false);
        let mapped: SocketAddr = "198.51.100.1:9".parse().unwrap();
        let mut packet = build_success_response(&request, mapped);
        // corrupt the family byte, then re-seal integrity + fingerprint
        packet[HEADER_LEN + 5] = 0x03;
        let mi_at = HEADER_LEN + XOR_MAPPED_ADDRESS_V4_LEN;
        let at = append_message_integrity(&mut packet, mi_at, KEY);
        append_fingerprint(&mut packet, at);

        assert_eq!(
            parse_binding_response(&packet, KEY),
            Err(ProtocolError::UnknownFamily(0x03))
        );
    }

    #[test]
    fn unknown_attributes_are_ignored() {
        let attrs = 8 + MESSAGE_INTEGRITY_LEN + FINGERPRINT_LEN;
        let mut packet = vec![0u8; HEADER_LEN + attrs];
        let mut at = write_binding_request(&mut rng(), &mut packet, attrs as u16);
        // SOFTWARE attribute with a 4-byte value
        packet[at..at + 4].copy_from_slice(&[0x80, 0x22, 0x00, 0x04]);
        packet[at + 4..at + 8].copy_from_slice(b"mesh");
        at += 8;
        at = append_message_integrity(&mut packet, at, KEY);
        append_fingerprint(&mut packet, at);

        assert!(parse_binding_request(&packet, KEY).is_ok());
    }
}
