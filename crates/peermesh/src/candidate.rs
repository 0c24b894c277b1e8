use std::net::{IpAddr, SocketAddr};

use crate::addr;
use crate::hash::murmur3_32;

const FAMILY_MASK: u32 = 0x03;
const FAMILY_V4: u32 = 0x01;
const FAMILY_V6: u32 = 0x02;

/// Candidate type preference, carried in the low byte of a candidate
/// priority. Higher is preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CandidateKind {
    Host = 0x7E,
    PeerReflexive = 0x6E,
    ServerReflexive = 0x64,
    Relayed = 0x00,
}

/// A potential transport address for connectivity, local or remote.
///
/// Priorities order candidates of one mesh strictly (ties broken by
/// insertion order); foundations group candidates that share an
/// underlying path and are stable across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: u32,
    pub priority: u32,
    pub addr: SocketAddr,
}

/// Priority of a host candidate: local preference in bits 8..32, the
/// Host type preference in the low byte.
pub(crate) fn priority_for_host_address(ip: &IpAddr) -> u32 {
    (addr::local_preference(ip) << 8) | CandidateKind::Host as u32
}

/// Swap the type preference of a priority, keeping the local
/// preference bits.
pub(crate) fn change_type_preference(priority: u32, kind: CandidateKind) -> u32 {
    (priority & !0xFF) | kind as u32
}

fn foundation(tag: &[u8; 8], ip: &IpAddr, seed: u32) -> u32 {
    let mut buf = [0u8; 24];
    buf[..8].copy_from_slice(tag);

    let len = match ip {
        IpAddr::V4(v4) => {
            buf[8..12].copy_from_slice(&v4.octets());
            12
        }
        IpAddr::V6(v6) => {
            buf[8..24].copy_from_slice(&v6.octets());
            24
        }
    };

    murmur3_32(&buf[..len], seed)
}

pub(crate) fn foundation_for_host(ip: &IpAddr) -> u32 {
    foundation(b"LOCALUDP", ip, 0)
}

/// Seeded with the host foundation so reflexive candidates group with
/// the socket they were discovered through.
pub(crate) fn foundation_for_server_reflexive(host_foundation: u32, ip: &IpAddr) -> u32 {
    foundation(b"SERVRFLX", ip, host_foundation)
}

pub(crate) fn foundation_for_peer_reflexive(ip: &IpAddr) -> u32 {
    foundation(b"PEERRFLX", ip, 0)
}

impl Candidate {
    /// Size of this candidate in a serialized address blob.
    pub fn encoded_len(&self) -> usize {
        match self.addr {
            SocketAddr::V4(_) => 14,
            SocketAddr::V6(_) => 26,
        }
    }

    /// Append the wire form: foundation, priority with the low two
    /// bits replaced by an address family tag, port, address bytes.
    /// All integers big-endian.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.foundation.to_be_bytes());

        let family = match self.addr {
            SocketAddr::V4(_) => FAMILY_V4,
            SocketAddr::V6(_) => FAMILY_V6,
        };
        out.extend_from_slice(&((self.priority & !FAMILY_MASK) | family).to_be_bytes());

        out.extend_from_slice(&self.addr.port().to_be_bytes());

        match self.addr.ip() {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
    }

    /// Decode one candidate from the front of `input`, returning it
    /// together with the number of bytes consumed. The family tag bits
    /// are cleared from the decoded priority.
    pub fn decode(input: &[u8]) -> Option<(Candidate, usize)> {
        if input.len() < 10 {
            return None;
        }

        let foundation = u32::from_be_bytes(input[0..4].try_into().ok()?);
        let tagged = u32::from_be_bytes(input[4..8].try_into().ok()?);
        let port = u16::from_be_bytes(input[8..10].try_into().ok()?);
        let priority = tagged & !FAMILY_MASK;

        match tagged & FAMILY_MASK {
            FAMILY_V4 => {
                if input.len() < 14 {
                    return None;
                }

                let octets: [u8; 4] = input[10..14].try_into().ok()?;
                Some((
                    Candidate {
                        foundation,
                        priority,
                        addr: SocketAddr::from((octets, port)),
                    },
                    14,
                ))
            }
            FAMILY_V6 => {
                if input.len() < 26 {
                    return None;
                }

                let octets: [u8; 16] = input[10..26].try_into().ok()?;
                Some((
                    Candidate {
                        foundation,
                        priority,
                        addr: SocketAddr::from((octets, port)),
                    },
                    26,
                ))
            }
            _ => None,
        }
    }
}
