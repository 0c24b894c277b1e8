use std::cmp::{max, min};
use std::time::Instant;

use rand::rngs::StdRng;

use peermesh_stun as stun;

use crate::candidate::{change_type_preference, Candidate, CandidateKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckState {
    InProgress,
    Succeeded,
    Failed,
}

/// One candidate pair under test for a peer.
pub(crate) struct ConnectivityCheck {
    pub(crate) foundation: u64,
    pub(crate) priority: u64,
    /// When the next (re)transmission is due.
    pub(crate) deadline: Instant,
    pub(crate) state: CheckState,
    pub(crate) attempts: u8,
    /// Index into the mesh's local candidate list.
    pub(crate) local: usize,
    /// Index into the peer's remote candidate list.
    pub(crate) remote: usize,
    pub(crate) nominated: bool,
    /// Prebuilt Binding Request, resent verbatim on retransmission.
    pub(crate) request: Vec<u8>,
}

/// RFC-style pair priority. `G` is the controlling side's candidate
/// priority, `D` the controlled side's.
pub(crate) fn pair_priority(local: u32, remote: u32, controlling: bool) -> u64 {
    let (g, d) = if controlling {
        (u64::from(local), u64::from(remote))
    } else {
        (u64::from(remote), u64::from(local))
    };

    (min(g, d) << 32) + (max(g, d) << 1) + u64::from(g > d)
}

pub(crate) fn pair_foundation(local: u32, remote: u32) -> u64 {
    (u64::from(local) << 32) | u64::from(remote)
}

impl ConnectivityCheck {
    /// A fresh check in InProgress with its first transmission due
    /// immediately. The request packet is built separately.
    pub(crate) fn new(
        now: Instant,
        local_index: usize,
        remote_index: usize,
        local: &Candidate,
        remote: &Candidate,
        controlling: bool,
    ) -> Self {
        Self {
            foundation: pair_foundation(local.foundation, remote.foundation),
            priority: pair_priority(local.priority, remote.priority, controlling),
            deadline: now,
            state: CheckState::InProgress,
            attempts: 0,
            local: local_index,
            remote: remote_index,
            nominated: false,
            request: Vec::new(),
        }
    }

    /// (Re)build the prebuilt Binding Request for this pair. Includes
    /// USE-CANDIDATE once the check is nominated.
    pub(crate) fn rebuild_request(
        &mut self,
        rng: &mut StdRng,
        local_id: u64,
        remote_id: u64,
        controlling: bool,
        local_priority: u32,
        key: &[u8],
    ) {
        let attrs = stun::USERNAME_LEN
            + stun::ICE_CONTROL_LEN
            + stun::ICE_PRIORITY_LEN
            + if self.nominated { stun::USE_CANDIDATE_LEN } else { 0 }
            + stun::MESSAGE_INTEGRITY_LEN
            + stun::FINGERPRINT_LEN;

        let mut packet = vec![0u8; stun::HEADER_LEN + attrs];
        let mut at = stun::write_binding_request(rng, &mut packet, attrs as u16);
        at = stun::append_username(&mut packet, at, local_id, remote_id);
        // role ties are broken by the peer id
        at = stun::append_ice_control(&mut packet, at, controlling, local_id);
        at = stun::append_ice_priority(
            &mut packet,
            at,
            change_type_preference(local_priority, CandidateKind::PeerReflexive),
        );
        if self.nominated {
            at = stun::append_use_candidate(&mut packet, at);
        }
        at = stun::append_message_integrity(&mut packet, at, key);
        let at = stun::append_fingerprint(&mut packet, at);
        debug_assert_eq!(at, packet.len());

        self.request = packet;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn pair_priority_is_role_symmetric() {
        // swapping both the role and the operands must give the same
        // priority, so both sides agree on the pair ordering
        for (a, b) in [(0x7E00_7E, 0x7530_64), (5, 5), (1, u32::MAX)] {
            assert_eq!(pair_priority(a, b, true), pair_priority(b, a, false));
            assert_eq!(pair_priority(a, b, false), pair_priority(b, a, true));
        }
    }

    #[test]
    fn pair_priority_orders_by_weaker_side_first() {
        let strong = pair_priority(0x7E00_7E, 0x7E00_7E, true);
        let mixed = pair_priority(0x7E00_7E, 0x7530_64, true);
        let weak = pair_priority(0x7530_64, 0x7530_64, true);

        assert!(strong > mixed);
        assert!(mixed > weak);
    }

    #[test]
    fn pair_priority_breaks_ties_by_controlling_side() {
        let g_wins = pair_priority(10, 5, true);
        let d_wins = pair_priority(5, 10, true);
        assert_eq!(g_wins, d_wins + 1);
    }

    #[test]
    fn pair_foundation_concatenates() {
        assert_eq!(pair_foundation(0x1111_2222, 0x3333_4444), 0x1111_2222_3333_4444);
    }

    #[test]
    fn nominated_request_carries_use_candidate() {
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();
        let local = Candidate {
            foundation: 1,
            priority: 0x7530_7E,
            addr: "192.0.2.1:1000".parse().unwrap(),
        };
        let remote = Candidate {
            foundation: 2,
            priority: 0x7530_64,
            addr: "192.0.2.2:2000".parse().unwrap(),
        };

        let mut check = ConnectivityCheck::new(now, 0, 0, &local, &remote, true);
        check.rebuild_request(&mut rng, 7, 3, true, local.priority, b"key");
        let plain = check.request.clone();

        check.nominated = true;
        check.rebuild_request(&mut rng, 7, 3, true, local.priority, b"key");

        assert_eq!(check.request.len(), plain.len() + stun::USE_CANDIDATE_LEN);

        let req = stun::parse_binding_request(&check.request, b"key").unwrap();
        assert!(req.use_candidate);
        assert!(req.controlling);
        assert_eq!(req.incoming_username, 7);
        assert_eq!(req.target_username, 3);
        assert_eq!(
            req.priority,
            change_type_preference(local.priority, CandidateKind::PeerReflexive)
        );

        let plain_req = stun::parse_binding_request(&plain, b"key").unwrap();
        assert!(!plain_req.use_candidate);
    }
}
