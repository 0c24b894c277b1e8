use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;

use peermesh_stun as stun;

use crate::addr;
use crate::candidate::{self, Candidate, CandidateKind};
use crate::check::{CheckState, ConnectivityCheck};
use crate::peer::{self, PeerConn, PeerState};
use crate::Error;

/// Retransmission interval while discovering and negotiating.
const STUN_RETRY_STARTING: Duration = Duration::from_millis(250);
/// Refresh interval for an established server-reflexive NAT mapping.
const STUN_RETRY_KEEPALIVE: Duration = Duration::from_secs(15);
/// First refresh after a successful discovery.
const STUN_REFRESH_AFTER_DISCOVERY: Duration = Duration::from_millis(500);
const STUN_MAX_ATTEMPTS: u8 = 5;
/// Window in which an inbound check can revive a peer whose own
/// checks all failed.
const PEER_CLOSE_WAIT: Duration = Duration::from_secs(3);
/// Keepalive cadence while connected.
const PEER_TRAFFIC_ABSENT: Duration = Duration::from_secs(1);
/// Inbound silence after which a peer is declared lost.
const PEER_RECV_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_PEERS: u32 = 255;
const MAX_CHECKS_PER_PEER: usize = 50;
/// Datagrams drained per socket per tick.
const RECV_BATCH: usize = 10;
const RECV_BUFFER: usize = 2048;

/// Mesh lifecycle state, as reported by [`Mesh::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshState {
    /// Created or between sessions.
    Created,
    /// Server-reflexive discovery in progress.
    Starting,
    /// Reported exactly once, on the Starting → Running edge.
    StartComplete,
    Running,
    Invalid,
}

/// Opaque reference to a peer connection.
///
/// Encodes the slot index and a sequence number, so a handle held
/// after its slot was recycled stops matching instead of aliasing the
/// new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(u32);

/// A bound local socket together with its host candidate and the
/// server-reflexive discovery state for that socket.
pub(crate) struct LocalCandidate {
    pub(crate) candidate: Candidate,
    pub(crate) socket: UdpSocket,
    /// Prebuilt discovery request (header + FINGERPRINT).
    binding_request: [u8; stun::HEADER_LEN + stun::FINGERPRINT_LEN],
    next_stun_attempt: Instant,
    attempts: u8,
    waiting_on_reflexive: bool,
    has_reflexive: bool,
}

/// A Binding Request that arrived before `connect_to_peer` was called
/// for its sender; replayed once the peer is created.
struct PendingBindingRequest {
    id: u64,
    source: SocketAddr,
    priority: u32,
    local_candidate: usize,
    use_candidate: bool,
}

/// Peer-to-peer UDP mesh with ICE-style connectivity establishment.
///
/// One thread owns the mesh and drives [`update`](Mesh::update);
/// every call is non-blocking. Address blobs from
/// [`serialize_local_address`](Mesh::serialize_local_address) are
/// exchanged out of band, after which
/// [`connect_to_peer`](Mesh::connect_to_peer) negotiates a working
/// path and the mesh carries authenticated unreliable datagrams.
pub struct Mesh {
    local_id: u64,
    state: MeshState,
    session_key: Vec<u8>,
    stun_v4: Option<SocketAddr>,
    stun_v6: Option<SocketAddr>,
    local_candidates: Vec<LocalCandidate>,
    /// Server-reflexive candidates discovered for local sockets,
    /// advertised in the local address blob.
    reflexive_candidates: Vec<Candidate>,
    peers: Vec<PeerConn>,
    pending_requests: Vec<PendingBindingRequest>,
    peer_sequence: u32,
    rng: StdRng,
}

impl Mesh {
    /// Create a mesh bound to every usable local adapter address.
    /// `port` 0 selects an ephemeral port per socket.
    pub fn new(max_peers: u32, local_id: u64, port: u16) -> Result<Self, Error> {
        let interfaces = local_ip_address::list_afinet_netifas().map_err(|_| {
            Error::MeshUnavailable {
                reason: "failed to enumerate adapters",
                source: None,
            }
        })?;

        let addresses: Vec<IpAddr> = interfaces
            .into_iter()
            .map(|(_, ip)| ip)
            .filter(addr::should_use_host_address)
            .collect();

        Self::with_addresses(max_peers, local_id, port, &addresses)
    }

    /// Create a mesh bound to the given addresses verbatim. The
    /// caller owns the address policy; [`Mesh::new`] applies the
    /// default host-candidate filter to enumerated adapters.
    pub fn with_addresses(
        max_peers: u32,
        local_id: u64,
        port: u16,
        addresses: &[IpAddr],
    ) -> Result<Self, Error> {
        if max_peers > MAX_PEERS {
            return Err(Error::MeshUnavailable {
                reason: "peer capacity above 255",
                source: None,
            });
        }
        if addresses.is_empty() {
            return Err(Error::MeshUnavailable {
                reason: "no usable adapter addresses",
                source: None,
            });
        }

        let bind_error = |source| Error::MeshUnavailable {
            reason: "failed to bind local socket",
            source: Some(source),
        };

        let now = Instant::now();
        let mut local_candidates = Vec::with_capacity(addresses.len());
        for ip in addresses {
            let socket = UdpSocket::bind((*ip, port)).map_err(bind_error)?;
            socket.set_nonblocking(true).map_err(bind_error)?;
            let bound = socket.local_addr().map_err(bind_error)?;

            local_candidates.push(LocalCandidate {
                candidate: Candidate {
                    foundation: candidate::foundation_for_host(ip),
                    priority: candidate::priority_for_host_address(ip),
                    addr: bound,
                },
                socket,
                binding_request: [0; stun::HEADER_LEN + stun::FINGERPRINT_LEN],
                next_stun_attempt: now,
                attempts: 0,
                waiting_on_reflexive: false,
                has_reflexive: false,
            });
        }

        // stable sort: priority ties keep enumeration order
        local_candidates.sort_by(|a, b| b.candidate.priority.cmp(&a.candidate.priority));

        log::debug!(
            "mesh {local_id:#x}: bound {} local candidate socket(s)",
            local_candidates.len()
        );

        Ok(Mesh {
            local_id,
            state: MeshState::Created,
            session_key: Vec::new(),
            stun_v4: None,
            stun_v6: None,
            local_candidates,
            reflexive_candidates: Vec::new(),
            peers: (0..max_peers).map(|_| PeerConn::vacant()).collect(),
            pending_requests: Vec::new(),
            peer_sequence: 1,
            rng: StdRng::from_entropy(),
        })
    }

    /// Set the symmetric session key shared by every mesh in the
    /// session. Distribute it out of band, before any peer connects.
    pub fn set_session_key(&mut self, key: &[u8]) {
        self.session_key = key.to_vec();
    }

    /// Begin a session. With a STUN host, server-reflexive discovery
    /// runs for every local socket before the mesh reports
    /// StartComplete; without one the next update completes
    /// immediately.
    pub fn start_session(&mut self, stun_host: Option<&str>, stun_port: u16) -> Result<(), Error> {
        if self.state != MeshState::Created {
            return Err(Error::StateInvalid);
        }

        self.stun_v4 = None;
        self.stun_v6 = None;

        if let Some(host) = stun_host {
            let (v4, v6) = resolve_stun_host(host, stun_port);
            self.stun_v4 = v4;
            self.stun_v6 = v6;

            let now = Instant::now();
            for local in &mut self.local_candidates {
                let at = stun::write_binding_request(
                    &mut self.rng,
                    &mut local.binding_request,
                    stun::FINGERPRINT_LEN as u16,
                );
                stun::append_fingerprint(&mut local.binding_request, at);

                if send_reflexive_request(local, self.stun_v4, self.stun_v6, now, STUN_RETRY_STARTING)
                {
                    local.waiting_on_reflexive = true;
                    local.attempts = 1;
                }
            }
        }

        self.state = MeshState::Starting;
        Ok(())
    }

    /// End the running session, returning to Created. Drops all peer
    /// state and queued messages; local sockets stay bound.
    pub fn end_session(&mut self) {
        if self.state == MeshState::Invalid {
            return;
        }

        for peer in &mut self.peers {
            *peer = PeerConn::vacant();
        }
        self.pending_requests.clear();
        self.reflexive_candidates.clear();
        for local in &mut self.local_candidates {
            local.waiting_on_reflexive = false;
            local.has_reflexive = false;
            local.attempts = 0;
        }

        self.state = MeshState::Created;
    }

    /// Drive the mesh: poll sockets, retransmit, time out. Never
    /// blocks; call repeatedly from the owning thread.
    pub fn update(&mut self) -> MeshState {
        match self.state {
            MeshState::Starting => self.update_starting(),
            MeshState::Running => {
                self.update_running();
                MeshState::Running
            }
            state => state,
        }
    }

    /// Size of the serialized local address blob. Zero until the mesh
    /// is Running.
    pub fn local_address_size(&self) -> usize {
        if self.state != MeshState::Running {
            return 0;
        }

        1 + self
            .local_candidates
            .iter()
            .map(|local| local.candidate.encoded_len())
            .sum::<usize>()
            + self
                .reflexive_candidates
                .iter()
                .map(Candidate::encoded_len)
                .sum::<usize>()
    }

    /// Serialize this mesh's candidates (host and server-reflexive)
    /// for out-of-band exchange with a peer. Empty until the mesh is
    /// Running.
    pub fn serialize_local_address(&self) -> Vec<u8> {
        let size = self.local_address_size();
        if size == 0 {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(size);
        out.push((self.local_candidates.len() + self.reflexive_candidates.len()) as u8);
        for local in &self.local_candidates {
            local.candidate.encode(&mut out);
        }
        for reflexive in &self.reflexive_candidates {
            reflexive.encode(&mut out);
        }

        debug_assert_eq!(out.len(), size);
        out
    }

    /// Start connecting to a peer from its serialized address blob.
    ///
    /// Fails with [`Error::InvalidPeer`] when the blob is malformed,
    /// the id collides with this mesh or a live peer, the peer table
    /// is full, or no candidate pair shares an address family.
    pub fn connect_to_peer(
        &mut self,
        remote_id: u64,
        remote_address: &[u8],
    ) -> Result<PeerHandle, Error> {
        if self.state != MeshState::Running {
            return Err(Error::StateInvalid);
        }
        if remote_id == self.local_id {
            return Err(Error::InvalidPeer);
        }

        // find a free slot, rejecting ids already in use
        let mut slot = None;
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Invalid {
                if slot.is_none() {
                    slot = Some(index);
                }
            } else if peer.id == remote_id {
                return Err(Error::InvalidPeer);
            }
        }
        let Some(slot) = slot else {
            return Err(Error::InvalidPeer);
        };

        // candidate count, then exactly that many candidates
        let (&count, mut rest) = remote_address.split_first().ok_or(Error::InvalidPeer)?;
        let mut remote_candidates = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (candidate, used) = Candidate::decode(rest).ok_or(Error::InvalidPeer)?;
            remote_candidates.push(candidate);
            rest = &rest[used..];
        }
        if !rest.is_empty() {
            return Err(Error::InvalidPeer);
        }

        let controlling = self.local_id > remote_id;
        let now = Instant::now();

        // pair every compatible combination of local and remote
        let mut checks = Vec::new();
        for (local_index, local) in self.local_candidates.iter().enumerate() {
            for (remote_index, remote) in remote_candidates.iter().enumerate() {
                if local.candidate.addr.is_ipv4() != remote.addr.is_ipv4() {
                    continue;
                }

                checks.push(ConnectivityCheck::new(
                    now,
                    local_index,
                    remote_index,
                    &local.candidate,
                    remote,
                    controlling,
                ));
            }
        }
        if checks.is_empty() {
            return Err(Error::InvalidPeer);
        }

        checks.sort_by(|a, b| b.priority.cmp(&a.priority));
        checks.truncate(MAX_CHECKS_PER_PEER);

        for check in &mut checks {
            check.rebuild_request(
                &mut self.rng,
                self.local_id,
                remote_id,
                controlling,
                self.local_candidates[check.local].candidate.priority,
                &self.session_key,
            );
        }

        let sequence = (slot as u32) | (self.peer_sequence << 8);
        self.peer_sequence = self.peer_sequence.wrapping_add(1);

        log::debug!(
            "mesh {:#x}: connecting to peer {remote_id:#x} ({} checks, controlling: {controlling})",
            self.local_id,
            checks.len()
        );

        self.peers[slot] = PeerConn {
            id: remote_id,
            state: PeerState::Negotiating,
            controlling,
            remote_candidates,
            checks,
            inbox: Vec::new(),
            selected_local: 0,
            selected_addr: None,
            keepalive: Vec::new(),
            sequence,
            send_deadline: None,
            recv_deadline: None,
        };

        // replay binding requests that raced ahead of this call
        let Mesh {
            peers,
            pending_requests,
            local_candidates,
            session_key,
            local_id,
            rng,
            ..
        } = self;
        let peer = &mut peers[slot];

        let mut index = 0;
        while index < pending_requests.len() {
            if pending_requests[index].id == remote_id {
                let request = pending_requests.remove(index);
                process_peer_stun_request(
                    peer,
                    &request,
                    local_candidates,
                    *local_id,
                    session_key,
                    rng,
                    now,
                );
            } else {
                index += 1;
            }
        }

        update_peer_negotiation(peer, local_candidates, *local_id, session_key, rng, now);

        Ok(PeerHandle(sequence))
    }

    /// Stop processing a peer. The remote side is not notified; it
    /// notices through its own receive timeout.
    pub fn disconnect_peer(&mut self, handle: PeerHandle) {
        if let Some(peer) = self.peer_for_handle_mut(handle) {
            peer.state = PeerState::Invalid;
        }
    }

    /// Connection state for a peer handle. Stale or foreign handles
    /// report Invalid.
    pub fn peer_state(&self, handle: PeerHandle) -> PeerState {
        self.peer_for_handle(handle)
            .map_or(PeerState::Invalid, |peer| peer.state)
    }

    /// Send an authenticated, unreliable datagram to a connected
    /// peer. Silently dropped unless the peer is Connected.
    pub fn send_unreliable_data_to_peer(&mut self, handle: PeerHandle, payload: &[u8]) {
        let Mesh {
            peers,
            local_candidates,
            session_key,
            local_id,
            ..
        } = self;

        let index = (handle.0 & 0xFF) as usize;
        let Some(peer) = peers.get_mut(index) else {
            return;
        };
        if peer.sequence != handle.0 || peer.state != PeerState::Connected {
            return;
        }
        let Some(target) = peer.selected_addr else {
            return;
        };

        let datagram = peer::seal_datagram(session_key, *local_id, payload);
        let _ = local_candidates[peer.selected_local]
            .socket
            .send_to(&datagram, target);
        peer.send_deadline = Some(Instant::now() + PEER_TRAFFIC_ABSENT);
    }

    /// Messages received from a peer during the last
    /// [`update`](Mesh::update). The slice is only valid until the
    /// next update, which recycles the storage.
    pub fn receive(&self, handle: PeerHandle) -> Option<&[Bytes]> {
        let peer = self.peer_for_handle(handle)?;
        if peer.state != PeerState::Connected || peer.inbox.is_empty() {
            return None;
        }

        Some(&peer.inbox)
    }

    /// The candidate pair a Connected peer settled on, as
    /// (local socket address, remote socket address).
    pub fn selected_path(&self, handle: PeerHandle) -> Option<(SocketAddr, SocketAddr)> {
        let peer = self.peer_for_handle(handle)?;
        if peer.state != PeerState::Connected {
            return None;
        }

        let local = self.local_candidates.get(peer.selected_local)?.candidate.addr;
        Some((local, peer.selected_addr?))
    }

    fn peer_for_handle(&self, handle: PeerHandle) -> Option<&PeerConn> {
        let index = (handle.0 & 0xFF) as usize;
        let peer = self.peers.get(index)?;
        (peer.sequence == handle.0).then_some(peer)
    }

    fn peer_for_handle_mut(&mut self, handle: PeerHandle) -> Option<&mut PeerConn> {
        let index = (handle.0 & 0xFF) as usize;
        let peer = self.peers.get_mut(index)?;
        (peer.sequence == handle.0).then(|| peer)
    }

    fn update_starting(&mut self) -> MeshState {
        let now = Instant::now();
        let mut buf = [0u8; 128];
        let mut still_waiting = false;

        for local in &mut self.local_candidates {
            if !local.waiting_on_reflexive {
                continue;
            }

            match local.socket.recv_from(&mut buf) {
                Ok((read, source)) => {
                    let from_stun_host =
                        Some(source) == self.stun_v4 || Some(source) == self.stun_v6;
                    if from_stun_host && stun::is_binding_response(&buf[..read]) {
                        // server responses carry no session integrity
                        if let Ok(response) = stun::parse_binding_response(&buf[..read], &[]) {
                            local.waiting_on_reflexive = false;
                            local.has_reflexive = true;
                            local.next_stun_attempt = now + STUN_REFRESH_AFTER_DISCOVERY;

                            log::debug!(
                                "mesh {:#x}: server-reflexive address {} for {}",
                                self.local_id,
                                response.mapped,
                                local.candidate.addr
                            );

                            self.reflexive_candidates.push(Candidate {
                                foundation: candidate::foundation_for_server_reflexive(
                                    local.candidate.foundation,
                                    &response.mapped.ip(),
                                ),
                                priority: candidate::change_type_preference(
                                    local.candidate.priority,
                                    CandidateKind::ServerReflexive,
                                ),
                                addr: response.mapped,
                            });
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => local.waiting_on_reflexive = false,
            }

            if local.waiting_on_reflexive && now >= local.next_stun_attempt {
                local.attempts += 1;
                if local.attempts > STUN_MAX_ATTEMPTS
                    || !send_reflexive_request(
                        local,
                        self.stun_v4,
                        self.stun_v6,
                        now,
                        STUN_RETRY_STARTING,
                    )
                {
                    local.waiting_on_reflexive = false;
                }
            }

            if local.waiting_on_reflexive {
                still_waiting = true;
            }
        }

        if still_waiting {
            return MeshState::Starting;
        }

        self.reflexive_candidates
            .sort_by(|a, b| b.priority.cmp(&a.priority));
        self.state = MeshState::Running;
        MeshState::StartComplete
    }

    fn update_running(&mut self) {
        let now = Instant::now();

        // refresh server-reflexive NAT mappings
        for local in &mut self.local_candidates {
            if local.has_reflexive && now >= local.next_stun_attempt {
                send_reflexive_request(
                    local,
                    self.stun_v4,
                    self.stun_v6,
                    now,
                    STUN_RETRY_KEEPALIVE,
                );
            }
        }

        // recycle messages delivered last tick
        for peer in &mut self.peers {
            peer.inbox.clear();
        }

        self.drain_sockets(now);

        let Mesh {
            peers,
            local_candidates,
            session_key,
            local_id,
            rng,
            ..
        } = self;

        for peer in peers.iter_mut() {
            match peer.state {
                PeerState::Negotiating => {
                    update_peer_negotiation(
                        peer,
                        local_candidates,
                        *local_id,
                        session_key,
                        rng,
                        now,
                    );

                    if peer.send_deadline.is_some_and(|deadline| now > deadline) {
                        log::debug!("mesh {local_id:#x}: peer {:#x} unreachable", peer.id);
                        peer.state = PeerState::Invalid;
                    }
                }
                PeerState::Connected => {
                    if peer.send_deadline.map_or(true, |deadline| now > deadline) {
                        if let Some(target) = peer.selected_addr {
                            let _ = local_candidates[peer.selected_local]
                                .socket
                                .send_to(&peer.keepalive, target);
                        }
                        peer.send_deadline = Some(now + PEER_TRAFFIC_ABSENT);
                    }

                    if peer.recv_deadline.is_some_and(|deadline| now > deadline) {
                        log::debug!("mesh {local_id:#x}: peer {:#x} receive timeout", peer.id);
                        peer.state = PeerState::Invalid;
                    }
                }
                PeerState::Invalid => {}
            }
        }
    }

    fn drain_sockets(&mut self, now: Instant) {
        let mut buf = [0u8; RECV_BUFFER];

        for index in 0..self.local_candidates.len() {
            for _ in 0..RECV_BATCH {
                let (read, source) = match self.local_candidates[index].socket.recv_from(&mut buf)
                {
                    Ok(result) => result,
                    Err(_) => break,
                };

                // late STUN server traffic is not peer traffic
                if Some(source) == self.stun_v4 || Some(source) == self.stun_v6 {
                    continue;
                }

                let datagram = &buf[..read];
                if stun::is_binding_request(datagram) {
                    self.handle_binding_request(index, datagram, source, now);
                } else if stun::is_binding_response(datagram) {
                    self.handle_binding_response(datagram, now);
                } else if peer::is_media_datagram(datagram) {
                    self.handle_media_datagram(datagram, source, now);
                }
            }
        }
    }

    fn handle_binding_request(
        &mut self,
        local_index: usize,
        datagram: &[u8],
        source: SocketAddr,
        now: Instant,
    ) {
        let request = match stun::parse_binding_request(datagram, &self.session_key) {
            Ok(request) => request,
            Err(err) => {
                log::trace!("dropping binding request from {source}: {err}");
                return;
            }
        };

        if request.target_username != self.local_id {
            return;
        }

        // tell the sender which reflexive address we observed
        let mapped_len = if source.is_ipv4() {
            stun::XOR_MAPPED_ADDRESS_V4_LEN
        } else {
            stun::XOR_MAPPED_ADDRESS_V6_LEN
        };
        let attrs = mapped_len + stun::MESSAGE_INTEGRITY_LEN + stun::FINGERPRINT_LEN;

        let mut response = vec![0u8; stun::HEADER_LEN + attrs];
        let mut at = stun::write_binding_response(&mut response, attrs as u16, datagram);
        at = stun::append_xor_mapped_address(&mut response, at, source);
        at = stun::append_message_integrity(&mut response, at, &self.session_key);
        stun::append_fingerprint(&mut response, at);

        if self.local_candidates[local_index]
            .socket
            .send_to(&response, source)
            .is_err()
        {
            return;
        }

        let pending = PendingBindingRequest {
            id: request.incoming_username,
            source,
            priority: request.priority,
            local_candidate: local_index,
            use_candidate: request.use_candidate,
        };

        let Mesh {
            peers,
            pending_requests,
            local_candidates,
            session_key,
            local_id,
            rng,
            ..
        } = self;

        match peers
            .iter_mut()
            .find(|peer| peer.state != PeerState::Invalid && peer.id == pending.id)
        {
            Some(peer) => {
                peer.recv_deadline = Some(now + PEER_RECV_TIMEOUT);
                process_peer_stun_request(
                    peer,
                    &pending,
                    local_candidates,
                    *local_id,
                    session_key,
                    rng,
                    now,
                );
            }
            None => {
                log::debug!(
                    "mesh {local_id:#x}: queueing check from unknown peer {:#x}",
                    pending.id
                );
                pending_requests.push(pending);
            }
        }
    }

    fn handle_binding_response(&mut self, datagram: &[u8], now: Instant) {
        if let Err(err) = stun::parse_binding_response(datagram, &self.session_key) {
            log::trace!("dropping binding response: {err}");
            return;
        }

        let Mesh {
            peers,
            local_candidates,
            session_key,
            local_id,
            rng,
            ..
        } = self;

        // match the transaction id against every outstanding check
        let mut found = None;
        'peers: for (peer_index, peer) in peers.iter().enumerate() {
            for (check_index, check) in peer.checks.iter().enumerate() {
                if stun::matches_transaction_id(datagram, &check.request) {
                    found = Some((peer_index, check_index));
                    break 'peers;
                }
            }
        }
        let Some((peer_index, check_index)) = found else {
            return;
        };

        let peer = &mut peers[peer_index];
        peer.recv_deadline = Some(now + PEER_RECV_TIMEOUT);
        if peer.state != PeerState::Negotiating {
            return;
        }

        let nominated = {
            let check = &mut peer.checks[check_index];
            check.state = CheckState::Succeeded;
            check.nominated
        };

        if peer.controlling && nominated {
            let check = &peer.checks[check_index];
            let selected_local = check.local;
            let remote_addr = peer.remote_candidates[check.remote].addr;
            connect_peer(peer, selected_local, remote_addr, *local_id, session_key, rng, now);
        }
    }

    fn handle_media_datagram(&mut self, datagram: &[u8], source: SocketAddr, now: Instant) {
        let Some(peer) = self
            .peers
            .iter_mut()
            .find(|peer| peer.state != PeerState::Invalid && peer.selected_addr == Some(source))
        else {
            return;
        };

        if let Some(payload) = peer::open_datagram(&self.session_key, peer.id, datagram) {
            peer.inbox.push(payload);
            peer.recv_deadline = Some(now + PEER_RECV_TIMEOUT);
        }
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        // closing a socket can block on some platforms; hand them to
        // a detached thread so teardown never stalls the owner
        let sockets: Vec<UdpSocket> = self
            .local_candidates
            .drain(..)
            .map(|local| local.socket)
            .collect();
        if !sockets.is_empty() {
            std::thread::spawn(move || drop(sockets));
        }
    }
}

/// First v4 and v6 result for the STUN host.
fn resolve_stun_host(host: &str, port: u16) -> (Option<SocketAddr>, Option<SocketAddr>) {
    let mut v4 = None;
    let mut v6 = None;

    if let Ok(resolved) = (host, port).to_socket_addrs() {
        for addr in resolved {
            match addr {
                SocketAddr::V4(_) if v4.is_none() => v4 = Some(addr),
                SocketAddr::V6(_) if v6.is_none() => v6 = Some(addr),
                _ => {}
            }
        }
    }

    (v4, v6)
}

/// Send the prebuilt discovery request to the STUN address matching
/// the candidate's family. False when no such address is configured.
fn send_reflexive_request(
    local: &mut LocalCandidate,
    stun_v4: Option<SocketAddr>,
    stun_v6: Option<SocketAddr>,
    now: Instant,
    retry: Duration,
) -> bool {
    let target = match local.candidate.addr {
        SocketAddr::V4(_) => stun_v4,
        SocketAddr::V6(_) => stun_v6,
    };
    let Some(target) = target else {
        return false;
    };

    // a lost request surfaces as an absent response
    let _ = local.socket.send_to(&local.binding_request, target);
    local.next_stun_attempt = now + retry;
    true
}

/// Transition a negotiating peer to Connected on the given pair.
fn connect_peer(
    peer: &mut PeerConn,
    selected_local: usize,
    remote_addr: SocketAddr,
    local_id: u64,
    key: &[u8],
    rng: &mut StdRng,
    now: Instant,
) {
    peer.selected_local = selected_local;
    peer.selected_addr = Some(remote_addr);
    peer.keepalive = peer::build_keepalive(rng, local_id, peer.id, key);
    peer.state = PeerState::Connected;
    peer.checks.clear();
    peer.send_deadline = Some(now + PEER_TRAFFIC_ABSENT);
    peer.recv_deadline = Some(now + PEER_RECV_TIMEOUT);

    log::debug!("mesh {local_id:#x}: peer {:#x} connected via {remote_addr}", peer.id);
}

/// Drive a negotiating peer's check list: retransmit due checks, fail
/// exhausted ones, and once the list settles either nominate (as the
/// controlling side) or arm the close-wait deadline.
fn update_peer_negotiation(
    peer: &mut PeerConn,
    locals: &[LocalCandidate],
    local_id: u64,
    key: &[u8],
    rng: &mut StdRng,
    now: Instant,
) {
    let mut complete = true;
    let mut pending = false;

    for check in &mut peer.checks {
        if check.state == CheckState::InProgress {
            complete = false;

            if now >= check.deadline {
                check.attempts += 1;
                if check.attempts > STUN_MAX_ATTEMPTS {
                    check.state = CheckState::Failed;
                    continue;
                }

                let target = peer.remote_candidates[check.remote].addr;
                match locals[check.local].socket.send_to(&check.request, target) {
                    Err(err) if err.kind() != io::ErrorKind::WouldBlock => {
                        check.state = CheckState::Failed;
                        continue;
                    }
                    _ => {}
                }

                check.deadline = now + STUN_RETRY_STARTING;
            }
        }

        if check.state != CheckState::Failed {
            pending = true;
        }
    }

    if !complete {
        return;
    }

    if !pending {
        // every pair failed: close-wait, an inbound check may still
        // revive the peer through a symmetric NAT
        if peer.send_deadline.is_none() {
            log::debug!("mesh {local_id:#x}: peer {:#x} entering close-wait", peer.id);
            peer.send_deadline = Some(now + PEER_CLOSE_WAIT);
        }
    } else if peer.controlling {
        // nominate the best succeeded pair: drop the rest and re-run
        // it with USE-CANDIDATE
        if let Some(index) = peer
            .checks
            .iter()
            .position(|check| check.state == CheckState::Succeeded)
        {
            let mut check = peer.checks.remove(index);
            peer.checks.clear();

            check.nominated = true;
            check.state = CheckState::InProgress;
            check.attempts = 0;
            check.deadline = now;
            check.rebuild_request(
                rng,
                local_id,
                peer.id,
                peer.controlling,
                locals[check.local].candidate.priority,
                key,
            );

            log::debug!(
                "mesh {local_id:#x}: nominating pair {} -> {} (foundation {:#018x}) for peer {:#x}",
                locals[check.local].candidate.addr,
                peer.remote_candidates[check.remote].addr,
                check.foundation,
                peer.id
            );

            peer.checks.push(check);
        }
    }
}

/// React to an authenticated Binding Request from a peer: record
/// peer-reflexive candidates, revive or schedule the matching check,
/// and honor a nomination when controlled.
fn process_peer_stun_request(
    peer: &mut PeerConn,
    request: &PendingBindingRequest,
    locals: &[LocalCandidate],
    local_id: u64,
    key: &[u8],
    rng: &mut StdRng,
    now: Instant,
) {
    if peer.state != PeerState::Negotiating {
        return;
    }

    let remote_index = match peer
        .remote_candidates
        .iter()
        .position(|candidate| candidate.addr == request.source)
    {
        Some(index) => index,
        None => {
            // a source the peer never advertised: peer-reflexive
            log::debug!(
                "mesh {local_id:#x}: peer-reflexive candidate {} for peer {:#x}",
                request.source,
                peer.id
            );

            peer.remote_candidates.push(Candidate {
                foundation: candidate::foundation_for_peer_reflexive(&request.source.ip()),
                priority: request.priority,
                addr: request.source,
            });
            peer.remote_candidates.len() - 1
        }
    };

    let position = peer
        .checks
        .iter()
        .position(|check| check.local == request.local_candidate && check.remote == remote_index);

    let check_index = match position {
        Some(index) => {
            let revived = {
                let check = &mut peer.checks[index];
                match check.state {
                    CheckState::Failed => {
                        check.state = CheckState::InProgress;
                        check.deadline = now;
                        check.attempts = 0;
                        true
                    }
                    CheckState::InProgress => {
                        check.deadline = now;
                        check.attempts = 0;
                        false
                    }
                    CheckState::Succeeded => false,
                }
            };

            if revived {
                // leave close-wait; the pair is live again
                peer.send_deadline = None;
            }

            index
        }
        None => {
            let local = &locals[request.local_candidate];
            let remote = peer.remote_candidates[remote_index];

            let mut check = ConnectivityCheck::new(
                now,
                request.local_candidate,
                remote_index,
                &local.candidate,
                &remote,
                peer.controlling,
            );
            check.rebuild_request(
                rng,
                local_id,
                peer.id,
                peer.controlling,
                local.candidate.priority,
                key,
            );

            // keep the list sorted by descending pair priority
            let at = peer
                .checks
                .partition_point(|existing| existing.priority > check.priority);
            peer.checks.insert(at, check);
            at
        }
    };

    if !peer.controlling && request.use_candidate {
        let (selected_local, remote_addr) = {
            let check = &mut peer.checks[check_index];
            check.nominated = true;
            (check.local, peer.remote_candidates[check.remote].addr)
        };

        connect_peer(peer, selected_local, remote_addr, local_id, key, rng, now);
    }
}
