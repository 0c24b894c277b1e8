#![deny(unreachable_pub, unsafe_code)]

//! Authenticated peer-to-peer UDP connectivity with ICE-style NAT
//! traversal.
//!
//! A [`Mesh`] binds one UDP socket per local adapter address, learns
//! its server-reflexive addresses from an optional STUN host, and
//! hands the caller a serialized candidate blob. Once two meshes have
//! exchanged blobs over any out-of-band channel (and share a session
//! key distributed the same way), [`Mesh::connect_to_peer`] runs
//! STUN-framed connectivity checks across every compatible candidate
//! pair, nominates a working path, and then carries authenticated
//! unreliable datagrams over it while keeping the NAT binding alive.
//!
//! The mesh is single-threaded and cooperative: one thread owns it
//! and drives [`Mesh::update`] in a loop, and no call ever blocks.
//!
//! ```no_run
//! use peermesh::{Mesh, MeshState};
//!
//! let mut mesh = Mesh::new(16, 7, 0)?;
//! mesh.set_session_key(b"shared secret");
//! mesh.start_session(Some("stun.example.org"), 3478)?;
//!
//! loop {
//!     if mesh.update() == MeshState::StartComplete {
//!         break;
//!     }
//! }
//!
//! let _blob = mesh.serialize_local_address();
//! // ... exchange blobs with the remote side, then connect_to_peer
//! # Ok::<(), peermesh::Error>(())
//! ```

mod addr;
mod candidate;
mod check;
mod hash;
mod mesh;
mod peer;

pub use candidate::{Candidate, CandidateKind};
pub use mesh::{Mesh, MeshState, PeerHandle};
pub use peer::PeerState;

/// Errors surfaced to the caller.
///
/// Transient network and protocol failures are never surfaced: a
/// malformed or forged datagram is indistinguishable from packet
/// loss. A lost peer is reported through
/// [`Mesh::peer_state`] turning [`PeerState::Invalid`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Mesh creation failed: no usable adapters, a socket could not
    /// be bound, or the peer capacity is out of range.
    #[error("mesh unavailable: {reason}")]
    MeshUnavailable {
        reason: &'static str,
        #[source]
        source: Option<std::io::Error>,
    },
    /// The peer handle does not refer to a live slot, the address
    /// blob failed to parse, or no compatible candidate pair exists.
    #[error("invalid peer")]
    InvalidPeer,
    /// The operation is not valid in the mesh's current state.
    #[error("invalid mesh state")]
    StateInvalid,
}
