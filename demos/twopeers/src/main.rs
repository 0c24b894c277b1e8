//! Two meshes on one host negotiate a loopback path and bounce an
//! acknowledged hello counter over the authenticated datagram
//! channel.
//!
//! Run with `RUST_LOG=debug` to watch the connectivity checks.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use peermesh::{Mesh, MeshState, PeerState};

const SESSION_KEY: &[u8] = b"twopeers-demo-session-key";
const ROUNDS: u32 = 20;

fn run_mesh(id: u64, address_tx: mpsc::Sender<Vec<u8>>, address_rx: mpsc::Receiver<Vec<u8>>) {
    let loopback = [IpAddr::V4(Ipv4Addr::LOCALHOST)];
    let mut mesh = Mesh::with_addresses(7, id, 0, &loopback).expect("create mesh");
    mesh.set_session_key(SESSION_KEY);
    mesh.start_session(None, 0).expect("start session");

    while mesh.update() != MeshState::StartComplete {
        thread::sleep(Duration::from_millis(5));
    }

    // the address exchange would normally run over a signaling channel
    address_tx
        .send(mesh.serialize_local_address())
        .expect("hand over local address");
    let remote_address = address_rx.recv().expect("receive remote address");

    let remote_id = (id + 1) % 2;
    let peer = mesh
        .connect_to_peer(remote_id, &remote_address)
        .expect("connect to peer");

    while mesh.peer_state(peer) == PeerState::Negotiating {
        mesh.update();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(mesh.peer_state(peer), PeerState::Connected);
    log::info!("mesh {id}: connected to peer {remote_id}");

    let mut acked = 0u32;
    while acked < ROUNDS && mesh.peer_state(peer) == PeerState::Connected {
        mesh.update();

        let mut progress = acked;
        if let Some(messages) = mesh.receive(peer) {
            for message in messages {
                let counter = u32::from_be_bytes(message[..4].try_into().expect("counter bytes"));
                progress = progress.max(counter);
                log::info!("mesh {id}: peer is at {counter}");
            }
        }
        acked = progress;

        // unreliable channel: keep resending until acknowledged
        let mut payload = Vec::with_capacity(10);
        payload.extend_from_slice(&(acked + 1).to_be_bytes());
        payload.extend_from_slice(b" hello");
        mesh.send_unreliable_data_to_peer(peer, &payload);

        thread::sleep(Duration::from_millis(20));
    }

    log::info!("mesh {id}: done after {ROUNDS} rounds");
}

fn main() {
    env_logger::init();

    let (first_tx, first_rx) = mpsc::channel();
    let (second_tx, second_rx) = mpsc::channel();

    let first = thread::spawn(move || run_mesh(1, first_tx, second_rx));
    let second = thread::spawn(move || run_mesh(0, second_tx, first_rx));

    first.join().expect("mesh 1 thread");
    second.join().expect("mesh 0 thread");
}
