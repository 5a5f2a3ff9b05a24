//! Loopback integration tests for the coordination protocol.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use coord::{CoordClient, CoordFailure, CoordServer, ServerConfig};
use wire::{ChallengePayload, ErrorPayload, Packet, PacketType, RegisterPayload};
use zeroize::Zeroizing;

const PSK: &[u8] = b"the rendezvous pre-shared key";

struct RunningServer {
    addr: SocketAddr,
    stop: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RunningServer {
    fn start() -> Self {
        let server = CoordServer::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            psk: Zeroizing::new(PSK.to_vec()),
            session_timeout: Duration::from_secs(300),
        })
        .expect("bind server");
        let addr = server.local_addr().expect("local addr");
        let stop = server.stop_handle();
        let handle = thread::spawn(move || {
            server.run().expect("server loop");
        });
        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn client_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").expect("bind client")
}

#[test]
fn two_peers_exchange_endpoints() {
    let server = RunningServer::start();
    let socket_a = client_socket();
    let socket_b = client_socket();
    let addr_a = socket_a.local_addr().unwrap();
    let addr_b = socket_b.local_addr().unwrap();
    let server_addr = server.addr;

    let first = thread::spawn(move || {
        CoordClient::new(
            &socket_a,
            server_addr,
            "shared-session".into(),
            Zeroizing::new(PSK.to_vec()),
        )
        .coordinate()
        .expect("first peer coordinates")
    });
    let second = thread::spawn(move || {
        CoordClient::new(
            &socket_b,
            server_addr,
            "shared-session".into(),
            Zeroizing::new(PSK.to_vec()),
        )
        .coordinate()
        .expect("second peer coordinates")
    });

    let result_a = first.join().expect("first thread");
    let result_b = second.join().expect("second thread");

    assert_eq!(result_a.own_endpoint, addr_a);
    assert_eq!(result_b.own_endpoint, addr_b);
    assert_eq!(result_a.peer_endpoint, addr_b);
    assert_eq!(result_b.peer_endpoint, addr_a);
}

#[test]
fn third_peer_is_turned_away() {
    let server = RunningServer::start();
    let server_addr = server.addr;

    let socket_a = client_socket();
    let socket_b = client_socket();
    let a = thread::spawn(move || {
        CoordClient::new(
            &socket_a,
            server_addr,
            "crowded".into(),
            Zeroizing::new(PSK.to_vec()),
        )
        .coordinate()
        .expect("peer a")
    });
    let b = thread::spawn(move || {
        CoordClient::new(
            &socket_b,
            server_addr,
            "crowded".into(),
            Zeroizing::new(PSK.to_vec()),
        )
        .coordinate()
        .expect("peer b")
    });
    a.join().unwrap();
    b.join().unwrap();

    let socket_c = client_socket();
    let result = CoordClient::new(
        &socket_c,
        server_addr,
        "crowded".into(),
        Zeroizing::new(PSK.to_vec()),
    )
    .coordinate();
    match result {
        Err(CoordFailure::ServerRejected { code, message }) => {
            assert_eq!(code, 0x0001);
            assert_eq!(message, "Session full");
        }
        other => panic!("expected session-full rejection, got {other:?}"),
    }
}

#[test]
fn wrong_psk_is_rejected() {
    let server = RunningServer::start();
    let socket = client_socket();
    let result = CoordClient::new(
        &socket,
        server.addr,
        "locked".into(),
        Zeroizing::new(b"not the right key".to_vec()),
    )
    .coordinate();
    match result {
        Err(CoordFailure::ServerRejected { code, message }) => {
            assert_eq!(code, 0x0002);
            assert_eq!(message, "Authentication failed");
        }
        other => panic!("expected auth rejection, got {other:?}"),
    }
}

#[test]
fn re_register_returns_the_same_nonce() {
    let server = RunningServer::start();
    let socket = client_socket();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let register = Packet::control(
        PacketType::CoordRegister,
        0,
        RegisterPayload {
            session_id: "nonce-check".into(),
        }
        .encode(),
    )
    .encode()
    .unwrap();

    let mut nonces = Vec::new();
    let mut buf = [0u8; 1500];
    for _ in 0..2 {
        socket.send_to(&register, server.addr).unwrap();
        let (len, _) = socket.recv_from(&mut buf).expect("challenge");
        let packet = Packet::decode(&buf[..len]).expect("decode");
        assert_eq!(packet.packet_type, PacketType::CoordChallenge);
        let challenge = ChallengePayload::decode(&packet.payload).expect("payload");
        nonces.push(challenge.nonce);
    }
    assert_eq!(nonces[0], nonces[1], "retransmitted register keeps its nonce");
}

#[test]
fn ping_gets_pong_and_garbage_gets_silence() {
    let server = RunningServer::start();
    let socket = client_socket();
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();

    // Garbage first: no response may come back for it.
    socket.send_to(b"definitely not a packet", server.addr).unwrap();

    let ping = Packet::header_only(PacketType::CoordPing, 0).encode().unwrap();
    socket.send_to(&ping, server.addr).unwrap();

    let mut buf = [0u8; 1500];
    let (len, _) = socket.recv_from(&mut buf).expect("pong");
    let packet = Packet::decode(&buf[..len]).expect("decode");
    assert_eq!(packet.packet_type, PacketType::CoordPong);

    // Nothing else should be queued: the garbage stayed unanswered.
    assert!(socket.recv_from(&mut buf).is_err());
}

#[test]
fn error_payload_is_well_formed_on_the_wire() {
    let server = RunningServer::start();
    let socket = client_socket();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // AUTH for a session that does not exist.
    let auth = Packet::control(
        PacketType::CoordAuth,
        0,
        wire::AuthPayload {
            session_id: "ghost".into(),
            hmac: [0u8; 32],
        }
        .encode(),
    )
    .encode()
    .unwrap();
    socket.send_to(&auth, server.addr).unwrap();

    let mut buf = [0u8; 1500];
    let (len, _) = socket.recv_from(&mut buf).expect("error response");
    let packet = Packet::decode(&buf[..len]).expect("decode");
    assert_eq!(packet.packet_type, PacketType::CoordError);
    let error = ErrorPayload::decode(&packet.payload).expect("payload");
    assert_eq!(error.code, 0x0002);
}
