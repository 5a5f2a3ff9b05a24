//! The whole pipeline on loopback: rendezvous, punch, DTLS, file transfer.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use coord::{CoordServer, ServerConfig};
use peer::{ConnectionState, Peer, PeerConfig};
use transfer::{FileReceiver, FileSender};
use zeroize::Zeroizing;

const PSK: &[u8] = b"pipeline pre-shared key";

fn start_server() -> (SocketAddr, Arc<std::sync::atomic::AtomicBool>) {
    let server = CoordServer::bind(ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        psk: Zeroizing::new(PSK.to_vec()),
        session_timeout: Duration::from_secs(300),
    })
    .expect("bind server");
    let addr = server.local_addr().unwrap();
    let stop = server.stop_handle();
    thread::spawn(move || server.run().expect("server loop"));
    (addr, stop)
}

fn peer_config(server: SocketAddr) -> PeerConfig {
    let mut config = PeerConfig::new("pipeline-test".into(), PSK.to_vec(), server);
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config
}

#[test]
fn end_to_end_over_dtls() {
    let (server_addr, stop) = start_server();

    let source_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("payload.bin");
    let content: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
    std::fs::write(&source, &content).unwrap();

    let states: Arc<Mutex<Vec<ConnectionState>>> = Arc::new(Mutex::new(Vec::new()));
    let state_log = Arc::clone(&states);
    let listener: peer::StateListener = Arc::new(move |state| {
        state_log.lock().unwrap().push(state);
    });

    let receive_output = output_dir.path().to_path_buf();
    let receiver_thread = thread::spawn(move || {
        let peer =
            Peer::connect(&peer_config(server_addr), None).expect("receiver connects");
        let received = FileReceiver::new(peer.channel().clone(), receive_output)
            .receive()
            .expect("receive");
        peer.close();
        received
    });

    let sender_peer =
        Peer::connect(&peer_config(server_addr), Some(listener)).expect("sender connects");
    let summary = FileSender::new(sender_peer.channel().clone())
        .send_file(&source)
        .expect("send");
    let received = receiver_thread.join().expect("receiver thread");
    sender_peer.close();
    stop.store(true, Ordering::Release);

    assert_eq!(summary.bytes, content.len() as u64);
    assert_eq!(std::fs::read(&received.path).unwrap(), content);

    let states = states.lock().unwrap();
    assert_eq!(states.first(), Some(&ConnectionState::Init));
    assert_eq!(states.last(), Some(&ConnectionState::Connected));
    let connected_at = states
        .iter()
        .position(|state| *state == ConnectionState::Connected)
        .unwrap();
    let punching_at = states
        .iter()
        .position(|state| *state == ConnectionState::Punching)
        .unwrap();
    assert!(punching_at < connected_at, "punching precedes connected");
}

#[test]
fn wrong_psk_fails_cleanly() {
    let (server_addr, stop) = start_server();

    let mut config = peer_config(server_addr);
    config.session_id = "mismatched".into();
    config.psk = Zeroizing::new(b"wrong key".to_vec());
    let result = Peer::connect(&config, None);
    assert!(
        matches!(result, Err(peer::PeerError::Coordination(_))),
        "wrong psk must be rejected during coordination"
    );

    stop.store(true, Ordering::Release);
}
