//! Whole-file transfers over a loopback datagram link.

use std::net::UdpSocket;
use std::path::Path;
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};
use transfer::{checkpoint_path, Checkpoint, FileReceiver, FileSender};
use transport::channel::ReliableChannel;
use transport::router::PacketRouter;
use transport::secure::PlainDatagram;

struct Link {
    sender_channel: ReliableChannel,
    receiver_channel: ReliableChannel,
    routers: Vec<PacketRouter>,
}

impl Link {
    fn open() -> Self {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();
        let left = PlainDatagram::connect(a, addr_b).unwrap();
        let right = PlainDatagram::connect(b, addr_a).unwrap();

        let router_a = PacketRouter::new(Box::new(left), 42);
        let router_b = PacketRouter::new(Box::new(right), 42);
        let sender_channel = ReliableChannel::new(router_a.clone());
        let receiver_channel = ReliableChannel::new(router_b.clone());
        router_a.start().unwrap();
        router_b.start().unwrap();

        Self {
            sender_channel,
            receiver_channel,
            routers: vec![router_a, router_b],
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.sender_channel.close();
        self.receiver_channel.close();
        for router in &self.routers {
            router.stop();
        }
        for router in &self.routers {
            router.await_stop();
        }
    }
}

fn pseudo_random_bytes(len: usize, seed: u64) -> Vec<u8> {
    // Deterministic xorshift content so failures are reproducible.
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn transfer_file(content: &[u8], name: &str) -> (Vec<u8>, std::path::PathBuf) {
    let source_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join(name);
    std::fs::write(&source, content).unwrap();

    let link = Link::open();
    let receiver = FileReceiver::new(
        link.receiver_channel.clone(),
        output_dir.path().to_path_buf(),
    );
    let receiver_thread = thread::spawn(move || receiver.receive().expect("receive"));

    let summary = FileSender::new(link.sender_channel.clone())
        .send_file(&source)
        .expect("send");
    let received = receiver_thread.join().expect("receiver thread");

    assert_eq!(summary.bytes, content.len() as u64);
    assert!(
        !checkpoint_path(&received.path).exists(),
        "verified transfer must delete its checkpoint"
    );

    let bytes = std::fs::read(&received.path).unwrap();
    // Keep the tempdir alive long enough to read the output.
    drop(output_dir);
    drop(source_dir);
    (bytes, received.path)
}

#[test]
fn transfers_every_interesting_size() {
    // Chunk here is the channel chunk limit over the plain transport.
    let chunk = 1100usize;
    let sizes = [
        0usize,
        1,
        chunk - 1,
        chunk,
        chunk + 1,
        3 * chunk,
        10 * chunk,
    ];

    for (index, &size) in sizes.iter().enumerate() {
        let content = pseudo_random_bytes(size, 0x5EED_0000 + index as u64);
        let (received, _) = transfer_file(&content, &format!("file-{size}.bin"));
        assert_eq!(received.len(), content.len(), "size {size}");
        assert_eq!(sha256(&received), sha256(&content), "digest for size {size}");
    }
}

#[test]
fn transfers_a_megabyte() {
    let content = pseudo_random_bytes(1_000_000, 0xBEEF);
    let (received, _) = transfer_file(&content, "big.bin");
    assert_eq!(sha256(&received), sha256(&content));
}

#[test]
fn resumes_from_an_accurate_checkpoint() {
    let content = pseudo_random_bytes(100_000, 0xCAFE);
    let source_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("resume.bin");
    std::fs::write(&source, &content).unwrap();

    // Pre-populate the first half plus a checkpoint that matches the offer.
    let output = output_dir.path().join("resume.bin");
    std::fs::write(&output, &content[..50_000]).unwrap();
    Checkpoint {
        file_size: content.len() as u64,
        sha256: sha256(&content),
        bytes_written: 50_000,
        filename: "resume.bin".into(),
    }
    .store(&output)
    .unwrap();

    let link = Link::open();
    let receiver = FileReceiver::new(
        link.receiver_channel.clone(),
        output_dir.path().to_path_buf(),
    );
    let receiver_thread = thread::spawn(move || receiver.receive().expect("receive"));

    let summary = FileSender::new(link.sender_channel.clone())
        .send_file(&source)
        .expect("send");
    let received = receiver_thread.join().expect("receiver thread");

    // Only the second half crossed the wire.
    assert_eq!(summary.bytes, 50_000);
    assert_eq!(std::fs::read(&received.path).unwrap(), content);
    assert!(!checkpoint_path(&received.path).exists());
}

#[test]
fn stale_checkpoint_is_ignored() {
    let content = pseudo_random_bytes(30_000, 0xD00D);
    let source_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("fresh.bin");
    std::fs::write(&source, &content).unwrap();

    // Checkpoint for a *different* source (wrong digest): must not resume.
    let output = output_dir.path().join("fresh.bin");
    std::fs::write(&output, vec![0u8; 10_000]).unwrap();
    Checkpoint {
        file_size: content.len() as u64,
        sha256: [0x77; 32],
        bytes_written: 10_000,
        filename: "fresh.bin".into(),
    }
    .store(&output)
    .unwrap();

    let link = Link::open();
    let receiver = FileReceiver::new(
        link.receiver_channel.clone(),
        output_dir.path().to_path_buf(),
    );
    let receiver_thread = thread::spawn(move || receiver.receive().expect("receive"));

    let summary = FileSender::new(link.sender_channel.clone())
        .send_file(&source)
        .expect("send");
    let received = receiver_thread.join().expect("receiver thread");

    // The whole file crossed the wire because the checkpoint was stale.
    assert_eq!(summary.bytes, content.len() as u64);
    assert_eq!(std::fs::read(&received.path).unwrap(), content);
}

#[test]
fn progress_reports_reach_the_hook() {
    let content = pseudo_random_bytes(200_000, 0xFEED);
    let source_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("progress.bin");
    std::fs::write(&source, &content).unwrap();

    let link = Link::open();
    let receiver = FileReceiver::new(
        link.receiver_channel.clone(),
        output_dir.path().to_path_buf(),
    );
    let receiver_thread = thread::spawn(move || receiver.receive().expect("receive"));

    let seen = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
    let seen_hook = std::sync::Arc::clone(&seen);
    let sender = FileSender::new(link.sender_channel.clone()).with_progress(Box::new(
        move |done, total| {
            assert!(done <= total);
            seen_hook.store(done, std::sync::atomic::Ordering::Relaxed);
        },
    ));
    sender.send_file(&source).expect("send");
    receiver_thread.join().expect("receiver thread");

    assert_eq!(
        seen.load(std::sync::atomic::Ordering::Relaxed),
        content.len() as u64,
        "the last progress report covers the whole file"
    );
}
