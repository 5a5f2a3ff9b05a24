//! UDP hole punching.
//!
//! Both peers blast PUNCH datagrams at each other's public endpoint; the
//! outbound traffic opens each NAT's mapping so the inbound traffic can
//! land. Receiving anything of ours from the peer proves the path works:
//! a PUNCH is answered with a PUNCH_ACK for the other side's benefit, then
//! the loop returns success without waiting further.
//!
//! Symmetric NATs allocate a new external port per destination, so the
//! packet we receive may come from a different port than the coordinator
//! reported. The source IP must still match; a matching IP with a new port
//! re-targets the loop at the observed endpoint.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};
use wire::{looks_like_packet, Packet, PacketType, MAX_DATAGRAM};

use crate::TransportError;

/// Tuning knobs for the punch loop.
#[derive(Clone, Copy, Debug)]
pub struct HolePunchConfig {
    /// Gap between PUNCH transmissions; also the socket read timeout.
    pub interval: Duration,
    /// Overall deadline before the attempt is abandoned.
    pub timeout: Duration,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of a punch attempt.
#[derive(Clone, Copy, Debug)]
pub struct HolePunchResult {
    /// Whether bidirectional reachability was proven.
    pub success: bool,
    /// The peer endpoint to use from now on (port may have adapted).
    pub confirmed_endpoint: SocketAddr,
    /// Wall time the attempt took.
    pub elapsed: Duration,
}

/// Runs the blocking punch loop on the caller's thread.
///
/// The socket must already be bound to the same local port the coordinator
/// observed, or the peer's NAT mapping will not match.
pub fn punch(
    socket: &UdpSocket,
    remote: SocketAddr,
    connection_id: u32,
    config: &HolePunchConfig,
) -> Result<HolePunchResult, TransportError> {
    let start = Instant::now();
    let deadline = start + config.timeout;
    let mut remote = remote;
    let mut next_send = start;

    socket.set_read_timeout(Some(config.interval))?;
    let punch_bytes = Packet::header_only(PacketType::Punch, connection_id).encode()?;
    let ack_bytes = Packet::header_only(PacketType::PunchAck, connection_id).encode()?;

    debug!(%remote, "hole punch started");
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let now = Instant::now();
        if now >= deadline {
            debug!(%remote, "hole punch deadline elapsed");
            return Ok(HolePunchResult {
                success: false,
                confirmed_endpoint: remote,
                elapsed: now - start,
            });
        }

        if now >= next_send {
            socket.send_to(&punch_bytes, remote)?;
            next_send = now + config.interval;
        }

        let (len, source) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        if source.ip() != remote.ip() {
            trace!(%source, "ignoring datagram from unexpected address");
            continue;
        }
        if source.port() != remote.port() {
            // Symmetric NAT on the far side: the port the coordinator saw is
            // not the port facing us. Adopt what we actually observe.
            info!(expected = %remote, observed = %source, "peer port adapted");
            remote = source;
        }

        let datagram = &buf[..len];
        if !looks_like_packet(datagram) {
            trace!(len, "ignoring stray datagram");
            continue;
        }
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(%err, "ignoring malformed datagram during punch");
                continue;
            }
        };

        match packet.packet_type {
            PacketType::Punch => {
                // Their PUNCH reached us, so the path works in both
                // directions (ours opened their NAT). Tell them and stop.
                socket.send_to(&ack_bytes, remote)?;
                let elapsed = start.elapsed();
                info!(%remote, ?elapsed, "hole punch confirmed by peer punch");
                return Ok(HolePunchResult {
                    success: true,
                    confirmed_endpoint: remote,
                    elapsed,
                });
            }
            PacketType::PunchAck => {
                let elapsed = start.elapsed();
                info!(%remote, ?elapsed, "hole punch acknowledged");
                return Ok(HolePunchResult {
                    success: true,
                    confirmed_endpoint: remote,
                    elapsed,
                });
            }
            other => {
                trace!(?other, "ignoring non-punch packet during punch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn loopback_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").expect("bind loopback")
    }

    #[test]
    fn two_loopback_sockets_punch_through() {
        let a = loopback_socket();
        let b = loopback_socket();
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();
        let config = HolePunchConfig::default();

        let handle = thread::spawn(move || punch(&b, addr_a, 2, &config).expect("punch b"));
        let result_a = punch(&a, addr_b, 1, &config).expect("punch a");
        let result_b = handle.join().expect("join");

        assert!(result_a.success);
        assert!(result_b.success);
        assert_eq!(result_a.confirmed_endpoint, addr_b);
        assert_eq!(result_b.confirmed_endpoint, addr_a);
        assert!(result_a.elapsed < Duration::from_secs(5));
        assert!(result_b.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn unresponsive_peer_times_out_near_the_deadline() {
        let socket = loopback_socket();
        // A bound socket nobody reads from: packets arrive but no reply.
        let sink = loopback_socket();
        let config = HolePunchConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(300),
        };

        let result = punch(&socket, sink.local_addr().unwrap(), 3, &config).expect("punch");
        assert!(!result.success);
        assert!(result.elapsed >= config.timeout);
        assert!(result.elapsed < config.timeout + Duration::from_millis(200));
    }

    #[test]
    fn stray_datagrams_do_not_confirm_the_punch() {
        let socket = loopback_socket();
        let addr = socket.local_addr().unwrap();
        let noise = loopback_socket();
        // Same IP as the "peer" (loopback), so only the decode gate filters it.
        let peer = loopback_socket();
        let peer_addr = peer.local_addr().unwrap();

        let handle = thread::spawn(move || {
            for _ in 0..5 {
                let _ = noise.send_to(b"not ours", addr);
                thread::sleep(Duration::from_millis(10));
            }
            drop(peer);
        });

        let config = HolePunchConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(250),
        };
        let result = punch(&socket, peer_addr, 4, &config).expect("punch");
        handle.join().unwrap();
        assert!(!result.success, "garbage must not count as punch proof");
    }
}
