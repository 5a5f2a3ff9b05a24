//! The secure-datagram seam between the reliable transport and DTLS.
//!
//! Everything above this trait treats the encrypted link as a lossy
//! datagram pipe with a size limit. The packet router is the only consumer
//! and the only caller of [`SecureDatagram::send`]/[`SecureDatagram::receive`],
//! so implementations need not be internally synchronised.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// A connected, encrypted, unreliable datagram transport.
pub trait SecureDatagram: Send {
    /// Sends one datagram; partial sends do not exist at this layer.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Receives one datagram into `buf`.
    ///
    /// Returns `Ok(None)` when `timeout` elapses without traffic; any other
    /// failure is a hard transport error.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    /// Largest datagram [`SecureDatagram::send`] accepts.
    fn send_limit(&self) -> usize;
}

/// Which side of the DTLS handshake a peer plays.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DtlsRole {
    /// Initiates the handshake.
    Client,
    /// Awaits the ClientHello.
    Server,
}

fn endpoint_key(endpoint: SocketAddr) -> (Vec<u8>, u16) {
    let addr = match endpoint.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    (addr, endpoint.port())
}

/// Plaintext [`SecureDatagram`] over a connected UDP socket.
///
/// Carries no confidentiality at all; it exists for loopback tests and
/// for debugging transport behaviour without a handshake in the way.
#[derive(Debug)]
pub struct PlainDatagram {
    socket: std::net::UdpSocket,
}

impl PlainDatagram {
    /// Connects `socket` to `remote` and wraps it.
    pub fn connect(
        socket: std::net::UdpSocket,
        remote: SocketAddr,
    ) -> io::Result<Self> {
        socket.connect(remote)?;
        Ok(Self { socket })
    }
}

impl SecureDatagram for PlainDatagram {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.socket.send(data).map(|_| ())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.socket.recv(buf) {
            Ok(len) => Ok(Some(len)),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn send_limit(&self) -> usize {
        1200
    }
}

/// Chooses the DTLS role from the two public endpoints.
///
/// Both peers learned both endpoints from the coordinator, so both compute
/// the same answer. The lexicographically lesser endpoint (address bytes,
/// then port) becomes the client. Local-vs-remote port comparison would not
/// work: NAT remapping can invert it between the two views.
#[must_use]
pub fn dtls_role(local_public: SocketAddr, remote_public: SocketAddr) -> DtlsRole {
    if endpoint_key(local_public) < endpoint_key(remote_public) {
        DtlsRole::Client
    } else {
        DtlsRole::Server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(text: &str) -> SocketAddr {
        text.parse().expect("socket addr")
    }

    #[test]
    fn lower_address_becomes_client() {
        assert_eq!(
            dtls_role(addr("10.0.0.1:9000"), addr("10.0.0.2:9000")),
            DtlsRole::Client
        );
        assert_eq!(
            dtls_role(addr("10.0.0.2:9000"), addr("10.0.0.1:9000")),
            DtlsRole::Server
        );
    }

    #[test]
    fn port_breaks_address_ties() {
        assert_eq!(
            dtls_role(addr("10.0.0.1:1000"), addr("10.0.0.1:2000")),
            DtlsRole::Client
        );
        assert_eq!(
            dtls_role(addr("10.0.0.1:2000"), addr("10.0.0.1:1000")),
            DtlsRole::Server
        );
    }

    #[test]
    fn both_sides_agree() {
        let pairs = [
            (addr("203.0.113.9:4000"), addr("198.51.100.7:5000")),
            (addr("[2001:db8::1]:1"), addr("[2001:db8::2]:1")),
            (addr("192.0.2.1:65535"), addr("192.0.2.1:1")),
        ];
        for (a, b) in pairs {
            let role_a = dtls_role(a, b);
            let role_b = dtls_role(b, a);
            assert_ne!(role_a, role_b, "{a} vs {b} must split roles");
        }
    }
}
