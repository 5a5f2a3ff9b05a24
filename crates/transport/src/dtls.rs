//! DTLS 1.2 PSK implementation of [`SecureDatagram`].
//!
//! The OpenSSL DTLS state machine runs over a small Read/Write shim around
//! a connected `UdpSocket`. During the handshake the shim enforces the hard
//! per-attempt deadline and discards any datagram whose first byte is not a
//! DTLS content type (`0x14..=0x17`) — those are stale PUNCH/PUNCH_ACK
//! frames and our own NAT-priming bytes still draining out of the path.
//! After the handshake the filter drops away; the socket is connected, so
//! the kernel already rejects datagrams from anyone but the confirmed
//! endpoint.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use openssl::error::ErrorStack;
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslStream, SslVersion,
};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::secure::{DtlsRole, SecureDatagram};
use crate::TransportError;

/// Ciphers offered for the PSK handshake; DTLS 1.2 AEAD suites only.
const PSK_CIPHER_LIST: &str = "PSK-AES128-GCM-SHA256:PSK-AES256-GCM-SHA384";

/// Hard deadline for one handshake attempt.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);

/// Number of handshake attempts before giving up.
const HANDSHAKE_ATTEMPTS: u32 = 3;

/// Base of the linear inter-attempt backoff (500 ms, 1 s, 1.5 s).
const HANDSHAKE_BACKOFF_STEP: Duration = Duration::from_millis(500);

/// NAT-priming datagrams sent before each attempt.
const PRIMING_DATAGRAMS: usize = 3;

/// Largest plaintext datagram the transport accepts.
const SEND_LIMIT: usize = 1200;

/// Path MTU told to OpenSSL so handshake flights stay under typical limits.
const DTLS_MTU: u32 = 1400;

/// Inputs for establishing the encrypted link.
pub struct DtlsConfig {
    /// Handshake side, derived from the public endpoints.
    pub role: DtlsRole,
    /// PSK identity presented by the client: the session id bytes.
    pub identity: Vec<u8>,
    /// The pre-shared key; wiped from memory on drop.
    pub psk: Zeroizing<Vec<u8>>,
}

struct UdpShim {
    socket: UdpSocket,
    handshaking: bool,
    deadline: Instant,
}

impl UdpShim {
    fn set_receive_timeout(&self, timeout: Duration) -> io::Result<()> {
        // Zero would mean "block forever" to the socket layer.
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket.set_read_timeout(Some(timeout))
    }
}

impl Read for UdpShim {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.handshaking {
                let now = Instant::now();
                if now >= self.deadline {
                    return Err(io::Error::new(
                        ErrorKind::TimedOut,
                        "handshake deadline elapsed",
                    ));
                }
                let slice = (self.deadline - now).min(Duration::from_millis(500));
                self.set_receive_timeout(slice)?;
            }

            match self.socket.recv(buf) {
                Ok(len) => {
                    if self.handshaking
                        && (len == 0 || !(0x14..=0x17).contains(&buf[0]))
                    {
                        // Stale punch traffic or priming bytes, not DTLS.
                        continue;
                    }
                    return Ok(len);
                }
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    if self.handshaking {
                        continue; // deadline re-checked at the top
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Write for UdpShim {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn psk_context(config: &DtlsConfig) -> Result<SslContext, ErrorStack> {
    let mut builder = SslContextBuilder::new(SslMethod::dtls())?;
    builder.set_min_proto_version(Some(SslVersion::DTLS1_2))?;
    builder.set_max_proto_version(Some(SslVersion::DTLS1_2))?;
    builder.set_cipher_list(PSK_CIPHER_LIST)?;
    builder.set_options(SslOptions::NO_QUERY_MTU);

    match config.role {
        DtlsRole::Client => {
            let identity = config.identity.clone();
            let key = config.psk.clone();
            builder.set_psk_client_callback(move |_ssl, _hint, identity_buf, psk_buf| {
                if identity.len() + 1 > identity_buf.len() || key.len() > psk_buf.len() {
                    return Ok(0);
                }
                identity_buf[..identity.len()].copy_from_slice(&identity);
                identity_buf[identity.len()] = 0;
                psk_buf[..key.len()].copy_from_slice(&key);
                Ok(key.len())
            });
        }
        DtlsRole::Server => {
            let identity = config.identity.clone();
            let key = config.psk.clone();
            builder.set_psk_server_callback(move |_ssl, client_identity, psk_buf| {
                if client_identity != Some(identity.as_slice()) {
                    warn!("psk identity mismatch from peer");
                    return Ok(0);
                }
                if key.len() > psk_buf.len() {
                    return Ok(0);
                }
                psk_buf[..key.len()].copy_from_slice(&key);
                Ok(key.len())
            });
        }
    }
    Ok(builder.build())
}

/// The established DTLS link.
pub struct DtlsTransport {
    stream: SslStream<UdpShim>,
}

impl DtlsTransport {
    /// Runs the handshake retry envelope and returns the encrypted link.
    ///
    /// The socket must already be bound to the punched local port; it is
    /// connected to `remote` here so all later traffic is source-filtered
    /// by the kernel.
    pub fn establish(
        socket: &UdpSocket,
        remote: SocketAddr,
        config: &DtlsConfig,
    ) -> Result<Self, TransportError> {
        socket.connect(remote)?;

        let mut deadline_hit = false;
        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            // Keep the NAT mapping warm; 0x00 is neither a DTLS content
            // type nor a valid framed packet, so both sides discard it.
            for _ in 0..PRIMING_DATAGRAMS {
                let _ = socket.send(&[0x00]);
            }

            match Self::attempt(socket, config) {
                Ok(transport) => {
                    info!(%remote, role = ?config.role, attempt, "dtls handshake complete");
                    return Ok(transport);
                }
                Err(err) => {
                    deadline_hit = err.kind() == ErrorKind::TimedOut;
                    warn!(%remote, attempt, %err, "dtls handshake attempt failed");
                }
            }

            if attempt < HANDSHAKE_ATTEMPTS {
                std::thread::sleep(HANDSHAKE_BACKOFF_STEP * attempt);
            }
        }

        Err(TransportError::HandshakeFailed(if deadline_hit {
            "deadline"
        } else {
            "attempts exhausted"
        }))
    }

    fn attempt(socket: &UdpSocket, config: &DtlsConfig) -> io::Result<Self> {
        let shim = UdpShim {
            socket: socket.try_clone()?,
            handshaking: true,
            deadline: Instant::now() + HANDSHAKE_DEADLINE,
        };

        let context = psk_context(config).map_err(io::Error::other)?;
        let mut ssl = Ssl::new(&context).map_err(io::Error::other)?;
        ssl.set_mtu(DTLS_MTU).map_err(io::Error::other)?;

        let mut stream = SslStream::new(ssl, shim).map_err(io::Error::other)?;
        let result = match config.role {
            DtlsRole::Client => stream.connect(),
            DtlsRole::Server => stream.accept(),
        };

        match result {
            Ok(()) => {
                stream.get_mut().handshaking = false;
                Ok(Self { stream })
            }
            Err(err) => {
                if let Some(io_err) = err.io_error() {
                    if io_err.kind() == ErrorKind::TimedOut {
                        return Err(io::Error::new(
                            ErrorKind::TimedOut,
                            "handshake deadline elapsed",
                        ));
                    }
                }
                Err(io::Error::other(err.to_string()))
            }
        }
    }
}

impl SecureDatagram for DtlsTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() > SEND_LIMIT {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "datagram exceeds send limit",
            ));
        }
        match self.stream.ssl_write(data) {
            Ok(written) if written == data.len() => Ok(()),
            Ok(written) => Err(io::Error::other(format!(
                "partial dtls write: {written} of {} bytes",
                data.len()
            ))),
            Err(err) => Err(err
                .into_io_error()
                .unwrap_or_else(|err| io::Error::other(err.to_string()))),
        }
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        self.stream.get_ref().set_receive_timeout(timeout)?;
        match self.stream.ssl_read(buf) {
            Ok(len) => Ok(Some(len)),
            Err(err) => {
                let timed_out = err
                    .io_error()
                    .is_some_and(|io_err| {
                        io_err.kind() == ErrorKind::WouldBlock
                            || io_err.kind() == ErrorKind::TimedOut
                    });
                if timed_out {
                    return Ok(None);
                }
                if err.code() == ErrorCode::ZERO_RETURN {
                    debug!("dtls peer closed the connection");
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "dtls connection closed",
                    ));
                }
                Err(err
                    .into_io_error()
                    .unwrap_or_else(|err| io::Error::other(err.to_string())))
            }
        }
    }

    fn send_limit(&self) -> usize {
        SEND_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(role: DtlsRole) -> DtlsConfig {
        DtlsConfig {
            role,
            identity: b"loopback-session".to_vec(),
            psk: Zeroizing::new(b"a shared secret of decent length".to_vec()),
        }
    }

    #[test]
    fn loopback_handshake_and_round_trip() {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();

        let server = thread::spawn(move || {
            let mut transport =
                DtlsTransport::establish(&b, addr_a, &config(DtlsRole::Server)).expect("server");
            let mut buf = [0u8; 1500];
            let len = transport
                .receive(&mut buf, Duration::from_secs(10))
                .expect("receive")
                .expect("datagram before timeout");
            transport.send(&buf[..len]).expect("echo");
        });

        let mut client =
            DtlsTransport::establish(&a, addr_b, &config(DtlsRole::Client)).expect("client");
        client.send(b"over the encrypted link").expect("send");

        let mut buf = [0u8; 1500];
        let len = client
            .receive(&mut buf, Duration::from_secs(10))
            .expect("receive")
            .expect("echo before timeout");
        assert_eq!(&buf[..len], b"over the encrypted link");
        server.join().expect("server thread");
    }

    #[test]
    fn receive_reports_timeout_as_none() {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();

        let server = thread::spawn(move || {
            DtlsTransport::establish(&b, addr_a, &config(DtlsRole::Server)).expect("server")
        });
        let mut client =
            DtlsTransport::establish(&a, addr_b, &config(DtlsRole::Client)).expect("client");
        let mut server_side = server.join().expect("server thread");

        let mut buf = [0u8; 64];
        assert!(matches!(
            client.receive(&mut buf, Duration::from_millis(50)),
            Ok(None)
        ));
        assert!(matches!(
            server_side.receive(&mut buf, Duration::from_millis(50)),
            Ok(None)
        ));
        assert_eq!(client.send_limit(), SEND_LIMIT);
    }
}
