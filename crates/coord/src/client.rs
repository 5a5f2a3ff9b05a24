//! The client side of the rendezvous exchange.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};
use wire::{
    decode_endpoint_payload, AuthPayload, ChallengePayload, ErrorPayload, Packet, PacketType,
    RegisterPayload, MAX_DATAGRAM,
};
use zeroize::Zeroizing;

use crate::{compute_auth_hmac, CoordFailure};

/// Attempts for each request/response step.
const REQUEST_ATTEMPTS: u32 = 3;
/// Per-attempt response timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for the other peer to register and authenticate.
const PEER_WAIT: Duration = Duration::from_secs(120);
/// Session refresh cadence while waiting for the peer.
const WAIT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Socket timeout granularity while polling deadlines.
const POLL_SLICE: Duration = Duration::from_millis(500);

/// Result of a successful rendezvous.
#[derive(Clone, Copy, Debug)]
pub struct Coordinated {
    /// Our public endpoint as the server observed it.
    pub own_endpoint: SocketAddr,
    /// The other peer's public endpoint.
    pub peer_endpoint: SocketAddr,
}

/// Coordination client bound to an already-open UDP socket.
///
/// The socket matters: the NAT mapping created while talking to the server
/// is the mapping the peer will punch at, so hole punching must reuse this
/// exact socket afterwards.
pub struct CoordClient<'a> {
    socket: &'a UdpSocket,
    server: SocketAddr,
    session_id: String,
    psk: Zeroizing<Vec<u8>>,
    waiting_hook: Option<Box<dyn Fn() + Send>>,
}

impl<'a> CoordClient<'a> {
    /// Creates a client for one rendezvous attempt.
    #[must_use]
    pub fn new(
        socket: &'a UdpSocket,
        server: SocketAddr,
        session_id: String,
        psk: Zeroizing<Vec<u8>>,
    ) -> Self {
        Self {
            socket,
            server,
            session_id,
            psk,
            waiting_hook: None,
        }
    }

    /// Installs a hook invoked once when the client starts waiting for the
    /// other peer (i.e. it authenticated first).
    #[must_use]
    pub fn with_waiting_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        self.waiting_hook = Some(Box::new(hook));
        self
    }

    /// Runs the whole exchange: REGISTER, AUTH, then wait for PEER_INFO.
    pub fn coordinate(&self) -> Result<Coordinated, CoordFailure> {
        let nonce = self.register()?;
        let hmac = compute_auth_hmac(&self.psk, &nonce, &self.session_id);
        let (own_endpoint, early_peer) = self.authenticate(&hmac)?;
        info!(%own_endpoint, "authenticated with coordinator");

        let peer_endpoint = match early_peer {
            Some(peer) => peer,
            None => {
                if let Some(hook) = &self.waiting_hook {
                    hook();
                }
                self.wait_for_peer()?
            }
        };
        info!(%peer_endpoint, "peer endpoint received");
        Ok(Coordinated {
            own_endpoint,
            peer_endpoint,
        })
    }

    /// One datagram from the server before `deadline`, or `None`.
    fn recv_from_server(&self, deadline: Instant) -> Result<Option<Packet>, CoordFailure> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.socket
                .set_read_timeout(Some((deadline - now).min(POLL_SLICE)))?;

            let (len, source) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if source != self.server {
                trace!(%source, "ignoring datagram not from the server");
                continue;
            }
            match Packet::decode(&buf[..len]) {
                Ok(packet) => return Ok(Some(packet)),
                Err(err) => {
                    debug!(%err, "ignoring malformed datagram from server");
                }
            }
        }
    }

    fn rejected(packet: &Packet) -> CoordFailure {
        match ErrorPayload::decode(&packet.payload) {
            Ok(error) => CoordFailure::ServerRejected {
                code: error.code,
                message: error.message,
            },
            Err(_) => CoordFailure::ServerRejected {
                code: 0,
                message: "unreadable server error".to_owned(),
            },
        }
    }

    fn register(&self) -> Result<[u8; 32], CoordFailure> {
        let request = Packet::control(
            PacketType::CoordRegister,
            0,
            RegisterPayload {
                session_id: self.session_id.clone(),
            }
            .encode(),
        );
        let request_bytes = request.encode().map_err(|err| {
            CoordFailure::Io(std::io::Error::new(ErrorKind::InvalidInput, err))
        })?;

        for attempt in 1..=REQUEST_ATTEMPTS {
            debug!(attempt, session = %self.session_id, "registering");
            self.socket.send_to(&request_bytes, self.server)?;

            let deadline = Instant::now() + ATTEMPT_TIMEOUT;
            while let Some(packet) = self.recv_from_server(deadline)? {
                match packet.packet_type {
                    PacketType::CoordChallenge => {
                        if let Ok(challenge) = ChallengePayload::decode(&packet.payload) {
                            return Ok(challenge.nonce);
                        }
                        debug!("challenge payload unreadable, retrying");
                    }
                    PacketType::CoordError => return Err(Self::rejected(&packet)),
                    other => trace!(?other, "ignoring packet while registering"),
                }
            }
        }
        Err(CoordFailure::RegisterRetriesExhausted)
    }

    fn authenticate(
        &self,
        hmac: &[u8; 32],
    ) -> Result<(SocketAddr, Option<SocketAddr>), CoordFailure> {
        let request = Packet::control(
            PacketType::CoordAuth,
            0,
            AuthPayload {
                session_id: self.session_id.clone(),
                hmac: *hmac,
            }
            .encode(),
        );
        let request_bytes = request.encode().map_err(|err| {
            CoordFailure::Io(std::io::Error::new(ErrorKind::InvalidInput, err))
        })?;

        // PEER_INFO can overtake OK when the other peer authenticated first
        // and the server emits both back to back; keep whichever arrives.
        let mut early_peer = None;

        for attempt in 1..=REQUEST_ATTEMPTS {
            debug!(attempt, session = %self.session_id, "authenticating");
            self.socket.send_to(&request_bytes, self.server)?;

            let deadline = Instant::now() + ATTEMPT_TIMEOUT;
            while let Some(packet) = self.recv_from_server(deadline)? {
                match packet.packet_type {
                    PacketType::CoordOk => {
                        if let Ok(endpoint) = decode_endpoint_payload(&packet.payload) {
                            return Ok((endpoint, early_peer));
                        }
                        debug!("ok payload unreadable, retrying");
                    }
                    PacketType::CoordPeerInfo => {
                        if let Ok(endpoint) = decode_endpoint_payload(&packet.payload) {
                            early_peer = Some(endpoint);
                        }
                    }
                    PacketType::CoordError => return Err(Self::rejected(&packet)),
                    other => trace!(?other, "ignoring packet while authenticating"),
                }
            }
        }
        Err(CoordFailure::AuthRetriesExhausted)
    }

    fn wait_for_peer(&self) -> Result<SocketAddr, CoordFailure> {
        let deadline = Instant::now() + PEER_WAIT;
        let mut next_keepalive = Instant::now() + WAIT_KEEPALIVE_INTERVAL;
        let keepalive_bytes = Packet::header_only(PacketType::CoordKeepalive, 0)
            .encode()
            .map_err(|err| CoordFailure::Io(std::io::Error::new(ErrorKind::InvalidInput, err)))?;

        debug!("waiting for the peer to join");
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(CoordFailure::WaitingForPeerTimedOut);
            }
            if now >= next_keepalive {
                // Keep the session alive while the other peer dawdles.
                self.socket.send_to(&keepalive_bytes, self.server)?;
                next_keepalive = now + WAIT_KEEPALIVE_INTERVAL;
            }

            let slice_deadline = deadline.min(next_keepalive);
            match self.recv_from_server(slice_deadline)? {
                Some(packet) => match packet.packet_type {
                    PacketType::CoordPeerInfo => {
                        if let Ok(endpoint) = decode_endpoint_payload(&packet.payload) {
                            return Ok(endpoint);
                        }
                        debug!("peer info payload unreadable");
                    }
                    PacketType::CoordError => return Err(Self::rejected(&packet)),
                    other => trace!(?other, "ignoring packet while waiting for peer"),
                },
                None => continue,
            }
        }
    }
}
