//! The coordination server: a single-threaded UDP request loop.
//!
//! Every request fits in one datagram and every response fits in one
//! datagram. Responses to unauthenticated peers stay small — the only one
//! larger than a minimal request is the fixed 52-byte CHALLENGE — and
//! malformed datagrams are never answered at all, which keeps the server
//! useless as an amplification reflector.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, trace, warn};
use wire::{
    encode_endpoint_payload, AuthPayload, ChallengePayload, ErrorPayload, Packet, PacketType,
    RegisterPayload, MAX_DATAGRAM,
};
use zeroize::Zeroizing;

use crate::session::{PeerSlot, Session};
use crate::{verify_auth_hmac, ERROR_AUTH_FAILED, ERROR_SESSION_FULL};

/// Receive timeout of the request loop; also the sweep cadence.
const LOOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug)]
pub struct ServerConfig {
    /// Address the UDP socket binds to.
    pub bind_addr: SocketAddr,
    /// Pre-shared key every session authenticates against.
    pub psk: Zeroizing<Vec<u8>>,
    /// Idle span after which a whole session is dropped.
    pub session_timeout: Duration,
}

/// The rendezvous server.
pub struct CoordServer {
    socket: UdpSocket,
    sessions: DashMap<String, Session>,
    psk: Zeroizing<Vec<u8>>,
    session_timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl CoordServer {
    /// Binds the socket and prepares an empty session table.
    pub fn bind(config: ServerConfig) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr)?;
        socket.set_read_timeout(Some(LOOP_TIMEOUT))?;
        info!(addr = %socket.local_addr()?, "coordination server bound");
        Ok(Self {
            socket,
            sessions: DashMap::new(),
            psk: config.psk,
            session_timeout: config.session_timeout,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The actual bound address (useful when binding port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// A flag that makes [`CoordServer::run`] return at the next loop turn.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Runs the request loop until the stop flag is raised.
    pub fn run(&self) -> std::io::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM];
        while !self.stop.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, source)) => self.handle_datagram(&buf[..len], source),
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    self.sweep_idle_sessions();
                }
                Err(err) => return Err(err),
            }
        }
        info!("coordination server stopped");
        Ok(())
    }

    fn handle_datagram(&self, datagram: &[u8], source: SocketAddr) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                // Never answer garbage; log and move on.
                debug!(%source, %err, "dropping malformed datagram");
                return;
            }
        };

        match packet.packet_type {
            PacketType::CoordRegister => self.handle_register(&packet, source),
            PacketType::CoordAuth => self.handle_auth(&packet, source),
            PacketType::CoordKeepalive => self.handle_keepalive(source),
            PacketType::CoordPing => {
                trace!(%source, "ping");
                self.respond(source, PacketType::CoordPong, Vec::new());
            }
            other => {
                debug!(%source, ?other, "unexpected packet type at coordinator");
            }
        }
    }

    fn handle_register(&self, packet: &Packet, source: SocketAddr) {
        let register = match RegisterPayload::decode(&packet.payload) {
            Ok(register) => register,
            Err(err) => {
                debug!(%source, %err, "dropping bad register payload");
                return;
            }
        };

        let now = Instant::now();
        let mut session = self
            .sessions
            .entry(register.session_id.clone())
            .or_insert_with(|| Session::new(now));
        session.last_activity = now;

        if let Some(slot) = session.slot_for(source) {
            // Retransmitted REGISTER: hand back the same challenge.
            let nonce = slot.nonce;
            drop(session);
            trace!(%source, session = %register.session_id, "re-register, same nonce");
            self.respond(
                source,
                PacketType::CoordChallenge,
                ChallengePayload { nonce }.encode(),
            );
            return;
        }

        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let added = session.add_slot(PeerSlot {
            endpoint: source,
            nonce,
            authenticated: false,
            peer_info_sent: false,
        });
        drop(session);

        if added {
            info!(%source, session = %register.session_id, "peer registered");
            self.respond(
                source,
                PacketType::CoordChallenge,
                ChallengePayload { nonce }.encode(),
            );
        } else {
            debug!(%source, session = %register.session_id, "session full");
            self.respond_error(source, ERROR_SESSION_FULL, "Session full");
        }
    }

    fn handle_auth(&self, packet: &Packet, source: SocketAddr) {
        let auth = match AuthPayload::decode(&packet.payload) {
            Ok(auth) => auth,
            Err(err) => {
                debug!(%source, %err, "dropping bad auth payload");
                return;
            }
        };

        let Some(mut session) = self.sessions.get_mut(&auth.session_id) else {
            self.respond_error(source, ERROR_AUTH_FAILED, "Authentication failed");
            return;
        };
        session.last_activity = Instant::now();

        let Some(slot) = session.slot_for(source) else {
            drop(session);
            self.respond_error(source, ERROR_AUTH_FAILED, "Authentication failed");
            return;
        };

        if !verify_auth_hmac(&self.psk, &slot.nonce, &auth.session_id, &auth.hmac) {
            drop(session);
            warn!(%source, session = %auth.session_id, "authentication failed");
            self.respond_error(source, ERROR_AUTH_FAILED, "Authentication failed");
            return;
        }

        slot.authenticated = true;
        info!(%source, session = %auth.session_id, "peer authenticated");
        self.respond(
            source,
            PacketType::CoordOk,
            encode_endpoint_payload(source),
        );

        // Once both slots hold an authenticated peer, each side gets the
        // other's endpoint — exactly once.
        if session.fully_authenticated() {
            let pairs: Vec<(SocketAddr, SocketAddr)> = {
                let endpoints: Vec<SocketAddr> = session
                    .slots
                    .iter()
                    .flatten()
                    .map(|slot| slot.endpoint)
                    .collect();
                endpoints
                    .iter()
                    .filter_map(|&to| session.other_endpoint(to).map(|other| (to, other)))
                    .collect()
            };
            for (to, other) in pairs {
                let Some(slot) = session.slot_for(to) else {
                    continue;
                };
                if slot.peer_info_sent {
                    continue;
                }
                slot.peer_info_sent = true;
                info!(peer = %to, other = %other, session = %auth.session_id, "exchanging endpoints");
                self.respond(
                    to,
                    PacketType::CoordPeerInfo,
                    encode_endpoint_payload(other),
                );
            }
        }
    }

    fn handle_keepalive(&self, source: SocketAddr) {
        let now = Instant::now();
        for mut session in self.sessions.iter_mut() {
            let authenticated = session
                .slot_for(source)
                .is_some_and(|slot| slot.authenticated);
            if authenticated {
                session.last_activity = now;
                trace!(%source, "session refreshed by keepalive");
            }
        }
    }

    fn sweep_idle_sessions(&self) {
        let timeout = self.session_timeout;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.last_activity.elapsed() < timeout);
        let removed = before - self.sessions.len();
        if removed > 0 {
            info!(removed, "swept idle sessions");
        }
    }

    fn respond(&self, to: SocketAddr, packet_type: PacketType, payload: Vec<u8>) {
        let packet = Packet::control(packet_type, 0, payload);
        match packet.encode() {
            Ok(bytes) => {
                if let Err(err) = self.socket.send_to(&bytes, to) {
                    warn!(%to, %err, "response send failed");
                }
            }
            Err(err) => warn!(%err, "response encode failed"),
        }
    }

    fn respond_error(&self, to: SocketAddr, code: u16, message: &str) {
        self.respond(
            to,
            PacketType::CoordError,
            ErrorPayload {
                code,
                message: message.to_owned(),
            }
            .encode(),
        );
    }
}
