//! Peer connection orchestration.
//!
//! [`Peer::connect`] walks a fresh UDP socket through the whole
//! establishment pipeline: rendezvous at the coordination server, UDP hole
//! punch at the exchanged endpoint, a DTLS 1.2 PSK handshake in the
//! deterministically chosen role, and finally the packet router and
//! reliable channel the file transfer runs over.

mod config;
mod error;
mod state;

pub use config::PeerConfig;
pub use error::PeerError;
pub use state::{ConnectionState, StateListener};

use std::net::UdpSocket;

use coord::CoordClient;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};
use transport::channel::ReliableChannel;
use transport::dtls::{DtlsConfig, DtlsTransport};
use transport::punch::punch;
use transport::router::PacketRouter;
use transport::secure::dtls_role;
use transport::TransportError;

/// An established, encrypted peer link.
pub struct Peer {
    router: PacketRouter,
    channel: ReliableChannel,
}

impl Peer {
    /// Runs the full establishment pipeline on the calling thread.
    ///
    /// The optional listener observes every state transition; all
    /// transitions are emitted from this thread.
    pub fn connect(
        config: &PeerConfig,
        listener: Option<StateListener>,
    ) -> Result<Self, PeerError> {
        let emit = |state: ConnectionState| {
            if let Some(listener) = &listener {
                listener(state);
            }
        };
        emit(ConnectionState::Init);

        let socket = UdpSocket::bind(config.bind_addr)?;
        debug!(local = %socket.local_addr()?, "socket bound");

        emit(ConnectionState::Registering);
        let mut client = CoordClient::new(
            &socket,
            config.server_addr,
            config.session_id.clone(),
            config.psk.clone(),
        );
        if let Some(listener) = &listener {
            // The hook fires on this thread, inside coordinate(), exactly
            // when the client starts waiting for the other peer.
            let listener = std::sync::Arc::clone(listener);
            client = client.with_waiting_hook(move || {
                listener(ConnectionState::WaitingPeer);
            });
        }
        let coordinated = client
            .coordinate()
            .inspect_err(|_| emit(ConnectionState::Error))?;
        info!(
            own = %coordinated.own_endpoint,
            peer = %coordinated.peer_endpoint,
            "rendezvous complete"
        );

        emit(ConnectionState::Punching);
        let connection_id = OsRng.next_u32();
        let punched = punch(
            &socket,
            coordinated.peer_endpoint,
            connection_id,
            &config.punch,
        )
        .inspect_err(|_| emit(ConnectionState::Error))?;
        if !punched.success {
            emit(ConnectionState::Error);
            return Err(PeerError::Transport(TransportError::HolePunchTimeout {
                elapsed_ms: punched.elapsed.as_millis() as u64,
            }));
        }

        emit(ConnectionState::Handshake);
        // Role comes from the *public* endpoints both sides learned from
        // the coordinator; the punched port adaptation does not affect it.
        let role = dtls_role(coordinated.own_endpoint, coordinated.peer_endpoint);
        let dtls = DtlsTransport::establish(
            &socket,
            punched.confirmed_endpoint,
            &DtlsConfig {
                role,
                identity: config.session_id.clone().into_bytes(),
                psk: config.psk.clone(),
            },
        )
        .inspect_err(|_| emit(ConnectionState::Error))?;

        let router = PacketRouter::new(Box::new(dtls), connection_id);
        let channel = ReliableChannel::new(router.clone());
        router.start().inspect_err(|_| emit(ConnectionState::Error))?;

        emit(ConnectionState::Connected);
        info!(remote = %punched.confirmed_endpoint, ?role, "peer connected");
        Ok(Self { router, channel })
    }

    /// The reliable channel for file transfer.
    #[must_use]
    pub fn channel(&self) -> &ReliableChannel {
        &self.channel
    }

    /// Whether the router loop is still pumping.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.router.is_running()
    }

    /// Tears the connection down: closes the channel, stops the router and
    /// waits for the pump thread to exit. Every blocked waiter wakes with a
    /// closed-channel error.
    pub fn close(&self) {
        self.channel.close();
        self.router.stop();
        self.router.await_stop();
    }
}
