use std::sync::Arc;

/// Connection establishment states, in pipeline order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Nothing has happened yet.
    Init,
    /// Registering and authenticating with the coordination server.
    Registering,
    /// Authenticated; waiting for the other peer to appear.
    WaitingPeer,
    /// Exchanging PUNCH datagrams at the peer's public endpoint.
    Punching,
    /// Running the DTLS handshake.
    Handshake,
    /// The encrypted reliable link is up.
    Connected,
    /// Establishment failed.
    Error,
}

impl ConnectionState {
    /// Stable lowercase name, used for status output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Registering => "registering",
            Self::WaitingPeer => "waiting_peer",
            Self::Punching => "punching",
            Self::Handshake => "handshake",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

/// Observer for connection state transitions.
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;
