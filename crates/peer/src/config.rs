use std::net::SocketAddr;

use transport::punch::HolePunchConfig;
use zeroize::Zeroizing;

/// Everything needed to establish one peer connection.
#[derive(Debug)]
pub struct PeerConfig {
    /// Session id both peers agreed on out of band.
    pub session_id: String,
    /// Pre-shared key; authenticates the rendezvous and keys the DTLS link.
    pub psk: Zeroizing<Vec<u8>>,
    /// Coordination server address.
    pub server_addr: SocketAddr,
    /// Local bind address; an ephemeral wildcard port by default.
    pub bind_addr: SocketAddr,
    /// Hole-punch pacing and deadline.
    pub punch: HolePunchConfig,
}

impl PeerConfig {
    /// Builds a config with default bind address and punch tuning.
    #[must_use]
    pub fn new(session_id: String, psk: Vec<u8>, server_addr: SocketAddr) -> Self {
        Self {
            session_id,
            psk: Zeroizing::new(psk),
            server_addr,
            bind_addr: "0.0.0.0:0".parse().expect("wildcard address parses"),
            punch: HolePunchConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PeerConfig::new(
            "session".into(),
            b"key".to_vec(),
            "192.0.2.1:9000".parse().unwrap(),
        );
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.punch.timeout.as_secs(), 10);
    }
}
