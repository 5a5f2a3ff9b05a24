use std::io;

use thiserror::Error;

/// Errors surfaced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The hole-punch deadline elapsed without proof of reachability.
    #[error("hole punch timed out after {elapsed_ms} ms")]
    HolePunchTimeout {
        /// Time spent punching before giving up.
        elapsed_ms: u64,
    },

    /// Every DTLS handshake attempt failed.
    #[error("secure handshake failed: {0}")]
    HandshakeFailed(&'static str),

    /// The router or channel was asked to act after shutdown.
    #[error("channel closed")]
    ChannelClosed,

    /// Wire-level encode/decode failure on a locally built packet.
    #[error(transparent)]
    Wire(#[from] wire::WireError),

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}
