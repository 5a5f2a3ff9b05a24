use std::io;

use thiserror::Error;

/// Failures while establishing or tearing down a peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The rendezvous with the coordination server failed.
    #[error("coordination failed: {0}")]
    Coordination(#[from] coord::CoordFailure),

    /// Hole punch or secure transport failure.
    #[error(transparent)]
    Transport(#[from] transport::TransportError),

    /// Socket-level failure before the transport existed.
    #[error(transparent)]
    Io(#[from] io::Error),
}
