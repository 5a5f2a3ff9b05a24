use std::io;

use thiserror::Error;

/// Failures a coordination client can hit while rendezvousing.
#[derive(Debug, Error)]
pub enum CoordFailure {
    /// Every REGISTER attempt went unanswered.
    #[error("registration retries exhausted")]
    RegisterRetriesExhausted,

    /// Every AUTH attempt went unanswered.
    #[error("authentication retries exhausted")]
    AuthRetriesExhausted,

    /// The server answered with an explicit error.
    #[error("server rejected: {message} (code {code:#06x})")]
    ServerRejected {
        /// Machine-readable code from the ERROR payload.
        code: u16,
        /// Server-supplied description.
        message: String,
    },

    /// Authenticated, but the other peer never showed up.
    #[error("timed out waiting for the peer to join")]
    WaitingForPeerTimedOut,

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}
