use std::io;

use thiserror::Error;

/// Failures across the file sender and receiver state machines.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The receiver declined the offer.
    #[error("transfer rejected by the peer")]
    Rejected,

    /// The peer sent CANCEL.
    #[error("transfer cancelled by the peer")]
    Cancelled,

    /// The received file's digest does not match the offer.
    #[error("digest mismatch after transfer")]
    DigestMismatch,

    /// A bounded state-machine wait expired.
    #[error("timed out waiting for {step}")]
    Timeout {
        /// The latch that never tripped, e.g. `"file accept"`.
        step: &'static str,
    },

    /// The offered filename is not a safe single path component.
    #[error("unsafe filename in offer: {reason}")]
    UnsafeFilename {
        /// Which rule the name violated.
        reason: &'static str,
    },

    /// Reading or writing the file or checkpoint failed.
    #[error("disk i/o failed: {0}")]
    DiskIo(#[from] io::Error),

    /// The reliable channel refused or dropped mid-transfer.
    #[error(transparent)]
    Channel(#[from] transport::TransportError),

    /// A control payload failed to decode.
    #[error(transparent)]
    Wire(#[from] wire::WireError),
}
