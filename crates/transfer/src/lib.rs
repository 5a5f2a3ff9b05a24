//! File transfer state machines over the reliable channel.
//!
//! The sender offers file metadata, streams chunks through the channel's
//! windowed data path, and finishes with a digest the receiver must
//! reproduce. The receiver writes chunks at their absolute offsets,
//! checkpoints progress beside the output file so an interrupted transfer
//! can resume, and deletes the checkpoint only after the whole-file SHA-256
//! matched.

mod checkpoint;
mod error;
mod latch;
mod path;
mod receiver;
mod sender;

pub use checkpoint::{checkpoint_path, Checkpoint};
pub use error::TransferError;
pub use path::sanitize_filename;
pub use receiver::{FileReceiver, ReceivedFile};
pub use sender::FileSender;

use std::time::Duration;

/// Progress hook: `(bytes_done, bytes_total)`, called from transfer threads.
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Final figures for one completed transfer.
#[derive(Clone, Copy, Debug)]
pub struct TransferSummary {
    /// Payload bytes moved during this run (resumed bytes excluded).
    pub bytes: u64,
    /// DATA packets sent or received.
    pub packets: u64,
    /// Retransmissions performed by the channel.
    pub retransmissions: u64,
    /// Wall time from offer to verification.
    pub duration: Duration,
}

/// Bounded wait for the initial FILE_OFFER.
pub(crate) const OFFER_WAIT: Duration = Duration::from_secs(120);
/// Bounded wait for control round trips (ACCEPT, VERIFIED).
pub(crate) const CONTROL_WAIT: Duration = Duration::from_secs(30);
/// Bounded wait for the whole data phase.
pub(crate) const RECEIVE_WAIT: Duration = Duration::from_secs(600);
/// Cadence of checkpoint rewrites while receiving.
pub(crate) const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2);
