use thiserror::Error;

/// Errors produced while encoding or decoding wire packets and payloads.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum WireError {
    /// The datagram does not form a valid packet.
    ///
    /// The reason tag names the first check that failed; callers treat every
    /// variant identically (log and drop) so no further structure is exposed.
    #[error("malformed packet: {reason}")]
    MalformedPacket {
        /// Short description of the failed check, e.g. `"bad magic"`.
        reason: &'static str,
    },

    /// The payload handed to an encoder exceeds the wire limit.
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge {
        /// Length the caller supplied.
        len: usize,
        /// Largest permitted payload length.
        max: usize,
    },
}

impl WireError {
    pub(crate) const fn malformed(reason: &'static str) -> Self {
        Self::MalformedPacket { reason }
    }
}
