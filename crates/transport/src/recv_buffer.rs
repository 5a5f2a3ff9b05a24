//! Receiver-side reordering, SACK generation and adaptive flow control.
//!
//! Out-of-order packets wait in a gap map keyed by sequence; in-order
//! arrivals drain every contiguous successor in one batch. The advertised
//! window adapts to observed behaviour: long clean runs grow it, gap
//! pressure halves it.

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use wire::SackInfo;

use crate::seq::{seq_before, seq_cmp};

/// Advertised window at start-up, in packets.
pub const INITIAL_WINDOW: u32 = 256;
/// Hard ceiling for the advertised window.
pub const MAX_WINDOW: u32 = 512;
/// Hard floor for the advertised window.
pub const MIN_WINDOW: u32 = 32;
/// In-order deliveries that trigger acknowledgment without waiting.
pub const DELAYED_ACK_THRESHOLD: u32 = 2;
/// Longest an acknowledgment may be delayed.
pub const ACK_TIMER: Duration = Duration::from_millis(10);
/// Clean in-order run length that earns a window increase.
const GROW_THRESHOLD: u32 = 128;
/// Packets added per window increase.
const GROW_INCREMENT: u32 = 32;
/// Gap-map fill ratio that triggers a window decrease.
const SHRINK_PRESSURE: f64 = 0.5;

/// Reorder buffer for one reliable channel.
#[derive(Debug)]
pub struct RecvBuffer {
    expected_seq: u32,
    gap: FxHashMap<u32, Vec<u8>>,
    acks_since_last: u32,
    last_ack_time: Instant,
    gap_detected: bool,
    max_window: u32,
    consecutive_in_order: u32,
}

impl RecvBuffer {
    /// Creates a buffer expecting `expected_seq` next.
    #[must_use]
    pub fn new(expected_seq: u32, now: Instant) -> Self {
        Self {
            expected_seq,
            gap: FxHashMap::default(),
            acks_since_last: 0,
            last_ack_time: now,
            gap_detected: false,
            max_window: INITIAL_WINDOW,
            consecutive_in_order: 0,
        }
    }

    /// Accepts one packet and returns everything now deliverable in order.
    ///
    /// Old and duplicate sequences return an empty batch; they still bump
    /// the pending-ack counter because a duplicate usually means the ack
    /// that covered it was lost.
    pub fn deliver(&mut self, sequence: u32, bytes: Vec<u8>) -> Vec<(u32, Vec<u8>)> {
        if seq_before(sequence, self.expected_seq) {
            trace!(sequence, expected = self.expected_seq, "dropping old packet");
            self.acks_since_last += 1;
            return Vec::new();
        }

        if sequence == self.expected_seq {
            let mut batch = vec![(sequence, bytes)];
            self.expected_seq = self.expected_seq.wrapping_add(1);
            while let Some(next) = self.gap.remove(&self.expected_seq) {
                batch.push((self.expected_seq, next));
                self.expected_seq = self.expected_seq.wrapping_add(1);
            }

            if self.gap.is_empty() {
                self.consecutive_in_order += batch.len() as u32;
                if self.consecutive_in_order >= GROW_THRESHOLD {
                    let grown = (self.max_window + GROW_INCREMENT).min(MAX_WINDOW);
                    if grown != self.max_window {
                        debug!(from = self.max_window, to = grown, "receive window grew");
                    }
                    self.max_window = grown;
                    self.consecutive_in_order = 0;
                }
            } else {
                self.consecutive_in_order = 0;
            }

            self.acks_since_last += batch.len() as u32;
            return batch;
        }

        // Out of order: park it unless it is already waiting.
        if self.gap.contains_key(&sequence) {
            self.acks_since_last += 1;
            return Vec::new();
        }
        self.gap.insert(sequence, bytes);
        self.gap_detected = true;
        self.consecutive_in_order = 0;

        if (self.gap.len() as f64) > f64::from(self.max_window) * SHRINK_PRESSURE
            && self.max_window > MIN_WINDOW
        {
            let shrunk = (self.max_window / 2).max(MIN_WINDOW);
            debug!(from = self.max_window, to = shrunk, "receive window shrank");
            self.max_window = shrunk;
        }

        self.acks_since_last += 1;
        Vec::new()
    }

    /// Packets the peer may still send beyond the cumulative edge.
    #[must_use]
    pub fn advertised_window(&self) -> u32 {
        self.max_window.saturating_sub(self.gap.len() as u32)
    }

    /// Builds the SACK describing the current receive state.
    #[must_use]
    pub fn generate_sack(&self) -> SackInfo {
        let mut seqs: Vec<u32> = self.gap.keys().copied().collect();
        seqs.sort_by(|a, b| seq_cmp(*a, *b));

        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for sequence in seqs {
            match ranges.last_mut() {
                Some((_, end)) if sequence == end.wrapping_add(1) => *end = sequence,
                _ => ranges.push((sequence, sequence)),
            }
        }

        SackInfo {
            cumulative_ack: self.expected_seq.wrapping_sub(1),
            receiver_window: self.advertised_window(),
            ranges,
        }
    }

    /// Whether an acknowledgment should go out now.
    #[must_use]
    pub fn should_send_ack(&self, now: Instant) -> bool {
        self.acks_since_last > 0
            && (self.gap_detected
                || self.acks_since_last >= DELAYED_ACK_THRESHOLD
                || now.duration_since(self.last_ack_time) >= ACK_TIMER)
    }

    /// Resets the delayed-ack state after an acknowledgment went out.
    pub fn ack_sent(&mut self, now: Instant) {
        self.acks_since_last = 0;
        self.gap_detected = false;
        self.last_ack_time = now;
    }

    /// Next in-order sequence.
    #[must_use]
    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    /// Number of parked out-of-order packets.
    #[must_use]
    pub fn gap_len(&self) -> usize {
        self.gap.len()
    }

    #[cfg(test)]
    fn max_window(&self) -> u32 {
        self.max_window
    }
}
