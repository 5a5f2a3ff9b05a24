//! Smoothed round-trip estimation and retransmission timeout.
//!
//! Standard EWMA estimator: `srtt` tracks the mean, `rttvar` the deviation,
//! and `rto = srtt + 4 * rttvar` clamped to `[RTO_MIN, RTO_MAX]`. Karn's
//! rule is enforced by the callers: samples are never taken from packets
//! that were retransmitted, because their ACK is ambiguous.

use std::time::Duration;

/// Weight of a new sample in the smoothed RTT.
const ALPHA: f64 = 1.0 / 8.0;
/// Weight of a new deviation sample.
const BETA: f64 = 1.0 / 4.0;
/// Lower clamp for the retransmission timeout.
pub const RTO_MIN_MS: u64 = 200;
/// Upper clamp for the retransmission timeout.
pub const RTO_MAX_MS: u64 = 10_000;
/// Timeout used before the first sample arrives.
pub const RTO_INIT_MS: u64 = 1_000;

/// Karn-safe RTT estimator with exponential timeout backoff.
#[derive(Clone, Debug)]
pub struct RttEstimator {
    srtt_ms: f64,
    rttvar_ms: f64,
    rto_ms: u64,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Creates an estimator with no samples and the initial timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            srtt_ms: 0.0,
            rttvar_ms: 0.0,
            rto_ms: RTO_INIT_MS,
            has_sample: false,
        }
    }

    /// Feeds one round-trip sample.
    ///
    /// Callers must not pass samples measured on retransmitted packets.
    pub fn add_sample(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1_000.0;
        if self.has_sample {
            // Deviation first so it sees the previous srtt.
            self.rttvar_ms =
                (1.0 - BETA) * self.rttvar_ms + BETA * (sample_ms - self.srtt_ms).abs();
            self.srtt_ms = (1.0 - ALPHA) * self.srtt_ms + ALPHA * sample_ms;
        } else {
            self.srtt_ms = sample_ms;
            self.rttvar_ms = sample_ms / 2.0;
            self.has_sample = true;
        }
        let rto = (self.srtt_ms + 4.0 * self.rttvar_ms).round() as u64;
        self.rto_ms = rto.clamp(RTO_MIN_MS, RTO_MAX_MS);
    }

    /// Doubles the timeout after a retransmission timeout fired.
    pub fn backoff(&mut self) {
        self.rto_ms = (self.rto_ms.saturating_mul(2)).min(RTO_MAX_MS);
    }

    /// Current retransmission timeout.
    #[must_use]
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms)
    }

    /// Current smoothed RTT in milliseconds, zero before the first sample.
    #[must_use]
    pub fn srtt_ms(&self) -> f64 {
        self.srtt_ms
    }
}
