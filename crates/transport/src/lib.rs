//! Reliable datagram transport between two NAT-traversed peers.
//!
//! The pieces compose bottom-up:
//!
//! - [`seq`] — wraparound-safe 32-bit sequence arithmetic, the only ordering
//!   ever applied to sequence numbers;
//! - [`rtt`] — Karn-safe smoothed RTT and retransmission timeout;
//! - [`congestion`] — AIMD window with slow start and fast retransmit;
//! - [`send_window`] — per-packet send tracking and SACK processing;
//! - [`recv_buffer`] — reordering, duplicate rejection, SACK generation and
//!   an adaptive advertised window;
//! - [`punch`] — UDP hole punching with symmetric-NAT port adaptation;
//! - [`secure`] — the secure-datagram abstraction and DTLS role selection;
//! - [`dtls`] — the DTLS 1.2 PSK implementation of that abstraction;
//! - [`router`] — the single-threaded I/O pump that owns the secure
//!   transport;
//! - [`channel`] — the reliable channel tying the window machinery to the
//!   router.
//!
//! Everything above the socket is synchronous: one router thread serialises
//! all transport I/O, and application threads talk to it through queues and
//! one channel lock (see the crate-level concurrency notes on
//! [`channel::ReliableChannel`]).

pub mod channel;
pub mod congestion;
pub mod dtls;
pub mod punch;
pub mod recv_buffer;
pub mod router;
pub mod rtt;
pub mod secure;
pub mod send_window;
pub mod seq;

mod error;

pub use error::TransportError;
