//! Rendezvous coordination for NAT-traversing peers.
//!
//! Two peers that share a session id and a pre-shared key register with the
//! coordination server, prove knowledge of the key via an HMAC
//! challenge/response, and receive each other's public endpoints. The
//! server holds no transfer state: it is a session table, an authenticator
//! and an endpoint mirror, all over single datagrams.

mod auth;
mod client;
mod error;
mod server;
mod session;

pub use auth::{compute_auth_hmac, verify_auth_hmac};
pub use client::{CoordClient, Coordinated};
pub use error::CoordFailure;
pub use server::{CoordServer, ServerConfig};

/// Error code sent when a session already has two other peers.
pub const ERROR_SESSION_FULL: u16 = 0x0001;
/// Error code sent on an HMAC mismatch.
pub const ERROR_AUTH_FAILED: u16 = 0x0002;
