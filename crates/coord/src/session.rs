//! Session bookkeeping for the coordination server.

use std::net::SocketAddr;
use std::time::Instant;

/// One registered peer within a session.
#[derive(Clone, Debug)]
pub(crate) struct PeerSlot {
    /// Public endpoint as observed by the server.
    pub endpoint: SocketAddr,
    /// Challenge nonce issued to this peer.
    pub nonce: [u8; 32],
    /// Whether the peer proved knowledge of the PSK.
    pub authenticated: bool,
    /// Whether this peer was already told about the other one.
    pub peer_info_sent: bool,
}

/// A rendezvous session holding at most two peer slots.
#[derive(Debug)]
pub(crate) struct Session {
    pub slots: [Option<PeerSlot>; 2],
    pub last_activity: Instant,
}

impl Session {
    pub fn new(now: Instant) -> Self {
        Self {
            slots: [None, None],
            last_activity: now,
        }
    }

    /// Slot already registered from `endpoint`, if any.
    pub fn slot_for(&mut self, endpoint: SocketAddr) -> Option<&mut PeerSlot> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|slot| slot.endpoint == endpoint)
    }

    /// Registers a new peer if a slot is free.
    pub fn add_slot(&mut self, slot: PeerSlot) -> bool {
        for entry in &mut self.slots {
            if entry.is_none() {
                *entry = Some(slot);
                return true;
            }
        }
        false
    }

    /// Both slots present and authenticated.
    pub fn fully_authenticated(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.as_ref().is_some_and(|slot| slot.authenticated))
    }

    /// The endpoint of the slot other than `endpoint`.
    pub fn other_endpoint(&self, endpoint: SocketAddr) -> Option<SocketAddr> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.endpoint)
            .find(|&candidate| candidate != endpoint)
    }
}
