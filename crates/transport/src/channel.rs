//! The reliable channel: ordered data streams over the packet router.
//!
//! Wires the send window, receive buffer, congestion control and RTT
//! estimator together behind one lock. Application threads call
//! [`ReliableChannel::send_data`] (which blocks on window backpressure) and
//! [`ReliableChannel::send_control`]; the router thread feeds incoming DATA
//! and SACK packets back in through registered handlers and drives timers
//! through the tick callback. Data and control callbacks therefore run on
//! the router thread and must not block for long.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, trace, warn};
use wire::{DataHeader, Flags, Packet, PacketType, SackInfo, HEADER_LEN, DATA_HEADER_LEN};

use crate::congestion::CongestionControl;
use crate::recv_buffer::{RecvBuffer, INITIAL_WINDOW};
use crate::router::PacketRouter;
use crate::rtt::RttEstimator;
use crate::send_window::SendWindow;
use crate::TransportError;

/// Upper bound on a chunk regardless of the transport limit.
const CHUNK_FLOOR: usize = 1100;

/// Packet types routed to the control callback.
const CONTROL_TYPES: [PacketType; 7] = [
    PacketType::FileOffer,
    PacketType::FileAccept,
    PacketType::FileReject,
    PacketType::Complete,
    PacketType::Verified,
    PacketType::Cancel,
    PacketType::Error,
];

/// Counters accumulated over the channel's lifetime.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelStats {
    /// Windowed DATA packets sent, excluding retransmissions.
    pub packets_sent: u64,
    /// DATA packets that arrived, including duplicates.
    pub packets_received: u64,
    /// Retransmissions, both timer-driven and fast.
    pub retransmissions: u64,
    /// Chunk payload bytes handed to [`ReliableChannel::send_data`].
    pub bytes_sent: u64,
    /// Chunk payload bytes delivered in order.
    pub bytes_received: u64,
}

struct ChannelState {
    send_window: SendWindow,
    recv: Option<RecvBuffer>,
    rtt: RttEstimator,
    congestion: CongestionControl,
    receiver_window: u32,
    stats: ChannelStats,
}

type DataCallback = Box<dyn Fn(&[u8]) + Send>;
type ControlCallback = Box<dyn Fn(&Packet) + Send>;
type AllAckedCallback = Box<dyn Fn() + Send>;

struct ChannelInner {
    router: PacketRouter,
    state: Mutex<ChannelState>,
    window_cv: Condvar,
    closed: AtomicBool,
    data_cb: Mutex<Option<DataCallback>>,
    control_cb: Mutex<Option<ControlCallback>>,
    /// Control packets that arrived before a callback was registered.
    /// Bounded; replayed in arrival order on registration.
    pending_control: Mutex<Vec<Packet>>,
    all_acked_cb: Mutex<Option<AllAckedCallback>>,
    max_chunk_data: usize,
}

/// Most early control packets held for a late callback registration.
const PENDING_CONTROL_CAP: usize = 64;

/// Handle to the reliable channel; cheap to clone, thread-safe.
#[derive(Clone)]
pub struct ReliableChannel {
    inner: Arc<ChannelInner>,
}

impl ReliableChannel {
    /// Builds the channel over a not-yet-started router and registers its
    /// handlers and tick callback.
    ///
    /// The initial send sequence is drawn from the system CSPRNG; the peer
    /// learns it implicitly from the first DATA packet it receives.
    #[must_use]
    pub fn new(router: PacketRouter) -> Self {
        let initial_sequence = OsRng.next_u32();
        let max_chunk_data = router
            .send_limit()
            .saturating_sub(HEADER_LEN + DATA_HEADER_LEN)
            .min(CHUNK_FLOOR);

        let inner = Arc::new(ChannelInner {
            router: router.clone(),
            state: Mutex::new(ChannelState {
                send_window: SendWindow::new(initial_sequence),
                recv: None,
                rtt: RttEstimator::new(),
                congestion: CongestionControl::new(),
                receiver_window: INITIAL_WINDOW,
                stats: ChannelStats::default(),
            }),
            window_cv: Condvar::new(),
            closed: AtomicBool::new(false),
            data_cb: Mutex::new(None),
            control_cb: Mutex::new(None),
            pending_control: Mutex::new(Vec::new()),
            all_acked_cb: Mutex::new(None),
            max_chunk_data,
        });

        let weak = Arc::downgrade(&inner);
        router.add_handler(PacketType::Data, move |packet| {
            if let Some(inner) = weak.upgrade() {
                handle_data(&inner, packet);
            }
        });
        let weak = Arc::downgrade(&inner);
        router.add_handler(PacketType::Sack, move |packet| {
            if let Some(inner) = weak.upgrade() {
                handle_sack(&inner, packet);
            }
        });
        for packet_type in CONTROL_TYPES {
            let weak = Arc::downgrade(&inner);
            router.add_handler(packet_type, move |packet| {
                if let Some(inner) = weak.upgrade() {
                    let callback = inner.control_cb.lock().expect("control callback lock");
                    if let Some(callback) = callback.as_ref() {
                        callback(packet);
                    } else {
                        // The application has not registered yet; a peer can
                        // legitimately send its FILE_OFFER first. Hold on to
                        // the packet instead of dropping it.
                        let mut pending =
                            inner.pending_control.lock().expect("pending control lock");
                        if pending.len() < PENDING_CONTROL_CAP {
                            pending.push(packet.clone());
                        } else {
                            debug!(?packet.packet_type, "pending control buffer full");
                        }
                    }
                }
            });
        }
        let weak = Arc::downgrade(&inner);
        router.set_tick_callback(move || {
            if let Some(inner) = weak.upgrade() {
                tick(&inner);
            }
        });

        Self { inner }
    }

    /// Largest chunk [`ReliableChannel::send_data`] accepts.
    #[must_use]
    pub fn max_chunk_data(&self) -> usize {
        self.inner.max_chunk_data
    }

    /// Registers the in-order data callback (router thread).
    pub fn on_data_received<F>(&self, callback: F)
    where
        F: Fn(&[u8]) + Send + 'static,
    {
        *self.inner.data_cb.lock().expect("data callback lock") = Some(Box::new(callback));
    }

    /// Registers the control-packet callback (router thread).
    ///
    /// Control packets that arrived before registration are replayed into
    /// the new callback immediately, in arrival order, on this thread.
    pub fn on_control_packet<F>(&self, callback: F)
    where
        F: Fn(&Packet) + Send + 'static,
    {
        let mut guard = self.inner.control_cb.lock().expect("control callback lock");
        *guard = Some(Box::new(callback));
        let replay: Vec<Packet> = std::mem::take(
            &mut *self.inner.pending_control.lock().expect("pending control lock"),
        );
        if let Some(callback) = guard.as_ref() {
            for packet in &replay {
                callback(packet);
            }
        }
    }

    /// Registers the callback invoked whenever the window fully drains.
    pub fn on_all_acked<F>(&self, callback: F)
    where
        F: Fn() + Send + 'static,
    {
        *self.inner.all_acked_cb.lock().expect("all-acked callback lock") =
            Some(Box::new(callback));
    }

    fn closed_error(&self) -> TransportError {
        TransportError::ChannelClosed
    }

    fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && self.inner.router.is_running()
    }

    /// Sends one data chunk, blocking while the effective window is full.
    ///
    /// The payload is the 12-byte subheader (`chunk_index`, `byte_offset`)
    /// followed by `bytes`. Returns once the packet is tracked and queued;
    /// delivery is the window's business from then on.
    pub fn send_data(
        &self,
        chunk_index: u32,
        byte_offset: u64,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        if bytes.len() > self.inner.max_chunk_data {
            return Err(TransportError::Wire(wire::WireError::PayloadTooLarge {
                len: bytes.len(),
                max: self.inner.max_chunk_data,
            }));
        }

        let mut state = self.inner.state.lock().expect("channel lock");
        loop {
            if !self.is_open() {
                return Err(self.closed_error());
            }
            let effective = state
                .congestion
                .effective_window(state.receiver_window)
                .max(1);
            if state.send_window.inflight_count() < effective as usize {
                break;
            }
            let (guard, _timeout) = self
                .inner
                .window_cv
                .wait_timeout(state, Duration::from_millis(200))
                .expect("channel lock");
            state = guard;
        }

        let sequence = state.send_window.next_seq();
        let packet = Packet {
            packet_type: PacketType::Data,
            flags: Flags::default().with(Flags::ENCRYPTED),
            connection_id: self.inner.router.connection_id(),
            sequence,
            payload: DataHeader {
                chunk_index,
                byte_offset,
            }
            .encode_with(bytes),
        };
        let encoded = packet.encode()?;
        state.send_window.track(encoded.clone(), Instant::now());
        state.stats.packets_sent += 1;
        state.stats.bytes_sent += bytes.len() as u64;
        drop(state);

        self.inner.router.send(encoded)
    }

    /// Sends an unwindowed control packet.
    ///
    /// Control traffic is not acknowledged at this layer; reliability for
    /// the handful of control exchanges comes from the state machines'
    /// bounded waits above.
    pub fn send_control(&self, packet: &Packet) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        self.inner.router.send_packet(packet)
    }

    /// Number of tracked packets not yet acknowledged.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("channel lock")
            .send_window
            .inflight_count()
    }

    /// Blocks until the send window drains or `timeout` elapses.
    ///
    /// Returns false on timeout or channel close with packets still
    /// outstanding.
    #[must_use]
    pub fn wait_all_acked(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().expect("channel lock");
        loop {
            if state.send_window.inflight_count() == 0 {
                return true;
            }
            if !self.is_open() || Instant::now() >= deadline {
                return false;
            }
            let (guard, _timeout) = self
                .inner
                .window_cv
                .wait_timeout(state, Duration::from_millis(100))
                .expect("channel lock");
            state = guard;
        }
    }

    /// Snapshot of the lifetime counters.
    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        self.inner.state.lock().expect("channel lock").stats
    }

    /// Connection id stamped on packets built by this channel's owner.
    #[must_use]
    pub fn connection_id(&self) -> u32 {
        self.inner.router.connection_id()
    }

    /// Closes the channel: unregisters from the router, abandons the send
    /// window and wakes every blocked sender.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("reliable channel closing");
        self.inner.router.remove_handler(PacketType::Data);
        self.inner.router.remove_handler(PacketType::Sack);
        for packet_type in CONTROL_TYPES {
            self.inner.router.remove_handler(packet_type);
        }
        self.inner.router.clear_tick_callback();

        let mut state = self.inner.state.lock().expect("channel lock");
        state.send_window.abandon();
        drop(state);
        self.inner.window_cv.notify_all();
    }
}

fn emit_sack(inner: &ChannelInner, state: &mut MutexGuard<'_, ChannelState>, now: Instant) {
    let Some(recv) = state.recv.as_mut() else {
        return;
    };
    let sack = recv.generate_sack();
    recv.ack_sent(now);
    let packet = Packet::control(
        PacketType::Sack,
        inner.router.connection_id(),
        sack.encode(),
    );
    match packet.encode() {
        Ok(bytes) => {
            if inner.router.send(bytes).is_err() {
                trace!("router gone while emitting sack");
            }
        }
        Err(err) => warn!(%err, "sack encode failed"),
    }
}

fn handle_data(inner: &ChannelInner, packet: &Packet) {
    let now = Instant::now();
    let mut state = inner.state.lock().expect("channel lock");
    let sequence = packet.sequence;
    let recv = state
        .recv
        .get_or_insert_with(|| RecvBuffer::new(sequence, now));
    let batch = recv.deliver(sequence, packet.payload.clone());
    state.stats.packets_received += 1;
    let delivered_bytes: u64 = batch
        .iter()
        .map(|(_, payload)| payload.len().saturating_sub(DATA_HEADER_LEN) as u64)
        .sum();
    state.stats.bytes_received += delivered_bytes;
    drop(state);

    if !batch.is_empty() {
        let callback = inner.data_cb.lock().expect("data callback lock");
        if let Some(callback) = callback.as_ref() {
            for (_, payload) in &batch {
                callback(payload);
            }
        }
    }

    let mut state = inner.state.lock().expect("channel lock");
    if state
        .recv
        .as_ref()
        .is_some_and(|recv| recv.should_send_ack(now))
    {
        emit_sack(inner, &mut state, now);
    }
}

fn handle_sack(inner: &ChannelInner, packet: &Packet) {
    let sack = match SackInfo::decode(&packet.payload) {
        Ok(sack) => sack,
        Err(err) => {
            warn!(%err, "dropping undecodable sack");
            return;
        }
    };

    let now = Instant::now();
    let mut state = inner.state.lock().expect("channel lock");
    let outcome = state.send_window.process_sack(&sack, now);

    if outcome.edge_advanced {
        if let Some(sample) = outcome.rtt_sample {
            state.rtt.add_sample(sample);
        }
        state.congestion.on_ack();
    } else if !sack.ranges.is_empty() && state.congestion.on_duplicate_ack() {
        trace!(lost = outcome.lost.len(), "fast retransmit");
        for sequence in &outcome.lost {
            if let Some(bytes) = state.send_window.encoded(*sequence).map(<[u8]>::to_vec) {
                if inner.router.send(bytes).is_ok() {
                    state.send_window.mark_retransmitted(*sequence, now);
                    state.stats.retransmissions += 1;
                }
            }
        }
    }

    state.receiver_window = sack.receiver_window;
    let all_acked = state.send_window.inflight_count() == 0;
    drop(state);

    if all_acked {
        let callback = inner.all_acked_cb.lock().expect("all-acked callback lock");
        if let Some(callback) = callback.as_ref() {
            callback();
        }
    }
    inner.window_cv.notify_all();
}

fn tick(inner: &ChannelInner) {
    let now = Instant::now();
    let mut state = inner.state.lock().expect("channel lock");

    let rto = state.rtt.rto();
    let due = state.send_window.retransmittable(now, rto);
    for sequence in due {
        let Some(bytes) = state.send_window.encoded(sequence).map(<[u8]>::to_vec) else {
            continue;
        };
        if inner.router.send(bytes).is_err() {
            break;
        }
        state.send_window.mark_retransmitted(sequence, now);
        state.rtt.backoff();
        state.congestion.on_loss();
        state.stats.retransmissions += 1;
        trace!(sequence, "timer retransmit");
    }

    if state
        .recv
        .as_ref()
        .is_some_and(|recv| recv.should_send_ack(now))
    {
        emit_sack(inner, &mut state, now);
    }
}
