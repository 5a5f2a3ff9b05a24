//! Single-threaded packet pump over the secure transport.
//!
//! One thread owns the [`SecureDatagram`] handle outright: every send,
//! receive, timer tick and keepalive happens on it, in a fixed order per
//! iteration. Other threads only touch the multi-producer send queue, so
//! the transport itself needs no locking and sends, ticks and receives
//! interleave deterministically.
//!
//! Iteration order (invariant):
//!
//! 1. drain the send queue;
//! 2. receive once with a short timeout;
//! 3. dispatch any packet to its handler (built-ins first);
//! 4. drain again (handlers may have enqueued);
//! 5. run the tick callback;
//! 6. drain again (the tick enqueues retransmits and SACKs);
//! 7. keepalive if the link has been send-idle;
//! 8. exit, marking the connection dead, if receive-idle too long.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use wire::{Packet, PacketType, MAX_DATAGRAM};

use crate::secure::SecureDatagram;
use crate::TransportError;

/// Receive timeout per loop iteration.
const RECV_TIMEOUT: Duration = Duration::from_millis(10);
/// Send-idle span after which a keepalive goes out.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// Receive-idle span after which the connection is declared dead.
const DEAD_TIMEOUT: Duration = Duration::from_secs(45);

type Handler = Arc<dyn Fn(&Packet) + Send + Sync>;
type TickFn = Box<dyn FnMut() + Send>;

struct RouterShared {
    queue_tx: Sender<Vec<u8>>,
    handlers: Mutex<FxHashMap<PacketType, Handler>>,
    tick: Mutex<Option<TickFn>>,
    running: AtomicBool,
    connection_id: u32,
    send_limit: usize,
}

/// Handle to the router; cheap to clone, thread-safe.
#[derive(Clone)]
pub struct PacketRouter {
    shared: Arc<RouterShared>,
    startup: Arc<Mutex<Option<Startup>>>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

struct Startup {
    transport: Box<dyn SecureDatagram>,
    queue_rx: Receiver<Vec<u8>>,
}

impl PacketRouter {
    /// Wraps an established secure transport; call [`PacketRouter::start`]
    /// to begin pumping.
    #[must_use]
    pub fn new(transport: Box<dyn SecureDatagram>, connection_id: u32) -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        let send_limit = transport.send_limit();
        Self {
            shared: Arc::new(RouterShared {
                queue_tx,
                handlers: Mutex::new(FxHashMap::default()),
                tick: Mutex::new(None),
                running: AtomicBool::new(false),
                connection_id,
                send_limit,
            }),
            startup: Arc::new(Mutex::new(Some(Startup {
                transport,
                queue_rx,
            }))),
            thread: Arc::new(Mutex::new(None)),
        }
    }

    /// Connection id stamped on router-generated packets.
    #[must_use]
    pub fn connection_id(&self) -> u32 {
        self.shared.connection_id
    }

    /// Largest datagram the underlying transport accepts.
    #[must_use]
    pub fn send_limit(&self) -> usize {
        self.shared.send_limit
    }

    /// Enqueues raw bytes for transmission; returns immediately.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed);
        }
        self.shared
            .queue_tx
            .send(bytes)
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Encodes a packet and enqueues it.
    pub fn send_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        self.send(packet.encode()?)
    }

    /// Registers the handler dispatched for `packet_type`.
    ///
    /// Handlers run on the pump thread; KEEPALIVE and KEEPALIVE_ACK are
    /// always handled internally and never reach a registered handler.
    pub fn add_handler<F>(&self, packet_type: PacketType, handler: F)
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .lock()
            .expect("handler lock")
            .insert(packet_type, Arc::new(handler));
    }

    /// Removes a previously registered handler.
    pub fn remove_handler(&self, packet_type: PacketType) {
        self.shared
            .handlers
            .lock()
            .expect("handler lock")
            .remove(&packet_type);
    }

    /// Installs the periodic hook run once per loop iteration.
    pub fn set_tick_callback<F>(&self, tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.shared.tick.lock().expect("tick lock") = Some(Box::new(tick));
    }

    /// Clears the periodic hook.
    pub fn clear_tick_callback(&self) {
        *self.shared.tick.lock().expect("tick lock") = None;
    }

    /// Spawns the pump thread.
    pub fn start(&self) -> Result<(), TransportError> {
        let Some(startup) = self.startup.lock().expect("startup lock").take() else {
            return Err(TransportError::ChannelClosed);
        };
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("packet-router".into())
            .spawn(move || pump(&shared, startup))
            .map_err(TransportError::Io)?;
        *self.thread.lock().expect("thread lock") = Some(handle);
        Ok(())
    }

    /// Asks the pump thread to exit after its current iteration.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    /// Blocks until the pump thread has exited.
    pub fn await_stop(&self) {
        let handle = self.thread.lock().expect("thread lock").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Whether the pump is still alive and accepting sends.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

fn drain(
    transport: &mut dyn SecureDatagram,
    queue: &Receiver<Vec<u8>>,
    last_send: &mut Instant,
) -> bool {
    loop {
        match queue.try_recv() {
            Ok(bytes) => {
                if let Err(err) = transport.send(&bytes) {
                    warn!(%err, "transport send failed");
                    return false;
                }
                *last_send = Instant::now();
            }
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

fn dispatch(shared: &RouterShared, packet: &Packet) {
    match packet.packet_type {
        PacketType::Keepalive => {
            trace!("keepalive received, acking");
            if let Ok(bytes) =
                Packet::header_only(PacketType::KeepaliveAck, shared.connection_id).encode()
            {
                let _ = shared.queue_tx.send(bytes);
            }
        }
        PacketType::KeepaliveAck => {
            trace!("keepalive acked");
        }
        other => {
            // Clone out of the map so a handler may add or remove handlers
            // without deadlocking against this dispatch.
            let handler = shared
                .handlers
                .lock()
                .expect("handler lock")
                .get(&other)
                .cloned();
            if let Some(handler) = handler {
                handler(packet);
            } else {
                debug!(?other, "no handler for packet type");
            }
        }
    }
}

fn pump(shared: &RouterShared, startup: Startup) {
    let Startup {
        mut transport,
        queue_rx,
    } = startup;
    let mut buf = vec![0u8; MAX_DATAGRAM.max(transport.send_limit())];
    let mut last_send = Instant::now();
    let mut last_recv = Instant::now();

    debug!(connection_id = shared.connection_id, "router started");
    while shared.running.load(Ordering::Acquire) {
        if !drain(transport.as_mut(), &queue_rx, &mut last_send) {
            break;
        }

        match transport.receive(&mut buf, RECV_TIMEOUT) {
            Ok(Some(len)) => {
                last_recv = Instant::now();
                match Packet::decode(&buf[..len]) {
                    Ok(packet) => dispatch(shared, &packet),
                    Err(err) => debug!(%err, len, "dropping undecodable datagram"),
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%err, "transport receive failed, stopping router");
                break;
            }
        }

        if !drain(transport.as_mut(), &queue_rx, &mut last_send) {
            break;
        }

        {
            let mut tick = shared.tick.lock().expect("tick lock");
            if let Some(tick) = tick.as_mut() {
                tick();
            }
        }

        if !drain(transport.as_mut(), &queue_rx, &mut last_send) {
            break;
        }

        let now = Instant::now();
        if now.duration_since(last_send) >= KEEPALIVE_INTERVAL {
            trace!("send-idle, emitting keepalive");
            if let Ok(bytes) =
                Packet::header_only(PacketType::Keepalive, shared.connection_id).encode()
            {
                if transport.send(&bytes).is_err() {
                    break;
                }
                last_send = now;
            }
        }
        if now.duration_since(last_recv) >= DEAD_TIMEOUT {
            warn!("receive-idle past the dead-connection threshold");
            break;
        }
    }

    // Flush anything enqueued just before the stop request; a VERIFIED or
    // CANCEL racing shutdown would otherwise be lost in the queue.
    let _ = drain(transport.as_mut(), &queue_rx, &mut last_send);

    shared.running.store(false, Ordering::Release);
    debug!(connection_id = shared.connection_id, "router stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::PlainDatagram;
    use std::net::UdpSocket;
    use std::sync::mpsc;

    fn linked_pair() -> (PlainDatagram, PlainDatagram) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();
        (
            PlainDatagram::connect(a, addr_b).unwrap(),
            PlainDatagram::connect(b, addr_a).unwrap(),
        )
    }

    #[test]
    fn routes_packets_to_registered_handlers() {
        let (left, right) = linked_pair();
        let router_a = PacketRouter::new(Box::new(left), 1);
        let router_b = PacketRouter::new(Box::new(right), 1);

        let (tx, rx) = mpsc::channel();
        router_b.add_handler(PacketType::Data, move |packet| {
            tx.send(packet.payload.clone()).unwrap();
        });

        router_a.start().unwrap();
        router_b.start().unwrap();

        let mut packet = Packet::header_only(PacketType::Data, 1);
        packet.sequence = 9;
        packet.payload = b"hello router".to_vec();
        router_a.send_packet(&packet).unwrap();

        let payload = rx.recv_timeout(Duration::from_secs(5)).expect("dispatch");
        assert_eq!(payload, b"hello router");

        router_a.stop();
        router_b.stop();
        router_a.await_stop();
        router_b.await_stop();
    }

    #[test]
    fn send_fails_after_stop() {
        let (left, _right) = linked_pair();
        let router = PacketRouter::new(Box::new(left), 7);
        router.start().unwrap();
        router.stop();
        router.await_stop();
        assert!(matches!(
            router.send(vec![0u8; 4]),
            Err(TransportError::ChannelClosed)
        ));
        assert!(!router.is_running());
    }

    #[test]
    fn second_start_is_rejected() {
        let (left, _right) = linked_pair();
        let router = PacketRouter::new(Box::new(left), 7);
        router.start().unwrap();
        assert!(router.start().is_err());
        router.stop();
        router.await_stop();
    }

    #[test]
    fn tick_callback_runs_on_the_pump_thread() {
        let (left, _right) = linked_pair();
        let router = PacketRouter::new(Box::new(left), 3);
        let (tx, rx) = mpsc::channel();
        router.set_tick_callback(move || {
            let _ = tx.send(std::thread::current().name().map(ToOwned::to_owned));
        });
        router.start().unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).expect("tick ran");
        assert_eq!(name.as_deref(), Some("packet-router"));

        router.stop();
        router.await_stop();
    }

    #[test]
    fn keepalive_is_answered_internally() {
        let (left, right) = linked_pair();
        let router = PacketRouter::new(Box::new(left), 5);
        // A handler on KEEPALIVE must never fire; built-ins win.
        let (tx, rx) = mpsc::channel::<()>();
        router.add_handler(PacketType::Keepalive, move |_| {
            let _ = tx.send(());
        });
        router.start().unwrap();

        let mut peer = right;
        let keepalive = Packet::header_only(PacketType::Keepalive, 5).encode().unwrap();
        peer.send(&keepalive).unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let len = peer
            .receive(&mut buf, Duration::from_secs(5))
            .expect("receive")
            .expect("ack before timeout");
        let ack = Packet::decode(&buf[..len]).expect("decode ack");
        assert_eq!(ack.packet_type, PacketType::KeepaliveAck);
        assert!(rx.try_recv().is_err(), "built-in must shadow the handler");

        router.stop();
        router.await_stop();
    }
}
