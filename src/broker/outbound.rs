//! Per-connection outbound queue.
//!
//! The router and peer connection tasks enqueue packets here; only the
//! owning connection task drains the queue and writes to its transport,
//! keeping a single writer per connection. A `Notify` wakes the drain
//! loop, and an atomic flag lets any holder of the handle observe (or
//! cause) connection death.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::protocol::{Packet, Publish, QoS};
use crate::session::{InflightMessage, Qos2Stage, Session};

/// Error when enqueueing to an [`Outbound`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed
    Closed,
    /// Session has max_inflight unacknowledged messages
    InflightFull,
    /// The outbound buffer is at capacity; the consumer is too slow
    Overflow,
}

pub struct Outbound {
    queue: Mutex<VecDeque<Packet>>,
    /// Session for packet-id assignment and inflight tracking
    session: Arc<RwLock<Session>>,
    notify: Notify,
    alive: AtomicBool,
    /// Queue capacity; exceeding it marks the consumer slow
    buffer_limit: usize,
    max_inflight: u16,
}

impl Outbound {
    pub fn new(session: Arc<RwLock<Session>>, buffer_limit: usize, max_inflight: u16) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(16)),
            session,
            notify: Notify::new(),
            alive: AtomicBool::new(true),
            buffer_limit,
            max_inflight,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the connection dead and wake its drain loop.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take everything currently queued.
    pub fn drain(&self) -> VecDeque<Packet> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn session(&self) -> &Arc<RwLock<Session>> {
        &self.session
    }

    /// Enqueue a non-PUBLISH packet (acks, CONNACK, DISCONNECT).
    pub fn send_packet(&self, packet: Packet) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        self.push(packet)
    }

    /// Enqueue a PUBLISH at `effective_qos`, assigning a packet id and
    /// recording the in-flight entry for QoS 1/2 under the session lock so
    /// id assignment and tracking stay atomic.
    pub fn send_publish(
        &self,
        mut publish: Publish,
        effective_qos: QoS,
        retain: bool,
    ) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        publish.qos = effective_qos;
        publish.retain = retain;
        publish.dup = false;

        if effective_qos == QoS::AtMostOnce {
            publish.packet_id = None;
            return self.push(Packet::Publish(publish));
        }

        let packet_id = {
            let mut session = self.session.write();
            if session.inflight_outgoing.len() >= usize::from(self.max_inflight) {
                return Err(SendError::InflightFull);
            }
            let pid = session.next_packet_id();
            publish.packet_id = Some(pid);
            session.inflight_outgoing.insert(
                pid,
                InflightMessage {
                    packet_id: pid,
                    publish: publish.clone(),
                    qos2: (effective_qos == QoS::ExactlyOnce).then_some(Qos2Stage::AwaitingPubRec),
                    sent_at: Instant::now(),
                    retries: 0,
                },
            );
            pid
        };

        if let Err(e) = self.push(Packet::Publish(publish)) {
            // Undo the tracking so the id is not leaked
            self.session.write().inflight_outgoing.remove(&packet_id);
            return Err(e);
        }
        Ok(())
    }

    fn push(&self, packet: Packet) -> Result<(), SendError> {
        let was_empty = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.buffer_limit {
                return Err(SendError::Overflow);
            }
            let was_empty = queue.is_empty();
            queue.push_back(packet);
            was_empty
        };

        // Coalesce wakeups during bursts
        if was_empty {
            self.notify.notify_one();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("queued", &self.queued_len())
            .field("alive", &self.is_alive())
            .finish()
    }
}
