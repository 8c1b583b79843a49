//! Publish routing.
//!
//! Takes an accepted PUBLISH (from a client, a will, or the embedding
//! application), matches it against the subscription trie, and delivers
//! one copy per subscribing session: straight to the outbound queue for
//! connected sessions, into the offline queue for persisted ones, dropped
//! for QoS 0 when nobody is listening.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::protocol::{Publish, QoS};
use crate::retained::RetainedStore;
use crate::session::{QueueOutcome, SessionStore};
use crate::topic::SubscriptionStore;

use super::outbound::{Outbound, SendError};
use super::BrokerEvent;

pub struct Router {
    subscriptions: Arc<SubscriptionStore>,
    sessions: Arc<SessionStore>,
    retained: Arc<RetainedStore>,
    connections: Arc<DashMap<Arc<str>, Arc<Outbound>>>,
    config: Arc<Config>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Router {
    pub fn new(
        subscriptions: Arc<SubscriptionStore>,
        sessions: Arc<SessionStore>,
        retained: Arc<RetainedStore>,
        connections: Arc<DashMap<Arc<str>, Arc<Outbound>>>,
        config: Arc<Config>,
        events: broadcast::Sender<BrokerEvent>,
    ) -> Self {
        Self {
            subscriptions,
            sessions,
            retained,
            connections,
            config,
            events,
        }
    }

    /// Route a publish to every matching session. Returns how many copies
    /// were handed off (enqueued outbound or stored offline).
    pub fn route(&self, publish: &Publish) -> usize {
        if publish.retain && self.config.mqtt.retain_available {
            self.retained.apply(
                Arc::clone(&publish.topic),
                publish.payload.clone(),
                publish.qos,
            );
        }

        let matched = self.subscriptions.matches(&publish.topic);
        if matched.is_empty() {
            trace!(topic = %publish.topic, "no subscribers");
            return 0;
        }

        let mut delivered = 0;
        for target in matched {
            let effective_qos = publish.qos.min(target.qos);
            if self.deliver(&target.client_id, publish, effective_qos) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver one copy to one session, falling back to the offline queue
    /// when the session is away or its inflight window is full.
    fn deliver(&self, client_id: &Arc<str>, publish: &Publish, effective_qos: QoS) -> bool {
        // The retain flag only survives on the retained-store copy; routed
        // copies go out with it cleared.
        if let Some(outbound) = self.connections.get(client_id).map(|c| Arc::clone(&c)) {
            match outbound.send_publish(publish.clone(), effective_qos, false) {
                Ok(()) => return true,
                Err(SendError::InflightFull) => {
                    // Window full; hold the message until an ack frees a slot
                    return self.queue_for_later(client_id, publish, effective_qos);
                }
                Err(SendError::Overflow) => {
                    warn!(client_id = %client_id, "outbound buffer full, dropping slow consumer");
                    outbound.close();
                    return self.queue_for_later(client_id, publish, effective_qos);
                }
                Err(SendError::Closed) => {
                    // Fall through to the offline path
                }
            }
        }
        self.queue_for_later(client_id, publish, effective_qos)
    }

    fn queue_for_later(&self, client_id: &Arc<str>, publish: &Publish, effective_qos: QoS) -> bool {
        // QoS 0 carries no delivery obligation to an absent client
        if effective_qos == QoS::AtMostOnce {
            return false;
        }
        let Some(session) = self.sessions.get(client_id) else {
            return false;
        };

        let mut copy = publish.clone();
        copy.qos = effective_qos;
        copy.retain = false;
        copy.dup = false;
        copy.packet_id = None;

        let outcome = session.write().queue_message(copy);
        match outcome {
            QueueOutcome::Queued => true,
            QueueOutcome::ReplacedOldest(evicted) => {
                debug!(client_id = %client_id, topic = %evicted, "offline queue full, evicted oldest");
                let _ = self.events.send(BrokerEvent::MessageDropped {
                    client_id: Arc::clone(client_id),
                    topic: evicted,
                });
                true
            }
            QueueOutcome::Dropped => {
                debug!(client_id = %client_id, topic = %publish.topic, "offline queue full, message dropped");
                let _ = self.events.send(BrokerEvent::MessageDropped {
                    client_id: Arc::clone(client_id),
                    topic: Arc::clone(&publish.topic),
                });
                false
            }
        }
    }

    /// Move queued messages into a session's outbound queue, oldest first.
    /// Stops when the inflight window fills, putting the remainder back in
    /// order. Called on session resume and whenever an ack frees a slot.
    pub fn flush_queued(&self, client_id: &str, outbound: &Arc<Outbound>) -> usize {
        let Some(session) = self.sessions.get(client_id) else {
            return 0;
        };

        let mut pending = session.write().drain_queued();
        let mut flushed = 0;
        while let Some(publish) = pending.pop_front() {
            let qos = publish.qos;
            match outbound.send_publish(publish.clone(), qos, false) {
                Ok(()) => flushed += 1,
                Err(_) => {
                    // Put this one and any later arrivals back, order kept
                    let mut s = session.write();
                    pending.push_front(publish);
                    pending.append(&mut s.drain_queued());
                    for held in pending {
                        s.queue_message(held);
                    }
                    break;
                }
            }
        }
        flushed
    }
}
