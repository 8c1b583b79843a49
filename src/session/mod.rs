//! Session state and the concurrent session store.
//!
//! A session outlives the connection that created it when the client asked
//! for persistence (clean_start=false with a non-zero expiry). It carries
//! the subscriptions, the in-flight QoS 1/2 bookkeeping for both
//! directions, and the queue of messages that arrived while the client was
//! offline.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::protocol::{ProtocolVersion, Publish, QoS, Will};

/// Connection lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Persisted while the client is away
    Disconnected,
}

/// What to do when an offline queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Evict the oldest queued message to make room
    #[default]
    DropOldest,
    /// Drop the incoming message instead
    DropNewest,
}

/// Result of queueing a message for an offline session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued,
    /// Queued, but the oldest message was evicted; carries its topic
    ReplacedOldest(Arc<str>),
    /// The incoming message was dropped
    Dropped,
}

/// Delivery stage of an outgoing QoS 2 message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2Stage {
    /// PUBLISH sent, awaiting PUBREC
    AwaitingPubRec,
    /// PUBREL sent, awaiting PUBCOMP
    AwaitingPubComp,
}

/// An unacknowledged outgoing QoS 1/2 publish
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub packet_id: u16,
    pub publish: Publish,
    /// None for QoS 1
    pub qos2: Option<Qos2Stage>,
    pub sent_at: Instant,
    pub retries: u32,
}

impl InflightMessage {
    /// Whether this entry is due for retransmission
    pub fn is_due(&self, interval: Duration) -> bool {
        self.sent_at.elapsed() >= interval
    }
}

pub struct Session {
    pub client_id: Arc<str>,
    pub protocol_version: ProtocolVersion,
    pub state: SessionState,
    /// Expiry after disconnect. Zero removes the session immediately,
    /// `None` keeps it forever.
    pub expiry: Option<Duration>,
    /// Negotiated keep-alive in seconds (0 disables the check)
    pub keep_alive: u16,
    pub last_activity: Instant,
    /// Filters this session holds, with granted QoS. The authoritative
    /// match structure is the subscription trie; this mirror exists so a
    /// replaced or destroyed session can be cleaned out of it.
    pub subscriptions: HashMap<String, QoS>,
    /// Outgoing QoS 1/2 messages awaiting acknowledgement
    pub inflight_outgoing: HashMap<u16, InflightMessage>,
    /// Packet ids of incoming QoS 2 publishes already routed but not yet
    /// released with PUBREL
    pub inflight_incoming: HashSet<u16>,
    next_packet_id: u16,
    /// Messages held while the session is disconnected
    queued: VecDeque<Publish>,
    pub queue_limit: usize,
    pub queue_policy: QueuePolicy,
    /// Messages this session lost to queue overflow
    pub lost_to_overflow: u64,
    pub will: Option<Will>,
    pub disconnected_at: Option<Instant>,
}

impl Session {
    pub fn new(client_id: Arc<str>, protocol_version: ProtocolVersion) -> Self {
        Self {
            client_id,
            protocol_version,
            state: SessionState::Connected,
            expiry: Some(Duration::ZERO),
            keep_alive: 0,
            last_activity: Instant::now(),
            subscriptions: HashMap::new(),
            inflight_outgoing: HashMap::new(),
            inflight_incoming: HashSet::new(),
            next_packet_id: 1,
            queued: VecDeque::new(),
            queue_limit: 1000,
            queue_policy: QueuePolicy::default(),
            lost_to_overflow: 0,
            will: None,
            disconnected_at: None,
        }
    }

    /// Allocate the next free outgoing packet identifier, skipping ids
    /// still held by in-flight messages. Zero is never produced.
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }
            if !self.inflight_outgoing.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }
        match (self.expiry, self.disconnected_at) {
            (Some(expiry), Some(at)) => at.elapsed() >= expiry,
            _ => false,
        }
    }

    /// Keep-alive enforcement uses the 1.5x grace the protocol allows.
    pub fn keep_alive_deadline(&self) -> Option<Instant> {
        if self.keep_alive == 0 {
            return None;
        }
        let timeout = Duration::from_millis(u64::from(self.keep_alive) * 1500);
        Some(self.last_activity + timeout)
    }

    pub fn is_keep_alive_expired(&self) -> bool {
        self.keep_alive_deadline()
            .is_some_and(|deadline| Instant::now() > deadline)
    }

    /// Hold a message for delivery when the client returns.
    pub fn queue_message(&mut self, publish: Publish) -> QueueOutcome {
        if self.queued.len() < self.queue_limit {
            self.queued.push_back(publish);
            return QueueOutcome::Queued;
        }
        self.lost_to_overflow += 1;
        match self.queue_policy {
            QueuePolicy::DropOldest => match self.queued.pop_front() {
                Some(evicted) => {
                    self.queued.push_back(publish);
                    QueueOutcome::ReplacedOldest(evicted.topic)
                }
                // A zero-capacity queue holds nothing at all
                None => QueueOutcome::Dropped,
            },
            QueuePolicy::DropNewest => QueueOutcome::Dropped,
        }
    }

    /// Take the queued messages, oldest first.
    pub fn drain_queued(&mut self) -> VecDeque<Publish> {
        std::mem::take(&mut self.queued)
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }
}

/// Thread-safe session registry keyed by client id.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

/// Result of [`SessionStore::resolve`]
pub struct ResolvedSession {
    pub session: Arc<RwLock<Session>>,
    /// True when an existing persisted session was resumed
    pub resumed: bool,
    /// True when a prior session was discarded to make room for a fresh
    /// one (clean start, or the stored session had expired). The caller
    /// must clear any state keyed on the client id elsewhere.
    pub replaced: bool,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Find or create the session for a connecting client.
    ///
    /// clean_start discards any stored state; otherwise a live, unexpired
    /// session is resumed with its subscriptions, in-flight messages, and
    /// queue intact.
    pub fn resolve(
        &self,
        client_id: &str,
        protocol_version: ProtocolVersion,
        clean_start: bool,
    ) -> ResolvedSession {
        let client_id: Arc<str> = client_id.into();

        if !clean_start {
            if let Some(existing) = self.sessions.get(&client_id) {
                let mut s = existing.write();
                if !s.is_expired() {
                    s.state = SessionState::Connected;
                    s.protocol_version = protocol_version;
                    s.disconnected_at = None;
                    drop(s);
                    return ResolvedSession {
                        session: existing.clone(),
                        resumed: true,
                        replaced: false,
                    };
                }
            }
        }

        let replaced = self.sessions.contains_key(&client_id);
        let session = Arc::new(RwLock::new(Session::new(
            Arc::clone(&client_id),
            protocol_version,
        )));
        self.sessions.insert(client_id, Arc::clone(&session));
        ResolvedSession {
            session,
            resumed: false,
            replaced,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Mark a session disconnected, removing it outright when its expiry
    /// is zero. Returns true when the session was removed.
    pub fn detach(&self, client_id: &str) -> bool {
        let should_remove = match self.sessions.get(client_id) {
            Some(session) => {
                let mut s = session.write();
                s.state = SessionState::Disconnected;
                s.disconnected_at = Some(Instant::now());
                s.expiry == Some(Duration::ZERO)
            }
            None => return false,
        };

        // Remove outside the map guard
        if should_remove {
            self.sessions.remove(client_id);
        }
        should_remove
    }

    pub fn destroy(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    /// Drop expired sessions, returning their client ids so callers can
    /// clean dependent state.
    pub fn sweep(&self) -> Vec<Arc<str>> {
        let mut removed = Vec::new();
        self.sessions.retain(|client_id, session| {
            let expired = session.read().is_expired();
            if expired {
                removed.push(Arc::clone(client_id));
            }
            !expired
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn publish(topic: &str, payload: &'static [u8]) -> Publish {
        Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn packet_ids_skip_inflight_and_zero() {
        let mut session = Session::new("c1".into(), ProtocolVersion::V5);
        session.next_packet_id = u16::MAX;

        assert_eq!(session.next_packet_id(), u16::MAX);
        // Wraps past zero
        assert_eq!(session.next_packet_id(), 1);

        session.inflight_outgoing.insert(
            2,
            InflightMessage {
                packet_id: 2,
                publish: publish("a", b"x"),
                qos2: None,
                sent_at: Instant::now(),
                retries: 0,
            },
        );
        assert_eq!(session.next_packet_id(), 3);
    }

    #[test]
    fn queue_drop_oldest_evicts_head() {
        let mut session = Session::new("c1".into(), ProtocolVersion::V5);
        session.queue_limit = 2;

        assert_eq!(session.queue_message(publish("t/a", b"1")), QueueOutcome::Queued);
        assert_eq!(session.queue_message(publish("t/b", b"2")), QueueOutcome::Queued);
        assert_eq!(
            session.queue_message(publish("t/c", b"3")),
            QueueOutcome::ReplacedOldest(Arc::from("t/a"))
        );
        assert_eq!(session.lost_to_overflow, 1);

        let payloads: Vec<_> = session
            .drain_queued()
            .into_iter()
            .map(|p| p.payload)
            .collect();
        assert_eq!(payloads, vec![Bytes::from_static(b"2"), Bytes::from_static(b"3")]);
    }

    #[test]
    fn queue_drop_newest_rejects_incoming() {
        let mut session = Session::new("c1".into(), ProtocolVersion::V5);
        session.queue_limit = 1;
        session.queue_policy = QueuePolicy::DropNewest;

        assert_eq!(session.queue_message(publish("t", b"1")), QueueOutcome::Queued);
        assert_eq!(session.queue_message(publish("t", b"2")), QueueOutcome::Dropped);
        assert_eq!(session.queued_len(), 1);
        assert_eq!(session.lost_to_overflow, 1);
    }

    #[test]
    fn zero_expiry_session_removed_on_detach() {
        let store = SessionStore::new();
        store.resolve("c1", ProtocolVersion::V5, true);

        assert!(store.detach("c1"));
        assert!(store.get("c1").is_none());
    }

    #[test]
    fn persistent_session_resumes_with_state() {
        let store = SessionStore::new();
        let resolved = store.resolve("c1", ProtocolVersion::V5, false);
        assert!(!resolved.resumed);
        {
            let mut s = resolved.session.write();
            s.expiry = Some(Duration::from_secs(3600));
            s.queue_message(publish("t", b"held"));
        }
        store.detach("c1");

        let resolved = store.resolve("c1", ProtocolVersion::V5, false);
        assert!(resolved.resumed);
        let mut s = resolved.session.write();
        assert_eq!(s.state, SessionState::Connected);
        assert_eq!(s.drain_queued().len(), 1);
    }

    #[test]
    fn clean_start_discards_previous_session() {
        let store = SessionStore::new();
        let resolved = store.resolve("c1", ProtocolVersion::V5, false);
        resolved.session.write().expiry = Some(Duration::from_secs(3600));
        resolved.session.write().queue_message(publish("t", b"old"));
        store.detach("c1");

        let resolved = store.resolve("c1", ProtocolVersion::V5, true);
        assert!(!resolved.resumed);
        assert!(resolved.replaced);
        assert_eq!(resolved.session.read().queued_len(), 0);
    }

    #[test]
    fn resolve_reports_whether_a_prior_session_was_replaced() {
        let store = SessionStore::new();

        // Nothing stored yet
        let resolved = store.resolve("c1", ProtocolVersion::V5, false);
        assert!(!resolved.resumed);
        assert!(!resolved.replaced);

        // An expired session is discarded, not resumed, and the caller
        // is told it existed
        {
            let mut s = resolved.session.write();
            s.expiry = Some(Duration::ZERO);
            s.state = SessionState::Disconnected;
            s.disconnected_at = Some(Instant::now() - Duration::from_secs(1));
        }
        let resolved = store.resolve("c1", ProtocolVersion::V5, false);
        assert!(!resolved.resumed);
        assert!(resolved.replaced);

        // Resuming a live session replaces nothing
        resolved.session.write().expiry = Some(Duration::from_secs(3600));
        store.detach("c1");
        let resolved = store.resolve("c1", ProtocolVersion::V5, false);
        assert!(resolved.resumed);
        assert!(!resolved.replaced);
    }

    #[test]
    fn sweep_reports_expired_sessions() {
        let store = SessionStore::new();
        let resolved = store.resolve("gone", ProtocolVersion::V5, false);
        {
            let mut s = resolved.session.write();
            s.expiry = Some(Duration::ZERO);
            s.state = SessionState::Disconnected;
            s.disconnected_at = Some(Instant::now() - Duration::from_secs(1));
        }
        let resolved = store.resolve("stays", ProtocolVersion::V5, false);
        resolved.session.write().expiry = None;

        let removed = store.sweep();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].as_ref(), "gone");
        assert_eq!(store.len(), 1);
    }
}
