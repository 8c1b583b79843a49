//! Topic handling: filter validation, the subscription trie, and the
//! store front-end the router queries on every publish.

mod trie;
pub mod validation;

pub use trie::{FilterTree, Subscription};
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::protocol::QoS;

/// One delivery target for a published topic, after dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedSubscriber {
    pub client_id: Arc<str>,
    /// Highest granted QoS among the session's matching filters
    pub qos: QoS,
}

/// Concurrent subscription registry.
///
/// All mutation and lookup goes through a single [`FilterTree`] behind a
/// read-write lock; lookups are read-locked and can run concurrently with
/// each other.
#[derive(Debug, Default)]
pub struct SubscriptionStore {
    tree: RwLock<FilterTree>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) a subscription. The filter must already have
    /// passed [`validate_topic_filter`].
    pub fn subscribe(&self, filter: &str, client_id: Arc<str>, qos: QoS) {
        self.tree
            .write()
            .insert(filter, Subscription { client_id, qos });
    }

    /// Remove one filter for a client. Returns false when no such
    /// subscription existed.
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        self.tree.write().remove(filter, client_id)
    }

    /// Drop every subscription a session holds. Called when a session is
    /// destroyed or a clean-start connection replaces it.
    pub fn unsubscribe_all(&self, client_id: &str) {
        self.tree.write().remove_client(client_id);
    }

    /// Find all sessions subscribed to `topic`. When several of a session's
    /// filters match, it appears once with the highest granted QoS.
    pub fn matches(&self, topic: &str) -> SmallVec<[MatchedSubscriber; 8]> {
        let mut best: AHashMap<Arc<str>, QoS> = AHashMap::new();
        self.tree.read().lookup(topic, |sub| {
            best.entry(Arc::clone(&sub.client_id))
                .and_modify(|qos| {
                    if sub.qos > *qos {
                        *qos = sub.qos;
                    }
                })
                .or_insert(sub.qos);
        });
        best.into_iter()
            .map(|(client_id, qos)| MatchedSubscriber { client_id, qos })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_filters_dedup_to_max_qos() {
        let store = SubscriptionStore::new();
        let id: Arc<str> = "dev1".into();
        store.subscribe("sensors/#", Arc::clone(&id), QoS::AtMostOnce);
        store.subscribe("sensors/+/temp", Arc::clone(&id), QoS::ExactlyOnce);
        store.subscribe("sensors/hall/temp", Arc::clone(&id), QoS::AtLeastOnce);

        let matched = store.matches("sensors/hall/temp");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].client_id.as_ref(), "dev1");
        assert_eq!(matched[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn unsubscribe_reports_missing_filter() {
        let store = SubscriptionStore::new();
        store.subscribe("a/b", "c1".into(), QoS::AtMostOnce);

        assert!(store.unsubscribe("a/b", "c1"));
        assert!(!store.unsubscribe("a/b", "c1"));
        assert!(!store.unsubscribe("never/there", "c1"));
    }

    #[test]
    fn unsubscribe_all_removes_every_filter() {
        let store = SubscriptionStore::new();
        store.subscribe("a/b", "c1".into(), QoS::AtMostOnce);
        store.subscribe("a/#", "c1".into(), QoS::AtLeastOnce);
        store.subscribe("a/b", "c2".into(), QoS::AtMostOnce);

        store.unsubscribe_all("c1");
        let matched = store.matches("a/b");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].client_id.as_ref(), "c2");
    }
}
