//! Retained message store.
//!
//! One retained message per topic, kept in a concurrent map. A retained
//! PUBLISH with an empty payload clears the slot for its topic. New
//! subscribers receive the retained messages matching their filter at
//! subscribe time.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

use crate::protocol::QoS;
use crate::topic::topic_matches_filter;

/// The stored copy of a retained publish.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
}

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: DashMap<Arc<str>, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a retained publish: store it, or clear the topic's slot when
    /// the payload is empty.
    pub fn apply(&self, topic: Arc<str>, payload: Bytes, qos: QoS) {
        if payload.is_empty() {
            self.messages.remove(topic.as_ref());
        } else {
            self.messages.insert(
                Arc::clone(&topic),
                RetainedMessage { topic, payload, qos },
            );
        }
    }

    /// Collect retained messages whose topic matches `filter`.
    ///
    /// Wildcard filters never reach into `$`-prefixed topics unless the
    /// filter itself starts with `$`.
    pub fn matching(&self, filter: &str) -> Vec<RetainedMessage> {
        self.messages
            .iter()
            .filter(|entry| topic_matches_filter(&entry.topic, filter))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(topics: &[&str]) -> RetainedStore {
        let store = RetainedStore::new();
        for t in topics {
            store.apply((*t).into(), Bytes::from_static(b"v"), QoS::AtMostOnce);
        }
        store
    }

    #[test]
    fn empty_payload_clears_slot() {
        let store = store_with(&["home/temp"]);
        assert_eq!(store.len(), 1);

        store.apply("home/temp".into(), Bytes::new(), QoS::AtMostOnce);
        assert!(store.is_empty());
    }

    #[test]
    fn newer_publish_replaces_older() {
        let store = store_with(&["home/temp"]);
        store.apply(
            "home/temp".into(),
            Bytes::from_static(b"22.5"),
            QoS::AtLeastOnce,
        );

        let matched = store.matching("home/temp");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].payload.as_ref(), b"22.5");
        assert_eq!(matched[0].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn wildcard_filters_collect_matches() {
        let store = store_with(&["home/temp", "home/hum", "barn/temp"]);

        let mut topics: Vec<_> = store
            .matching("home/+")
            .into_iter()
            .map(|m| m.topic.to_string())
            .collect();
        topics.sort();
        assert_eq!(topics, vec!["home/hum", "home/temp"]);

        assert_eq!(store.matching("#").len(), 3);
    }

    #[test]
    fn wildcards_skip_system_topics() {
        let store = store_with(&["$SYS/uptime", "normal/topic"]);

        assert_eq!(store.matching("#").len(), 1);
        assert_eq!(store.matching("$SYS/#").len(), 1);
    }
}
