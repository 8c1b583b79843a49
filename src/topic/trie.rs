//! Subscription trie
//!
//! A segment-keyed tree over topic filters. Each node carries the
//! subscriptions terminating exactly there, an optional `+` child, and the
//! subscriptions that reach it through a trailing `#`. One depth-first walk
//! over a published topic collects every matching subscription.
//!
//! Nodes left with no subscriptions and no children are pruned on removal,
//! so a churny subscriber population does not leave skeleton branches
//! behind.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::protocol::QoS;

/// A registered subscription
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Owning session's client id
    pub client_id: Arc<str>,
    /// Granted maximum QoS
    pub qos: QoS,
}

#[derive(Debug, Default)]
struct FilterNode {
    /// Subscriptions whose filter terminates exactly at this node
    exact: Vec<Subscription>,
    /// Subscriptions whose filter ends in `#` at this level
    hash: Vec<Subscription>,
    /// Literal children keyed by segment
    children: AHashMap<CompactString, FilterNode>,
    /// The `+` child, if any filter has a single-level wildcard here
    plus: Option<Box<FilterNode>>,
}

impl FilterNode {
    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.hash.is_empty() && self.children.is_empty() && self.plus.is_none()
    }
}

/// Wildcard-aware filter tree
#[derive(Debug, Default)]
pub struct FilterTree {
    root: FilterNode,
}

impl FilterTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subscription under `filter`, replacing any previous entry
    /// for the same client at the same filter (a re-subscribe updates QoS).
    pub fn insert(&mut self, filter: &str, subscription: Subscription) {
        let mut node = &mut self.root;
        let mut segments = filter.split('/').peekable();

        while let Some(segment) = segments.next() {
            if segment == "#" {
                // Trailing # terminates here; validation guarantees it is last
                replace_entry(&mut node.hash, subscription);
                return;
            }
            node = if segment == "+" {
                node.plus.get_or_insert_with(Default::default)
            } else {
                node.children.entry(CompactString::new(segment)).or_default()
            };
            if segments.peek().is_none() {
                replace_entry(&mut node.exact, subscription);
                return;
            }
        }
    }

    /// Remove one client's subscription at `filter`. Returns true when an
    /// entry was removed. Emptied branches are pruned.
    pub fn remove(&mut self, filter: &str, client_id: &str) -> bool {
        let segments: SmallVec<[&str; 8]> = filter.split('/').collect();
        let (removed, _) = Self::remove_at(&mut self.root, &segments, client_id);
        removed
    }

    fn remove_at(node: &mut FilterNode, segments: &[&str], client_id: &str) -> (bool, bool) {
        let Some((segment, rest)) = segments.split_first() else {
            let before = node.exact.len();
            node.exact.retain(|s| s.client_id.as_ref() != client_id);
            return (node.exact.len() != before, node.is_empty());
        };

        let removed = match *segment {
            "#" => {
                let before = node.hash.len();
                node.hash.retain(|s| s.client_id.as_ref() != client_id);
                node.hash.len() != before
            }
            "+" => match node.plus.as_mut() {
                Some(child) => {
                    let (removed, empty) = Self::remove_at(child, rest, client_id);
                    if empty {
                        node.plus = None;
                    }
                    removed
                }
                None => false,
            },
            literal => match node.children.get_mut(literal) {
                Some(child) => {
                    let (removed, empty) = Self::remove_at(child, rest, client_id);
                    if empty {
                        node.children.remove(literal);
                    }
                    removed
                }
                None => false,
            },
        };

        (removed, node.is_empty())
    }

    /// Remove every subscription owned by `client_id`, pruning as it goes.
    pub fn remove_client(&mut self, client_id: &str) {
        Self::remove_client_at(&mut self.root, client_id);
    }

    fn remove_client_at(node: &mut FilterNode, client_id: &str) -> bool {
        node.exact.retain(|s| s.client_id.as_ref() != client_id);
        node.hash.retain(|s| s.client_id.as_ref() != client_id);

        if let Some(child) = node.plus.as_mut() {
            if Self::remove_client_at(child, client_id) {
                node.plus = None;
            }
        }
        node.children
            .retain(|_, child| !Self::remove_client_at(child, client_id));

        node.is_empty()
    }

    /// Walk the tree for a published topic, invoking `visit` for every
    /// matching subscription. A subscription can be visited once per filter
    /// it holds; deduplication by session happens in the caller.
    pub fn lookup<F>(&self, topic: &str, mut visit: F)
    where
        F: FnMut(&Subscription),
    {
        // Wildcards at the first level never match $-topics
        let shield_wildcards = topic.starts_with('$');
        let segments: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::lookup_at(&self.root, &segments, shield_wildcards, &mut visit);
    }

    fn lookup_at<F>(node: &FilterNode, segments: &[&str], shielded: bool, visit: &mut F)
    where
        F: FnMut(&Subscription),
    {
        if !shielded {
            for sub in &node.hash {
                visit(sub);
            }
        }

        let Some((segment, rest)) = segments.split_first() else {
            for sub in &node.exact {
                visit(sub);
            }
            return;
        };

        if !shielded {
            if let Some(child) = &node.plus {
                Self::lookup_at(child, rest, false, visit);
            }
        }
        if let Some(child) = node.children.get(*segment) {
            Self::lookup_at(child, rest, false, visit);
        }
    }
}

/// Keep at most one subscription per client in a terminal set
fn replace_entry(entries: &mut Vec<Subscription>, subscription: Subscription) {
    entries.retain(|s| s.client_id != subscription.client_id);
    entries.push(subscription);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(client: &str, qos: QoS) -> Subscription {
        Subscription {
            client_id: client.into(),
            qos,
        }
    }

    fn lookup_clients(tree: &FilterTree, topic: &str) -> Vec<String> {
        let mut out = Vec::new();
        tree.lookup(topic, |s| out.push(s.client_id.to_string()));
        out.sort();
        out
    }

    #[test]
    fn exact_match() {
        let mut tree = FilterTree::new();
        tree.insert("home/temp", sub("a", QoS::AtMostOnce));

        assert_eq!(lookup_clients(&tree, "home/temp"), vec!["a"]);
        assert!(lookup_clients(&tree, "home/hum").is_empty());
        assert!(lookup_clients(&tree, "home").is_empty());
    }

    #[test]
    fn single_level_wildcard() {
        let mut tree = FilterTree::new();
        tree.insert("home/+", sub("a", QoS::AtMostOnce));
        tree.insert("+/temp", sub("b", QoS::AtMostOnce));
        tree.insert("+/+", sub("c", QoS::AtMostOnce));

        assert_eq!(lookup_clients(&tree, "home/temp"), vec!["a", "b", "c"]);
        assert_eq!(lookup_clients(&tree, "barn/temp"), vec!["b", "c"]);
        assert!(lookup_clients(&tree, "home/temp/raw").is_empty());
    }

    #[test]
    fn multi_level_wildcard() {
        let mut tree = FilterTree::new();
        tree.insert("#", sub("a", QoS::AtMostOnce));
        tree.insert("home/#", sub("b", QoS::AtMostOnce));

        assert_eq!(lookup_clients(&tree, "home/temp/raw"), vec!["a", "b"]);
        // "home/#" also matches "home" itself
        assert_eq!(lookup_clients(&tree, "home"), vec!["a", "b"]);
        assert_eq!(lookup_clients(&tree, "barn"), vec!["a"]);
    }

    #[test]
    fn system_topics_shielded() {
        let mut tree = FilterTree::new();
        tree.insert("#", sub("a", QoS::AtMostOnce));
        tree.insert("+/uptime", sub("b", QoS::AtMostOnce));
        tree.insert("$SYS/#", sub("c", QoS::AtMostOnce));

        assert_eq!(lookup_clients(&tree, "$SYS/uptime"), vec!["c"]);
    }

    #[test]
    fn resubscribe_replaces_qos() {
        let mut tree = FilterTree::new();
        tree.insert("home/temp", sub("a", QoS::AtMostOnce));
        tree.insert("home/temp", sub("a", QoS::ExactlyOnce));

        let mut seen = Vec::new();
        tree.lookup("home/temp", |s| seen.push(s.qos));
        assert_eq!(seen, vec![QoS::ExactlyOnce]);
    }

    #[test]
    fn remove_prunes_empty_branches() {
        let mut tree = FilterTree::new();
        tree.insert("a/b/c/d", sub("x", QoS::AtMostOnce));
        assert!(tree.remove("a/b/c/d", "x"));
        assert!(!tree.remove("a/b/c/d", "x"));
        assert!(tree.root.is_empty());

        tree.insert("a/+/c", sub("x", QoS::AtMostOnce));
        assert!(tree.remove("a/+/c", "x"));
        assert!(tree.root.is_empty());

        tree.insert("a/#", sub("x", QoS::AtMostOnce));
        assert!(tree.remove("a/#", "x"));
        assert!(tree.root.is_empty());
    }

    #[test]
    fn remove_client_clears_everything() {
        let mut tree = FilterTree::new();
        tree.insert("a/b", sub("x", QoS::AtMostOnce));
        tree.insert("a/+", sub("x", QoS::AtLeastOnce));
        tree.insert("c/#", sub("y", QoS::AtMostOnce));

        tree.remove_client("x");
        assert!(lookup_clients(&tree, "a/b").is_empty());
        assert_eq!(lookup_clients(&tree, "c/d"), vec!["y"]);
    }
}
