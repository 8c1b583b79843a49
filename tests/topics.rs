//! Property tests for topic matching: the subscription trie must agree
//! with the linear per-filter matcher on every (topic, filter) pair.

use std::sync::Arc;

use proptest::prelude::*;

use embermq::protocol::QoS;
use embermq::topic::{topic_matches_filter, FilterTree, Subscription};

fn topic_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[abc]{1,2}", 1..5).prop_map(|levels| levels.join("/"))
}

fn filter_strategy() -> impl Strategy<Value = String> {
    let level = prop_oneof!["[abc]{1,2}", Just("+".to_string())];
    (prop::collection::vec(level, 1..5), any::<bool>()).prop_map(|(mut levels, hash)| {
        if hash {
            levels.push("#".to_string());
        }
        levels.join("/")
    })
}

fn matches_via_tree(tree: &FilterTree, topic: &str) -> usize {
    let mut hits = 0;
    tree.lookup(topic, |_| hits += 1);
    hits
}

fn subscription() -> Subscription {
    Subscription {
        client_id: Arc::from("prop-client"),
        qos: QoS::AtMostOnce,
    }
}

proptest! {
    #[test]
    fn tree_agrees_with_linear_matcher(topic in topic_strategy(), filter in filter_strategy()) {
        let mut tree = FilterTree::new();
        tree.insert(&filter, subscription());

        let tree_matched = matches_via_tree(&tree, &topic) > 0;
        let linear_matched = topic_matches_filter(&topic, &filter);
        prop_assert_eq!(tree_matched, linear_matched);
    }

    #[test]
    fn topic_matches_itself_as_literal_filter(topic in topic_strategy()) {
        let mut tree = FilterTree::new();
        tree.insert(&topic, subscription());
        prop_assert_eq!(matches_via_tree(&tree, &topic), 1);
    }

    #[test]
    fn multi_level_wildcard_matches_every_plain_topic(topic in topic_strategy()) {
        let mut tree = FilterTree::new();
        tree.insert("#", subscription());
        prop_assert_eq!(matches_via_tree(&tree, &topic), 1);
    }

    #[test]
    fn system_topics_hidden_from_wildcards(suffix in topic_strategy()) {
        let mut tree = FilterTree::new();
        tree.insert("#", subscription());
        tree.insert("+/state", subscription());

        let topic = format!("$SYS/{}", suffix);
        prop_assert_eq!(matches_via_tree(&tree, &topic), 0);
    }

    #[test]
    fn removal_leaves_no_match_behind(topic in topic_strategy(), filter in filter_strategy()) {
        let mut tree = FilterTree::new();
        tree.insert(&filter, subscription());
        prop_assert!(tree.remove(&filter, "prop-client"));
        prop_assert_eq!(matches_via_tree(&tree, &topic), 0);
    }

    #[test]
    fn resubscribe_keeps_one_entry_per_client(filter in filter_strategy()) {
        let mut tree = FilterTree::new();
        tree.insert(&filter, subscription());
        tree.insert(&filter, Subscription {
            client_id: Arc::from("prop-client"),
            qos: QoS::ExactlyOnce,
        });

        let mut seen = Vec::new();
        // A filter with a trailing # also matches its own parent level;
        // probing the filter text itself only works for literal filters,
        // so count entries through a topic built from the filter with
        // wildcards substituted.
        let probe: String = filter
            .split('/')
            .filter(|level| *level != "#")
            .map(|level| if level == "+" { "x" } else { level })
            .collect::<Vec<_>>()
            .join("/");
        if !probe.is_empty() {
            tree.lookup(&probe, |sub| seen.push(sub.qos));
            prop_assert_eq!(seen.len(), 1);
            prop_assert_eq!(seen[0], QoS::ExactlyOnce);
        }
    }
}
