//! Benchmarks for the subscription matcher.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use embermq::protocol::QoS;
use embermq::topic::{FilterTree, SubscriptionStore};

/// Generate exact-topic filters spread over a device fleet
fn generate_filters(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            format!(
                "fleet/device-{:04}/sensor/{}/reading",
                i,
                i % 8
            )
        })
        .collect()
}

fn populated_tree(size: usize) -> FilterTree {
    let mut tree = FilterTree::new();
    for (i, filter) in generate_filters(size).iter().enumerate() {
        tree.insert(
            filter,
            embermq::topic::Subscription {
                client_id: Arc::from(format!("client-{}", i)),
                qos: QoS::AtLeastOnce,
            },
        );
    }
    // A handful of wildcard listeners on top of the exact fleet
    for (i, filter) in [
        "fleet/+/sensor/+/reading",
        "fleet/device-0001/#",
        "fleet/#",
        "audit/#",
    ]
    .iter()
    .enumerate()
    {
        tree.insert(
            filter,
            embermq::topic::Subscription {
                client_id: Arc::from(format!("wild-{}", i)),
                qos: QoS::AtMostOnce,
            },
        );
    }
    tree
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_insert");

    for size in [100, 1_000, 10_000].iter() {
        let filters = generate_filters(*size);
        group.bench_with_input(BenchmarkId::new("exact_filters", size), size, |b, _| {
            b.iter(|| {
                let mut tree = FilterTree::new();
                for (i, filter) in filters.iter().enumerate() {
                    tree.insert(
                        filter,
                        embermq::topic::Subscription {
                            client_id: Arc::from(format!("client-{}", i)),
                            qos: QoS::AtLeastOnce,
                        },
                    );
                }
                black_box(tree)
            });
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_lookup");

    for size in [100, 1_000, 10_000].iter() {
        let tree = populated_tree(*size);
        let topics = [
            "fleet/device-0001/sensor/1/reading",
            "fleet/device-0099/sensor/3/reading",
            "fleet/device-0001/state",
            "elsewhere/entirely",
        ];

        group.bench_with_input(BenchmarkId::new("mixed_topics", size), size, |b, _| {
            b.iter(|| {
                let mut hits = 0usize;
                for topic in &topics {
                    tree.lookup(topic, |_| hits += 1);
                }
                black_box(hits)
            });
        });
    }

    group.finish();
}

fn bench_store_matches(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_matches");

    // Many overlapping filters held by a smaller client population, so
    // the dedup-by-client path does real work.
    let store = SubscriptionStore::new();
    for i in 0..1_000 {
        let client: Arc<str> = Arc::from(format!("client-{}", i % 100));
        store.subscribe(
            &format!("fleet/device-{:04}/sensor/{}/reading", i, i % 8),
            Arc::clone(&client),
            QoS::AtLeastOnce,
        );
        store.subscribe("fleet/#", client, QoS::AtMostOnce);
    }

    group.bench_function("fanout_with_dedup", |b| {
        b.iter(|| {
            let matched = store.matches("fleet/device-0042/sensor/2/reading");
            black_box(matched.len())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_insert, bench_lookup, bench_store_matches);

criterion_main!(benches);
