use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

use flagpole::{AllData, Client, Config, ContextBuilder, FeatureStore, InMemoryFeatureStore};

fn flag_data() -> AllData {
    serde_json::from_value(json!({
        "flags": {
            "new-user-onboarding": {
                "key": "new-user-onboarding",
                "version": 1,
                "on": true,
                "salt": "onboarding",
                "variations": ["control", "treatment"],
                "offVariation": 0,
                "fallthrough": {"variation": 0},
                "rules": [{
                    "id": "us-rollout",
                    "clauses": [{"attribute": "country", "op": "in", "values": ["US"]}],
                    "rollout": {"variations": [
                        {"variation": 0, "weight": 50000},
                        {"variation": 1, "weight": 50000}
                    ]}
                }]
            },
            "beta-segment": {
                "key": "beta-segment",
                "version": 1,
                "on": true,
                "variations": [false, true],
                "offVariation": 0,
                "fallthrough": {"variation": 0},
                "rules": [{
                    "id": "beta",
                    "clauses": [{"attribute": "", "op": "segmentMatch", "values": ["beta"]}],
                    "variation": 1
                }]
            }
        },
        "segments": {
            "beta": {
                "key": "beta",
                "version": 1,
                "rules": [{
                    "clauses": [{"attribute": "email", "op": "endsWith", "values": ["@example.com"]}]
                }]
            }
        }
    }))
    .unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let store = Arc::new(InMemoryFeatureStore::new());
    store.init(flag_data());
    let client = Client::new(
        Config::from_sdk_key("bench")
            .feature_store(store)
            .send_events(false),
    )
    .unwrap();
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    {
        let mut group = c.benchmark_group("rollout");
        group.throughput(Throughput::Elements(1));
        let context = ContextBuilder::new("subject1")
            .set_value("country", "US")
            .build()
            .unwrap();
        group.bench_function("str_variation", |b| {
            b.iter(|| {
                rt.block_on(client.str_variation(
                    black_box(&context),
                    black_box("new-user-onboarding"),
                    "default",
                ))
            })
        });
        group.bench_function("str_variation_detail", |b| {
            b.iter(|| {
                rt.block_on(client.str_variation_detail(
                    black_box(&context),
                    black_box("new-user-onboarding"),
                    "default",
                ))
            })
        });
        group.finish();
    }

    {
        let mut group = c.benchmark_group("segment-match");
        group.throughput(Throughput::Elements(1));
        let context = ContextBuilder::new("subject2")
            .set_value("email", "someone@example.com")
            .build()
            .unwrap();
        group.bench_function("bool_variation", |b| {
            b.iter(|| {
                rt.block_on(client.bool_variation(
                    black_box(&context),
                    black_box("beta-segment"),
                    false,
                ))
            })
        });
        group.finish();
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
