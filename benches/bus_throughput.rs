//! Bus and frame codec throughput benchmark.
//!
//! Measures envelope frame round trips, event fan-out, and correlated
//! request/response latency using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use polyroute_core::commbus::{Message, MessageBus, MessageKind, MessageMetadata};
use polyroute_core::envelope::{Envelope, Intent};
use polyroute_core::ipc::codec::{encode_envelope, read_frame, write_frame, MSG_ENVELOPE};
use serde_json::json;
use std::io::Cursor;
use std::time::Duration;

const MAX_FRAME: u32 = 5 * 1024 * 1024;

fn bench_envelope_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let envelope = Envelope::new(
        "bench",
        "python",
        Intent::Invoke,
        json!({"code": "x".repeat(1024), "args": [1, 2, 3]}),
    );

    c.bench_function("envelope_frame_round_trip", |b| {
        b.iter(|| {
            rt.block_on(async {
                let payload = encode_envelope(black_box(&envelope)).unwrap();
                let mut buf = Vec::with_capacity(payload.len() + 5);
                write_frame(&mut buf, MSG_ENVELOPE, &payload).await.unwrap();
                let mut cursor = Cursor::new(buf);
                read_frame(&mut cursor, MAX_FRAME).await.unwrap()
            })
        });
    });
}

fn bench_publish_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fanout");
    for &subscribers in &[1usize, 10, 100] {
        let bus = MessageBus::new();
        for _ in 0..subscribers {
            bus.subscribe("bench.event", |m: &Message| {
                black_box(&m.payload);
            });
        }
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &bus,
            |b, bus| {
                b.iter(|| {
                    bus.publish(
                        "bench.event",
                        black_box(json!({"n": 1})),
                        MessageMetadata::default(),
                    )
                });
            },
        );
    }
    group.finish();
}

fn bench_request_response(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let bus = MessageBus::new();
    let replier = bus.clone();
    bus.subscribe("adapter:bench:execute", move |m: &Message| {
        if m.kind == MessageKind::Request {
            if let Some(to) = m.metadata.response_topic.clone() {
                replier.publish_message(Message::response(to, m.payload.clone(), None));
            }
        }
    });

    c.bench_function("request_response", |b| {
        b.iter(|| {
            rt.block_on(async {
                bus.request(
                    "adapter:bench:execute",
                    black_box(json!({"status": "ok"})),
                    Duration::from_secs(1),
                )
                .await
                .unwrap()
            })
        });
    });
}

criterion_group!(
    benches,
    bench_envelope_frame,
    bench_publish_fanout,
    bench_request_response
);
criterion_main!(benches);
