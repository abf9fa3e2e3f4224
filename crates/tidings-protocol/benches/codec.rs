//! Codec benchmarks for tidings-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tidings_protocol::{codec, Event};

fn sample_event(body_len: usize) -> Event {
    let mut event = Event::message(1, "alerts", 1_700_000_000_000, "x".repeat(body_len));
    event.title = Some("Backup finished".to_string());
    event.priority = Some(4);
    event.tags = vec!["white_check_mark".to_string(), "backup".to_string()];
    event
}

fn bench_json_line(c: &mut Criterion) {
    let event = sample_event(256);

    let mut group = c.benchmark_group("json_line");
    group.throughput(Throughput::Elements(1));
    group.bench_function("encode_256B", |b| {
        b.iter(|| codec::encode_json_line(black_box(&event)))
    });
    group.finish();
}

fn bench_sse(c: &mut Criterion) {
    let event = sample_event(256);

    c.bench_function("sse_encode_256B", |b| {
        b.iter(|| codec::encode_sse(black_box(&event)))
    });
}

fn bench_msgpack_roundtrip(c: &mut Criterion) {
    let event = sample_event(256);

    c.bench_function("msgpack_roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&event)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(benches, bench_json_line, bench_sse, bench_msgpack_roundtrip);
criterion_main!(benches);
