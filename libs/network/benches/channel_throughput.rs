//! Channel Throughput Benchmarks
//!
//! Round trips of framed messages over a local socket pair, small control
//! frames and segment-heavy data frames, plus head decoding on its own.

use std::time::Duration;

use codec::{Code, Head, Message};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use network::socket_pair;

fn bench_control_round_trip(c: &mut Criterion) {
    let (left, right) = socket_pair(Some(Duration::from_secs(5))).unwrap();
    let mut status = Message::control(Code::Status);
    status.push_str("grouped").unwrap().push_i32(3).unwrap();

    c.bench_function("control_round_trip", |b| {
        b.iter(|| {
            left.send(black_box(&status)).unwrap();
            black_box(right.receive().unwrap());
        });
    });
}

fn bench_data_segments(c: &mut Criterion) {
    let (left, right) = socket_pair(Some(Duration::from_secs(5))).unwrap();
    let mut group = c.benchmark_group("data_segments");

    for (count, size) in [(1usize, 64usize), (16, 256), (16, 4096)] {
        let mut message = Message::data(1);
        for _ in 0..count {
            message.add(vec![0xA5u8; size]);
        }
        group.throughput(Throughput::Bytes(message.encoded_size() as u64));
        group.bench_with_input(
            BenchmarkId::new("send_receive", format!("{}x{}", count, size)),
            &message,
            |b, message| {
                b.iter(|| {
                    left.send(message).unwrap();
                    black_box(right.receive().unwrap());
                });
            },
        );
    }
    group.finish();
}

fn bench_head_decode(c: &mut Criterion) {
    let mut message = Message::data(42);
    message.add(b"payload".to_vec());
    let header = message.encode_header().unwrap();

    c.bench_function("head_decode", |b| {
        b.iter(|| black_box(Head::decode(black_box(&header)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_control_round_trip,
    bench_data_segments,
    bench_head_decode
);
criterion_main!(benches);
