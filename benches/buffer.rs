use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sluice::Buffer;

fn bench_append_retrieve(c: &mut Criterion) {
    let payload = vec![0x5au8; 1024];
    c.bench_function("buffer_append_retrieve_16k", |b| {
        b.iter(|| {
            let mut buf = Buffer::new();
            for _ in 0..16 {
                buf.append(black_box(&payload));
            }
            buf.retrieve_all();
            buf
        })
    });
}

fn bench_append_with_compaction(c: &mut Criterion) {
    let payload = vec![0x5au8; 512];
    c.bench_function("buffer_streaming_compaction", |b| {
        b.iter(|| {
            let mut buf = Buffer::with_capacity(1024);
            for _ in 0..64 {
                buf.append(black_box(&payload));
                buf.retrieve(black_box(256));
            }
            buf
        })
    });
}

fn bench_int_round_trip(c: &mut Criterion) {
    c.bench_function("buffer_u32_round_trip", |b| {
        b.iter(|| {
            let mut buf = Buffer::new();
            for i in 0..256u32 {
                buf.append_u32(black_box(i));
            }
            let mut sum = 0u64;
            for _ in 0..256 {
                sum += buf.read_u32() as u64;
            }
            sum
        })
    });
}

criterion_group!(
    benches,
    bench_append_retrieve,
    bench_append_with_compaction,
    bench_int_round_trip
);
criterion_main!(benches);
