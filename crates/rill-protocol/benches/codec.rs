//! Codec benchmarks for rill-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rill_protocol::{codec, DecodeConfig, Opcode};

const MASK_KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for size in [64usize, 4096] {
        let payload = vec![0xABu8; size];
        let encoded = codec::encode_frame(Opcode::Binary, &payload, true, Some(MASK_KEY)).unwrap();
        let cfg = DecodeConfig::default();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(format!("masked_{}B", size), |b| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                codec::decode_from(black_box(&mut buf), &cfg).unwrap().unwrap()
            })
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let payload = vec![0xABu8; 4096];
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("server_4KiB", |b| {
        let mut buf = BytesMut::with_capacity(payload.len() + 16);
        b.iter(|| {
            buf.clear();
            codec::encode_frame_into(Opcode::Binary, black_box(&payload), true, None, &mut buf)
                .unwrap();
        })
    });
    group.finish();
}

fn bench_mask(c: &mut Criterion) {
    let mut payload = vec![0xABu8; 64 * 1024];
    let mut group = c.benchmark_group("mask");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("xor_64KiB", |b| {
        b.iter(|| codec::apply_mask(black_box(&mut payload), MASK_KEY))
    });
    group.finish();
}

criterion_group!(benches, bench_decode, bench_encode, bench_mask);
criterion_main!(benches);
