use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use vrrp::checksum::{incremental_update16, internet_checksum};

fn full_checksum_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_checksum");

    // Roughly a single-VIP VRRPv3 advertisement.
    let packet = vec![0x31u8; 16];
    group.bench_function("single_vip_packet", |b| {
        b.iter(|| black_box(internet_checksum(black_box(&packet))));
    });

    let many_vips = vec![0x31u8; 8 + 20 * 4];
    group.bench_function("twenty_vip_packet", |b| {
        b.iter(|| black_box(internet_checksum(black_box(&many_vips))));
    });

    group.finish();
}

fn incremental_checksum_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_checksum");

    group.bench_function("priority_word_update", |b| {
        b.iter(|| black_box(incremental_update16(black_box(0x1234), black_box(100), black_box(99))));
    });

    group.finish();
}

criterion_group!(benches, full_checksum_benchmark, incremental_checksum_benchmark);
criterion_main!(benches);
