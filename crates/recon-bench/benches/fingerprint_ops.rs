//! Criterion micro-benchmarks for fingerprint construction.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use recon_bench::scan_positions;
use recon_core::Fingerprint;

/// Benchmark: spatial fingerprints for 10K positions.
fn bench_spatial_10k(c: &mut Criterion) {
    let positions = scan_positions(10_000, 512, 1);

    c.bench_function("fingerprint_spatial_10k", |b| {
        b.iter(|| {
            for pos in &positions {
                black_box(Fingerprint::spatial(*pos));
            }
        });
    });
}

/// Benchmark: composite fingerprints mixing a position, a name and two
/// integers, as a keyed lookup would build them.
fn bench_composite_10k(c: &mut Criterion) {
    let positions = scan_positions(10_000, 512, 2);

    c.bench_function("fingerprint_composite_10k", |b| {
        b.iter(|| {
            for (i, pos) in positions.iter().enumerate() {
                let fp = Fingerprint::builder()
                    .anchor(*pos)
                    .with_str("network-scan")
                    .with_u64(i as u64)
                    .with_i32(-7)
                    .finish();
                black_box(fp);
            }
        });
    });
}

/// Benchmark: decode 10K spatial fingerprints back into positions.
fn bench_decode_10k(c: &mut Criterion) {
    let keys: Vec<Fingerprint> = scan_positions(10_000, 512, 3)
        .into_iter()
        .map(Fingerprint::spatial)
        .collect();

    c.bench_function("fingerprint_decode_10k", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(key.decode());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_spatial_10k,
    bench_composite_10k,
    bench_decode_10k
);
criterion_main!(benches);
