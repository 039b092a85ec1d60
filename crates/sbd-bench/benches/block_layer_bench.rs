//! Block layer benchmarks: sequential write/sync throughput and random
//! read latency, cache hit versus cache miss.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use sbd_core::crypto::CryptoVariant;
use sbd_core::merkle::EMPTY_LEAF;
use sbd_core::{Device, DeviceConfig};
use sbd_store::MemStore;

const KEY: &[u8] = &[0x7A; 32];

fn open_fresh(cache_capacity: usize) -> Device<MemStore> {
    let cfg = DeviceConfig::new(4096, 32, cache_capacity).unwrap();
    Device::open(MemStore::new(), cfg, CryptoVariant::None, KEY, EMPTY_LEAF).unwrap()
}

fn bench_sequential_write_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_write_sync");

    for &n in &[128u32, 512, 2048] {
        group.bench_with_input(BenchmarkId::new("blocks", n), &n, |b, &n| {
            b.iter(|| {
                let mut dev = open_fresh(16);
                for log in 0..n {
                    dev.write_data_block(log, &[0xAB; 4096], 0, 4096).unwrap();
                }
                dev.sync().unwrap();
                criterion::black_box(&dev);
            });
        });
    }
    group.finish();
}

fn bench_random_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_read");

    let mut dev = open_fresh(16);
    for log in 0..512u32 {
        dev.write_data_block(log, &[0xCD; 4096], 0, 4096).unwrap();
    }
    dev.sync().unwrap();

    group.bench_function("cache_hit", |b| {
        // Block 0 is warm from the setup loop's own fault-in.
        dev.read_data_block(0, 0, 4096).unwrap();
        b.iter(|| criterion::black_box(dev.read_data_block(0, 0, 4096).unwrap()));
    });

    group.bench_function("cache_miss", |b| {
        // A 16-entry cache over 512 written blocks guarantees most reads
        // fault a cold management/data pair in from the Store.
        let mut log = 0u32;
        b.iter(|| {
            log = (log + 37) % 512;
            criterion::black_box(dev.read_data_block(log, 0, 4096).unwrap())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_sequential_write_sync, bench_random_read);
criterion_main!(benches);
