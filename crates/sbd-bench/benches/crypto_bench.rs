//! Crypto envelope benchmarks, isolated from the block layer: `seal`/`open`
//! per variant over a full 4096-byte block, plus the tagless management
//! block transform.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use sbd_core::crypto::{CryptoEnvelope, CryptoVariant, Tweak};

const KEY: &[u8] = &[0x11; 32];
const TAG_SIZE: usize = 32;

fn envelope(variant: CryptoVariant) -> CryptoEnvelope {
    CryptoEnvelope::new(variant, KEY, TAG_SIZE).unwrap()
}

fn bench_seal(c: &mut Criterion) {
    let plaintext = vec![0x5Cu8; 4096];
    let mut group = c.benchmark_group("data_seal");

    for variant in [CryptoVariant::None, CryptoVariant::Siv, CryptoVariant::Hmac] {
        let env = envelope(variant);
        group.bench_with_input(BenchmarkId::new("variant", format!("{variant:?}")), &env, |b, env| {
            b.iter(|| criterion::black_box(env.seal(Tweak::data(0), &plaintext).unwrap()));
        });
    }
    group.finish();
}

fn bench_open(c: &mut Criterion) {
    let plaintext = vec![0x5Cu8; 4096];
    let mut group = c.benchmark_group("data_open");

    for variant in [CryptoVariant::None, CryptoVariant::Siv, CryptoVariant::Hmac] {
        let env = envelope(variant);
        let (ct, tag) = env.seal(Tweak::data(0), &plaintext).unwrap();
        group.bench_with_input(
            BenchmarkId::new("variant", format!("{variant:?}")),
            &(env, ct, tag),
            |b, (env, ct, tag)| {
                b.iter(|| criterion::black_box(env.open(Tweak::data(0), ct, tag).unwrap()));
            },
        );
    }
    group.finish();
}

fn bench_mgmt_transform(c: &mut Criterion) {
    let plaintext = vec![0x9Eu8; 4096];
    let mut group = c.benchmark_group("mgmt_transform");

    for variant in [CryptoVariant::None, CryptoVariant::Siv, CryptoVariant::Hmac] {
        let env = envelope(variant);
        group.bench_with_input(BenchmarkId::new("variant", format!("{variant:?}")), &env, |b, env| {
            b.iter(|| {
                let ct = env.encrypt_mgmt(Tweak::mngt(0), &plaintext);
                criterion::black_box(env.decrypt_mgmt(Tweak::mngt(0), &ct))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_seal, bench_open, bench_mgmt_transform);
criterion_main!(benches);
