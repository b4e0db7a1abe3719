//! Benchmarks for the synchronous gateway hot path.
//!
//! Run with: cargo bench --bench gateway_hotpath
//!
//! These cover the per-request work that runs outside any suspension
//! point: credential hashing, cache key derivation, quota admission,
//! prompt optimization, and denylist screening.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use onchain_gateway_rust::cache::key::{normalize, CacheKey};
use onchain_gateway_rust::cache::SensitiveContentFilter;
use onchain_gateway_rust::core::config::{OriginQuotaConfig, QuotaConfig, TierQuotaConfig};
use onchain_gateway_rust::services::key_registry::hash_credential;
use onchain_gateway_rust::services::optimizer::{
    ConciseOptimizer, NoopOptimizer, WhitespaceOptimizer,
};
use onchain_gateway_rust::services::{PromptOptimizer, QuotaLedger};
use std::collections::HashMap;

fn sample_prompt(words: usize) -> String {
    (0..words)
        .map(|i| format!("word{}", i))
        .collect::<Vec<_>>()
        .join("  ")
}

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_derivation");

    for words in [8, 64, 256].iter() {
        let prompt = sample_prompt(*words);

        group.throughput(Throughput::Bytes(prompt.len() as u64));
        group.bench_function(format!("{}_words", words), |b| {
            b.iter(|| black_box(CacheKey::derive(black_box(&prompt), "auto")));
        });
    }

    group.finish();
}

fn bench_normalization(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalization");

    for words in [8, 64, 256].iter() {
        let prompt = sample_prompt(*words);

        group.throughput(Throughput::Bytes(prompt.len() as u64));
        group.bench_function(format!("{}_words", words), |b| {
            b.iter(|| black_box(normalize(black_box(&prompt))));
        });
    }

    group.finish();
}

fn bench_credential_hashing(c: &mut Criterion) {
    let credential = format!("ocg_{}", "0123456789abcdef".repeat(2));

    c.bench_function("credential_hashing", |b| {
        b.iter(|| black_box(hash_credential(black_box(&credential))));
    });
}

fn bench_quota_admission(c: &mut Criterion) {
    let mut tiers = HashMap::new();
    tiers.insert(
        "bench".to_string(),
        TierQuotaConfig {
            limit: u32::MAX,
            window_secs: 3600,
        },
    );
    let ledger = QuotaLedger::new(&QuotaConfig {
        tiers,
        origin: OriginQuotaConfig::default(),
    });

    c.bench_function("quota_admission", |b| {
        b.iter(|| black_box(ledger.admit(black_box("acct_bench"), "bench")));
    });
}

fn bench_optimizers(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimizers");
    let prompt =
        "Could you please  summarize   this quarterly report?? I would like you to be brief!!!"
            .repeat(4);

    for optimizer in [
        &NoopOptimizer as &dyn PromptOptimizer,
        &WhitespaceOptimizer,
        &ConciseOptimizer,
    ] {
        group.throughput(Throughput::Bytes(prompt.len() as u64));
        group.bench_function(optimizer.name(), |b| {
            b.iter(|| black_box(optimizer.optimize(black_box(&prompt)).unwrap()));
        });
    }

    group.finish();
}

fn bench_denylist_screening(c: &mut Criterion) {
    let mut group = c.benchmark_group("denylist_screening");
    let filter = SensitiveContentFilter::new(&[
        "password".to_string(),
        "secret".to_string(),
        "api_key".to_string(),
    ]);

    let clean = sample_prompt(128);
    let tripping = format!("{} and my password is hunter2", sample_prompt(128));

    group.bench_function("clean_content", |b| {
        b.iter(|| black_box(filter.matches(black_box(&clean))));
    });
    group.bench_function("tripping_content", |b| {
        b.iter(|| black_box(filter.matches(black_box(&tripping))));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_key_derivation,
    bench_normalization,
    bench_credential_hashing,
    bench_quota_admission,
    bench_optimizers,
    bench_denylist_screening
);
criterion_main!(benches);
