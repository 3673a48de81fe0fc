//! Compiler cache write and lookup benchmarks.
//!
//! Runs against the in-memory filesystem so numbers reflect cache logic,
//! not disk latency.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gfx_core::compiler_cache::{cached_file_name, CompilerCache, CompilerCacheConfig};
use gfx_core::fs::MemoryFileSystem;

fn new_cache(size: usize) -> CompilerCache {
    let fs = MemoryFileSystem::new();
    fs.add_dir("cache");
    CompilerCache::new(CompilerCacheConfig::new(true, "cache", ".cl_cache", size), Arc::new(fs))
}

fn bench_cache_binary(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_binary");

    for (name, binary_size) in [("4kb", 4 * 1024usize), ("256kb", 256 * 1024), ("1mb", 1024 * 1024)] {
        let cache = new_cache(usize::MAX);
        let binary = vec![0xA5u8; binary_size];
        let mut counter = 0u64;

        group.throughput(Throughput::Bytes(binary_size as u64));
        group.bench_function(BenchmarkId::new("store", name), |b| {
            b.iter(|| {
                counter += 1;
                let hash = cached_file_name("bench", &counter.to_le_bytes(), "", "");
                black_box(cache.cache_binary(&hash, &binary))
            })
        });
    }

    group.finish();
}

fn bench_cache_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_eviction");

    // Budget for 64 binaries so steady state evicts on most writes.
    let binary = vec![0x5Au8; 16 * 1024];
    let cache = new_cache(64 * binary.len());
    let mut counter = 0u64;

    group.throughput(Throughput::Elements(1));
    group.bench_function("store_over_budget", |b| {
        b.iter(|| {
            counter += 1;
            let hash = cached_file_name("bench", &counter.to_le_bytes(), "", "");
            black_box(cache.cache_binary(&hash, &binary))
        })
    });

    group.finish();
}

fn bench_cache_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_cached_binary");

    let cache = new_cache(usize::MAX);
    let hash = cached_file_name("bench", b"kernel", "-O3", "");
    cache.cache_binary(&hash, &[1u8; 64 * 1024]);

    group.bench_function("hit", |b| b.iter(|| black_box(cache.load_cached_binary(&hash))));
    group.bench_function("miss", |b| b.iter(|| black_box(cache.load_cached_binary("0000"))));

    group.finish();
}

criterion_group!(benches, bench_cache_binary, bench_cache_with_eviction, bench_cache_lookup);
criterion_main!(benches);
