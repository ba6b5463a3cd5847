//! Content hashing and container validation benchmarks
//!
//! Benchmarks for:
//! - Streaming SHA-256 throughput at different file sizes
//! - Chunk size effect on throughput
//! - Header sniffing cost

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use civitai_sync::models::hash::{compute_hash, compute_hash_with_chunk_size};
use civitai_sync::models::validate_container;
use std::hint::black_box;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write a structurally valid safetensors file of roughly `size` bytes
fn write_model(dir: &Path, size: usize) -> PathBuf {
    let header = br#"{"__metadata__":{"format":"pt"},"w":{"dtype":"U8","shape":[1],"data_offsets":[0,1]}}"#;
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header);
    bytes.extend((0..size).map(|i| (i % 251) as u8));

    let path = dir.join(format!("model-{}.safetensors", size));
    std::fs::write(&path, bytes).unwrap();
    path
}

fn bench_hash_sizes(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut group = c.benchmark_group("hash_file_size");
    group.sample_size(20);

    for size in [64 * 1024, 1024 * 1024, 16 * 1024 * 1024] {
        let path = write_model(dir.path(), size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &path, |b, path| {
            b.iter(|| black_box(compute_hash(path).unwrap()));
        });
    }
    group.finish();
}

fn bench_hash_chunk_sizes(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let size = 4 * 1024 * 1024;
    let path = write_model(dir.path(), size);

    let mut group = c.benchmark_group("hash_chunk_size");
    group.sample_size(20);
    group.throughput(Throughput::Bytes(size as u64));

    for chunk in [1024, 8 * 1024, 64 * 1024, 1024 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| black_box(compute_hash_with_chunk_size(&path, chunk).unwrap()));
        });
    }
    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = write_model(dir.path(), 1024 * 1024);

    c.bench_function("validate_container", |b| {
        b.iter(|| black_box(validate_container(&path)));
    });
}

criterion_group!(
    benches,
    bench_hash_sizes,
    bench_hash_chunk_sizes,
    bench_validate,
);
criterion_main!(benches);
