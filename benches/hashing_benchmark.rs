use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rayon::prelude::*;
use std::path::PathBuf;

use photo_restore::hashing::ContentHasher;
use photo_restore::parallel::{no_progress, parallel_map};

/// Synthetic media files of a few sizes in a scratch directory
fn make_test_files(dir: &std::path::Path, count: usize, size: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("bench_{:03}.jpg", i));
            let data: Vec<u8> = (0..size).map(|b| ((b + i) % 251) as u8).collect();
            std::fs::write(&path, data).unwrap();
            path
        })
        .collect()
}

fn benchmark_chunk_sizes(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let size = 8 * 1024 * 1024;
    let files = make_test_files(dir.path(), 1, size);

    let mut group = c.benchmark_group("Content hash chunk size");
    group.sample_size(10);
    group.throughput(Throughput::Bytes(size as u64));

    for chunk_size in [4 * 1024, 64 * 1024, 1024 * 1024] {
        let hasher = ContentHasher::with_chunk_size(chunk_size);
        group.bench_with_input(BenchmarkId::new("xxh3", chunk_size), &chunk_size, |b, _| {
            b.iter(|| hasher.calculate_file_hash(black_box(&files[0])).unwrap())
        });
    }

    group.finish();
}

fn benchmark_parallel_hashing(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let files = make_test_files(dir.path(), 64, 256 * 1024);
    let hasher = ContentHasher::new();

    let mut group = c.benchmark_group("Content hash throughput");
    group.sample_size(10);
    group.throughput(Throughput::Elements(files.len() as u64));

    group.bench_function("sequential", |b| {
        b.iter(|| {
            files
                .iter()
                .map(|f| hasher.calculate_file_hash(black_box(f)))
                .collect::<Vec<_>>()
        })
    });

    group.bench_function("rayon-global", |b| {
        b.iter(|| {
            files
                .par_iter()
                .map(|f| hasher.calculate_file_hash(black_box(f)))
                .collect::<Vec<_>>()
        })
    });

    for workers in [2, 8] {
        group.bench_with_input(BenchmarkId::new("parallel-map", workers), &workers, |b, &workers| {
            b.iter(|| {
                parallel_map(&files, |f| hasher.calculate_file_hash(f), workers, &no_progress).unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_chunk_sizes, benchmark_parallel_hashing);
criterion_main!(benches);
