//! Chunk I/O Benchmarks
//!
//! Measures slice writes and reads through the chunk cache, and the cost
//! of each codec on a typical chunk.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array3;
use ruvector_tensor_store::prelude::*;
use ruvector_tensor_store::CompressionLevel;
use std::sync::Arc;

// ============================================================================
// Helper Functions
// ============================================================================

fn create_tensor(cache_bytes: usize, compressor: Compressor) -> DynamicTensor {
    let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new());
    let spec = TensorSpec::new(&[256, 256], DType::F32)
        .with_chunks(&[4, 64, 64])
        .with_compressor(compressor);
    let config = StoreConfig::default().with_cache_bytes(cache_bytes);
    DynamicTensor::create(store, 64, &spec, &config).unwrap()
}

fn generate_block(samples: usize) -> Array3<f32> {
    Array3::from_shape_fn((samples, 256, 256), |(s, i, j)| {
        ((s * 31 + i * 7 + j) % 251) as f32 * 0.01
    })
}

// ============================================================================
// Slice Benchmarks
// ============================================================================

fn bench_aligned_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("aligned_writes");

    for samples in [4, 16, 64] {
        let block = generate_block(samples);
        group.throughput(Throughput::Bytes((block.len() * 4) as u64));

        group.bench_with_input(BenchmarkId::new("write_flush", samples), &samples, |bench, &n| {
            let tensor = create_tensor(1 << 26, Compressor::Lz4);
            bench.iter(|| {
                tensor.write(&sel![0..n], black_box(&block)).unwrap();
                tensor.flush().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("reads");
    let block = generate_block(64);

    // warm: every chunk decoded in cache; cold: every read hits the store
    for (label, cache_bytes) in [("warm", 1usize << 26), ("cold", 0)] {
        let tensor = create_tensor(cache_bytes, Compressor::Lz4);
        tensor.write(&sel![..], &block).unwrap();
        tensor.flush().unwrap();

        group.bench_function(BenchmarkId::new("full_sample", label), |bench| {
            bench.iter(|| tensor.read::<f32>(black_box(&sel![7])).unwrap());
        });
        group.bench_function(BenchmarkId::new("unaligned_window", label), |bench| {
            bench.iter(|| {
                tensor
                    .read::<f32>(black_box(&sel![3..9, 30..100, 50..130]))
                    .unwrap()
            });
        });
    }

    group.finish();
}

// ============================================================================
// Codec Benchmarks
// ============================================================================

fn bench_codecs(c: &mut Criterion) {
    let mut group = c.benchmark_group("codecs");
    let chunk: Vec<u8> = generate_block(4)
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    group.throughput(Throughput::Bytes(chunk.len() as u64));

    for codec in [
        Compressor::None,
        Compressor::Lz4,
        Compressor::zstd(CompressionLevel::Fast),
        Compressor::zstd(CompressionLevel::Balanced),
    ] {
        let encoded = codec.encode(&chunk).unwrap();

        group.bench_with_input(BenchmarkId::new("encode", codec), &codec, |bench, codec| {
            bench.iter(|| codec.encode(black_box(&chunk)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("decode", codec), &codec, |bench, codec| {
            bench.iter(|| codec.decode(black_box(&encoded), chunk.len()).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_aligned_writes, bench_reads, bench_codecs);
criterion_main!(benches);
