//! Benchmarks for checkpoint save and restore throughput

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use train_core::{ParamStore, Sgd, Tensor};
use train_state::{
    BasicTrainState, CheckpointManager, CheckpointManagerConfig, DenoisingModelTrainState,
    Snapshot, TrainState,
};

/// Model with `numel` parameters split across four tensors
fn model(numel: usize) -> ParamStore {
    let per_tensor = numel / 4;
    (0..4)
        .map(|i| {
            let data = (0..per_tensor).map(|j| (i * per_tensor + j) as f32).collect();
            (format!("layer{}.weight", i), Tensor::from_vec(data))
        })
        .collect()
}

fn checkpoint_save_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_save");

    for numel in [10_000usize, 1_000_000, 10_000_000].iter() {
        group.throughput(Throughput::Bytes((*numel * 4) as u64));
        let state = BasicTrainState::new(model(*numel), Sgd::new(0.1), 100);
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bench.ckpt");

        group.bench_with_input(BenchmarkId::from_parameter(numel), numel, |b, _| {
            b.iter(|| state.save_checkpoint(&path).unwrap());
        });
    }

    group.finish();
}

fn checkpoint_restore_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_restore");

    for numel in [10_000usize, 1_000_000, 10_000_000].iter() {
        group.throughput(Throughput::Bytes((*numel * 4) as u64));
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bench.ckpt");
        DenoisingModelTrainState::new(model(*numel), Sgd::new(0.1), 100, 0.999)
            .save_checkpoint(&path)
            .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(numel), numel, |b, &n| {
            b.iter(|| {
                DenoisingModelTrainState::restore_from_checkpoint(&path, model(n), Sgd::new(0.1), 0.999)
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn manager_save_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let temp_dir = TempDir::new().unwrap();
    let manager = rt
        .block_on(CheckpointManager::open(CheckpointManagerConfig {
            directory: temp_dir.path().to_path_buf(),
            keep_count: 3,
            save_interval_steps: 1,
        }))
        .unwrap();

    let mut step = 0u64;
    c.bench_function("manager_save_with_retention", |b| {
        b.iter(|| {
            step += 1;
            rt.block_on(manager.save(&TrainState::new(step))).unwrap()
        });
    });
}

criterion_group!(
    benches,
    checkpoint_save_benchmark,
    checkpoint_restore_benchmark,
    manager_save_benchmark,
);
criterion_main!(benches);
