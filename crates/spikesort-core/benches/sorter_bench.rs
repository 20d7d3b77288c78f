//! Spike Sorter Benchmarks
//!
//! Training cost per projection mode and classification throughput.
//!
//! Run with: cargo bench -p spikesort-core --bench sorter_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use spikesort_core::gmm::{EmConfig, GaussianMixture};
use spikesort_core::prelude::*;
use spikesort_core::Matrix;

const CHANNELS: usize = 4;

fn templates(channel: usize) -> Vec<Vec<f64>> {
    let shift = 8.0 * channel as f64;
    vec![
        biphasic_template(32, 10, 55.0 + shift, 1.5),
        biphasic_template(32, 10, 120.0 + shift, 2.5),
        biphasic_template(32, 10, 90.0 + shift, 4.0),
    ]
}

fn loaded_sorter(mode: ProjectionMode, per_channel: usize) -> SpikeSorter {
    let config = SorterConfig::builder()
        .num_channels(CHANNELS)
        .projection(mode)
        .max_components(5)
        .min_training_spikes(100)
        .build()
        .unwrap();
    let sorter = SpikeSorter::new(config).unwrap();
    let mut gen = SpikeGenerator::new(11, 5.0);
    for channel in 0..CHANNELS {
        sorter.hoard(&gen.batch(channel, &templates(channel), per_channel));
    }
    sorter
}

/// Full training pass over all channels
fn bench_training(c: &mut Criterion) {
    let mut group = c.benchmark_group("training");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    for mode in [
        ProjectionMode::SingleInflection,
        ProjectionMode::DualInflection,
        ProjectionMode::Pca,
        ProjectionMode::Haar,
    ] {
        let sorter = loaded_sorter(mode, 500);
        group.bench_with_input(BenchmarkId::new("train", mode), &sorter, |b, sorter| {
            b.iter(|| sorter.train(black_box(&CancelToken::new())).unwrap())
        });
    }

    group.finish();
}

/// Live classification of mixed-channel batches
fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");

    let sorter = loaded_sorter(ProjectionMode::Pca, 500);
    sorter.train(&CancelToken::new()).unwrap();
    let mut gen = SpikeGenerator::new(12, 5.0);

    for batch_size in [64, 512, 4096].iter() {
        let batch: Vec<SpikeWaveform> = (0..CHANNELS)
            .flat_map(|channel| gen.batch(channel, &templates(channel), batch_size / CHANNELS))
            .collect();

        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_with_input(BenchmarkId::new("pca", batch_size), &batch, |b, batch| {
            b.iter(|| {
                let mut spikes = batch.clone();
                sorter.classify(black_box(&mut spikes)).unwrap()
            })
        });
    }

    group.finish();
}

/// EM fit of a single order on two-dimensional features
fn bench_em_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("em_fit");

    let mut gen = SpikeGenerator::new(13, 5.0);
    let spikes = gen.batch(0, &templates(0), 1000);
    let features: Vec<f64> = spikes
        .iter()
        .flat_map(|s| [s.samples[10], s.samples[15]])
        .collect();
    let features = Matrix::from_data(spikes.len(), 2, features);
    let em = EmConfig::default();

    for k in [1, 2, 3, 5].iter() {
        group.bench_with_input(BenchmarkId::new("k", k), k, |b, &k| {
            b.iter(|| GaussianMixture::fit(black_box(&features), k, &em, 7))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_training, bench_classify, bench_em_fit);
criterion_main!(benches);
