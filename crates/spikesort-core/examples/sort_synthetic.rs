//! Sort a synthetic four-channel recording end to end
//!
//! Run with: cargo run --example sort_synthetic -p spikesort-core
//!
//! Set SPIKESORT_CONFIG to a YAML file to override the defaults.

use spikesort_core::prelude::*;
use spikesort_core::{ChannelOutcome, SorterSnapshot, SpikeSortConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let file = SpikeSortConfig::load()?;
    init_logging(&file.logging);

    let config = SorterConfig {
        num_channels: 4,
        min_training_spikes: 300,
        ..file.sorter
    };
    let snippet_len = config.snippet_len();
    let peak = config.peak_sample_index;
    let sorter = SpikeSorter::new(config)?;

    println!("Hoarding training spikes...\n");
    let mut gen = SpikeGenerator::new(2024, 6.0);
    let per_channel = [800, 600, 400, 50];
    for (channel, &count) in per_channel.iter().enumerate() {
        let templates = templates(channel, snippet_len, peak);
        let report = sorter.hoard(&gen.batch(channel, &templates, count));
        println!(
            "  channel {}: {} admitted, {} dropped",
            channel, report.admitted, report.dropped
        );
    }

    let report = sorter.train(&CancelToken::new())?;
    println!(
        "\nTrained {} channels into {} units ({} skipped, {} failed) in {:.1} ms",
        report.channels_sorted,
        report.total_units,
        report.channels_skipped,
        report.channels_failed,
        report.duration_ms
    );
    for outcome in &report.outcomes {
        match outcome {
            ChannelOutcome::Sorted { channel, units, unit_start } => {
                println!("  channel {}: units {}..={}", channel, unit_start + 1, unit_start + *units as u32)
            }
            ChannelOutcome::Skipped { channel, spikes, required } => {
                println!("  channel {}: skipped ({} of {} spikes)", channel, spikes, required)
            }
            ChannelOutcome::Failed { channel, reason } => {
                println!("  channel {}: failed ({})", channel, reason)
            }
        }
    }

    if let Some(model) = sorter.model() {
        for cm in model.channel_models() {
            for (local, component) in cm.mixture().components().iter().enumerate() {
                let axes = component.principal_axes()?;
                println!(
                    "  unit {}: weight {:.2}, axis variances {:?}",
                    cm.unit_label(Some(local)),
                    component.weight(),
                    axes.eigenvalues
                        .iter()
                        .map(|v| format!("{:.1}", v))
                        .collect::<Vec<_>>()
                );
            }
        }
    }

    let mut live: Vec<SpikeWaveform> = (0..4)
        .flat_map(|channel| gen.batch(channel, &templates(channel, snippet_len, peak), 250))
        .collect();
    let classified = sorter.classify(&mut live)?;
    println!(
        "\nClassified {} spikes: {} to units, {} rejected, {} on unsorted channels",
        live.len(),
        classified.classified,
        classified.rejected,
        classified.unsorted_channel
    );

    let path = std::env::temp_dir().join("spikesort_demo_snapshot.json");
    sorter.snapshot().save(&path)?;
    let restored = SpikeSorter::restore(SorterSnapshot::load(&path)?)?;
    println!(
        "Snapshot written to {} and restored with {} units",
        path.display(),
        restored.total_units()
    );

    println!("\n{}", sorter.metrics().to_prometheus());
    Ok(())
}

fn templates(channel: usize, len: usize, peak: usize) -> Vec<Vec<f64>> {
    let shift = 10.0 * channel as f64;
    vec![
        biphasic_template(len, peak, 50.0 + shift, 1.5),
        biphasic_template(len, peak, 120.0 + shift, 2.5),
    ]
}
