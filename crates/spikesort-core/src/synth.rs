//! Synthetic multi-unit spike trains.
//!
//! Each unit is a fixed biphasic template (a Gaussian trough at the peak
//! sample followed by a slower positive rebound); every generated spike is one
//! template plus independent white Gaussian noise. Generators are seeded, so
//! test and bench data are reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::types::SpikeWaveform;

/// Biphasic spike template of `len` samples with its trough at `peak`.
///
/// `amplitude` is the trough depth (positive values give a negative trough),
/// `width` the trough's standard deviation in samples.
pub fn biphasic_template(len: usize, peak: usize, amplitude: f64, width: f64) -> Vec<f64> {
    let width = width.max(0.1);
    let rebound_center = peak as f64 + 3.0 * width;
    let rebound_width = 2.0 * width;
    (0..len)
        .map(|i| {
            let t = i as f64;
            let trough = (-(t - peak as f64).powi(2) / (2.0 * width * width)).exp();
            let rebound = (-(t - rebound_center).powi(2) / (2.0 * rebound_width * rebound_width)).exp();
            -amplitude * trough + 0.35 * amplitude * rebound
        })
        .collect()
}

/// A generated spike with the index of the template that produced it.
#[derive(Debug, Clone)]
pub struct LabeledSpike {
    pub spike: SpikeWaveform,
    pub unit: usize,
}

/// Seeded template-plus-noise spike source.
#[derive(Debug, Clone)]
pub struct SpikeGenerator {
    rng: StdRng,
    noise_std: f64,
    clock: i64,
}

impl SpikeGenerator {
    pub fn new(seed: u64, noise_std: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            noise_std: noise_std.abs(),
            clock: 0,
        }
    }

    /// One noisy copy of `template` on `channel`.
    pub fn spike(&mut self, channel: usize, template: &[f64]) -> SpikeWaveform {
        self.clock += self.rng.gen_range(20..400);
        let samples = template
            .iter()
            .map(|&v| {
                let z: f64 = self.rng.sample(StandardNormal);
                v + self.noise_std * z
            })
            .collect();
        SpikeWaveform::new(channel, self.clock, -4.0 * self.noise_std, samples)
    }

    /// `count` spikes on `channel`, each from a uniformly chosen template.
    pub fn labeled(&mut self, channel: usize, templates: &[Vec<f64>], count: usize) -> Vec<LabeledSpike> {
        if templates.is_empty() {
            return Vec::new();
        }
        (0..count)
            .map(|_| {
                let unit = self.rng.gen_range(0..templates.len());
                LabeledSpike {
                    spike: self.spike(channel, &templates[unit]),
                    unit,
                }
            })
            .collect()
    }

    /// Like [`labeled`](Self::labeled) without the ground truth.
    pub fn batch(&mut self, channel: usize, templates: &[Vec<f64>], count: usize) -> Vec<SpikeWaveform> {
        self.labeled(channel, templates, count)
            .into_iter()
            .map(|l| l.spike)
            .collect()
    }
}
