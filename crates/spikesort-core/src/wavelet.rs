//! Haar wavelet decomposition of spike snippets.
//!
//! Each level splits the current approximation into pairwise averages and
//! differences scaled by 1/√2, so the transform is orthonormal and energy
//! preserving. Odd-length inputs are extended by mirroring the last sample.
//!
//! ## Example
//!
//! ```rust
//! use spikesort_core::wavelet::HaarTransform;
//!
//! let haar = HaarTransform::full_depth();
//! let coeffs = haar.decompose(&[4.0, 4.0, 2.0, 2.0]);
//! assert_eq!(coeffs.num_levels(), 2);
//! assert!((coeffs.approximation[0] - 6.0).abs() < 1e-12);
//! ```

use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_1_SQRT_2;

/// Haar coefficients of one snippet.
#[derive(Debug, Clone, PartialEq)]
pub struct HaarCoefficients {
    /// Approximation coefficients at the coarsest level.
    pub approximation: Vec<f64>,
    /// Detail coefficients, finest level first.
    pub details: Vec<Vec<f64>>,
    /// Input length before any extension.
    pub original_len: usize,
}

impl HaarCoefficients {
    pub fn num_levels(&self) -> usize {
        self.details.len()
    }

    /// Coefficients ordered coarse to fine: approximation, then details from
    /// the coarsest level down to the finest.
    pub fn flatten(&self) -> Vec<f64> {
        let total = self.approximation.len() + self.details.iter().map(Vec::len).sum::<usize>();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&self.approximation);
        for detail in self.details.iter().rev() {
            out.extend_from_slice(detail);
        }
        out
    }

    /// Energy in the approximation followed by each detail level.
    pub fn energy_per_level(&self) -> Vec<f64> {
        let mut energies = Vec::with_capacity(self.details.len() + 1);
        energies.push(self.approximation.iter().map(|x| x * x).sum());
        for detail in &self.details {
            energies.push(detail.iter().map(|x| x * x).sum());
        }
        energies
    }
}

/// Multi-level Haar analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaarTransform {
    /// Number of levels; `None` decomposes until one approximation
    /// coefficient remains.
    levels: Option<usize>,
}

impl HaarTransform {
    pub fn new(levels: usize) -> Self {
        Self {
            levels: Some(levels.max(1)),
        }
    }

    pub fn full_depth() -> Self {
        Self { levels: None }
    }

    pub fn levels(&self) -> Option<usize> {
        self.levels
    }

    /// Decompose a snippet.
    pub fn decompose(&self, signal: &[f64]) -> HaarCoefficients {
        let mut approx = signal.to_vec();
        let mut details = Vec::new();
        let max_levels = self.levels.unwrap_or(usize::MAX);

        while details.len() < max_levels && approx.len() >= 2 {
            let (a, d) = single_level(&approx);
            details.push(d);
            approx = a;
        }

        HaarCoefficients {
            approximation: approx,
            details,
            original_len: signal.len(),
        }
    }

    /// Invert a decomposition. Output is trimmed to the original length.
    pub fn reconstruct(coeffs: &HaarCoefficients) -> Vec<f64> {
        let mut approx = coeffs.approximation.clone();
        for detail in coeffs.details.iter().rev() {
            let mut next = Vec::with_capacity(2 * detail.len());
            for (&a, &d) in approx.iter().zip(detail) {
                next.push((a + d) * FRAC_1_SQRT_2);
                next.push((a - d) * FRAC_1_SQRT_2);
            }
            approx = next;
        }
        approx.truncate(coeffs.original_len);
        approx
    }

    /// Leading `count` coarse-to-fine coefficients of `signal`.
    pub fn leading_coefficients(&self, signal: &[f64], count: usize) -> Vec<f64> {
        let mut flat = self.decompose(signal).flatten();
        flat.resize(count, 0.0);
        flat
    }
}

impl Default for HaarTransform {
    fn default() -> Self {
        Self::full_depth()
    }
}

fn single_level(input: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let n = input.len();
    let out_len = (n + 1) / 2;
    let mut approx = Vec::with_capacity(out_len);
    let mut detail = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let x0 = input[2 * i];
        let x1 = if 2 * i + 1 < n { input[2 * i + 1] } else { input[n - 1] };
        approx.push((x0 + x1) * FRAC_1_SQRT_2);
        detail.push((x0 - x1) * FRAC_1_SQRT_2);
    }
    (approx, detail)
}
