//! Core types shared by every stage of the sorter.
//!
//! A [`SpikeWaveform`] is the unit of work: a short voltage snippet cut
//! around a threshold crossing by the upstream detector. The sorter only
//! reads it, except for the [`SpikeWaveform::unit`] label written back by
//! classification.
//!
//! ```text
//!   sample index:  0 ........ pre ........ pre+post
//!                  |<- pre ->| ^ |<- post ->|
//!                             threshold crossing (peak sample)
//! ```

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::gmm::FitError;
use crate::linalg::LinalgError;

/// Unit label reserved for "no unit / noise" on every channel.
pub const NOISE_UNIT: u32 = 0;

/// Result type for sorter operations
pub type SortResult<T> = Result<T, SortError>;

/// Errors reported by the sorter.
///
/// Per-channel fit failures never surface here during a training pass; they
/// are recorded in the training report and the channel is left unsorted.
#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error("training reservoir is empty")]
    EmptyReservoir,

    #[error("sorter has not been trained")]
    NotTrained,

    #[error("training was cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("numerical failure: {0}")]
    Linalg(#[from] LinalgError),

    #[error("model fit failed: {0}")]
    Fit(#[from] FitError),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A detected spike snippet on one electrode channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeWaveform {
    /// Electrode channel index
    pub channel: usize,
    /// Sample index of the threshold crossing
    pub timestamp: i64,
    /// Detection threshold that produced this spike
    pub threshold: f64,
    /// Voltage samples, `pre + post + 1` long
    pub samples: Vec<f64>,
    /// Assigned unit: 0 for noise/unclassified, otherwise a global unit id
    pub unit: u32,
}

impl SpikeWaveform {
    pub fn new(channel: usize, timestamp: i64, threshold: f64, samples: Vec<f64>) -> Self {
        Self {
            channel,
            timestamp,
            threshold,
            samples,
            unit: NOISE_UNIT,
        }
    }

    /// Number of samples in the snippet.
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether classification assigned this spike to a unit.
    #[inline]
    pub fn is_sorted(&self) -> bool {
        self.unit != NOISE_UNIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_spike_is_unsorted() {
        let spike = SpikeWaveform::new(3, 1024, -40.0, vec![0.0; 32]);
        assert_eq!(spike.unit, NOISE_UNIT);
        assert!(!spike.is_sorted());
        assert_eq!(spike.len(), 32);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(SortError::EmptyReservoir.to_string(), "training reservoir is empty");
        let err: SortError = LinalgError::ZeroVariance { column: 4 }.into();
        assert!(err.to_string().contains("column 4"));
    }
}
