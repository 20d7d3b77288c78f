//! # Unsupervised Spike Sorting
//!
//! This crate assigns extracellular spike snippets to putative neurons
//! ("units") without supervision. Each electrode channel is modelled on its own:
//! snippets are projected into a low-dimensional feature space and a
//! multivariate Gaussian mixture is fitted there, with the number of components
//! chosen automatically. Live spikes are then labelled with a globally unique
//! unit id, or rejected as noise.
//!
//! ## Overview
//!
//! - **Hoarding**: training snippets accumulate in a bounded per-channel reservoir
//! - **Projection**: peak amplitude, two-point amplitude, PCA or Haar wavelet features
//! - **Mixture fitting**: full-covariance EM with BIC/AIC/likelihood-ratio order selection
//! - **Classification**: most probable component, gated by a chi-square membership test
//! - **Unit numbering**: channel-ordered global ids, 0 reserved for noise
//!
//! ## Signal Flow
//!
//! ```text
//! Train:    reservoir → Projection::fit → features → GaussianMixture (K = 1..max) → ChannelModel
//! Classify: snippet → frozen Projection → posterior argmax → membership ≥ p ? unit id : 0
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use spikesort_core::prelude::*;
//!
//! let config = SorterConfig::builder()
//!     .num_channels(4)
//!     .projection(ProjectionMode::Pca)
//!     .max_components(4)
//!     .build()?;
//! let sorter = SpikeSorter::new(config)?;
//!
//! let templates = vec![
//!     biphasic_template(32, 10, 60.0, 1.5),
//!     biphasic_template(32, 10, 130.0, 2.5),
//! ];
//! let mut gen = SpikeGenerator::new(1, 5.0);
//! sorter.hoard(&gen.batch(0, &templates, 500));
//!
//! let report = sorter.train(&CancelToken::new())?;
//! println!("{} units on {} channels", report.total_units, report.channels_sorted);
//!
//! let mut live = gen.batch(0, &templates, 64);
//! sorter.classify(&mut live)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod channel_model;
pub mod config;
pub mod gmm;
pub mod linalg;
pub mod observe;
pub mod pca;
pub mod projection;
pub mod reservoir;
pub mod rt;
pub mod snapshot;
pub mod sorter;
pub mod stats;
pub mod synth;
pub mod types;
pub mod units;
pub mod wavelet;

pub use channel_model::{ChannelFitSettings, ChannelModel, OrderCriterion, OrderTrial};
pub use config::{ConfigError, SorterConfig, SorterConfigBuilder, SpikeSortConfig};
pub use gmm::{EmConfig, FitError, GaussianComponent, GaussianMixture};
pub use linalg::{LinalgError, Matrix};
pub use pca::{AnalysisMethod, PrincipalComponents};
pub use projection::{Projection, ProjectionMode, ProjectionParams};
pub use reservoir::{HoardReport, TrainingReservoir};
pub use rt::CancelToken;
pub use snapshot::SorterSnapshot;
pub use sorter::{
    ChannelOutcome, ClassifyReport, SortingModel, SpikeSorter, TrainReport, TrainStatus,
};
pub use types::{SortError, SortResult, SpikeWaveform, NOISE_UNIT};
pub use units::{UnitDictionary, UnitKey};
pub use wavelet::HaarTransform;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::SorterConfig;
    pub use crate::observe::{init_logging, LogConfig};
    pub use crate::projection::ProjectionMode;
    pub use crate::rt::CancelToken;
    pub use crate::sorter::{SpikeSorter, TrainReport};
    pub use crate::synth::{biphasic_template, SpikeGenerator};
    pub use crate::types::{SortError, SortResult, SpikeWaveform, NOISE_UNIT};
}
