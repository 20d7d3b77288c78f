//! # Configuration
//!
//! YAML configuration for the sorter and its logging.
//!
//! ## Search Path
//!
//! [`SpikeSortConfig::load`] reads the first file found:
//! 1. Path in the `SPIKESORT_CONFIG` environment variable
//! 2. `./spikesort.yaml`
//! 3. `<user config dir>/spikesort/config.yaml`
//! 4. `/etc/spikesort/config.yaml`
//!
//! ## Example
//!
//! ```yaml
//! sorter:
//!   num_channels: 64
//!   projection_mode: pca
//!   projection_dimension: 3
//!   max_components: 4
//!   min_training_spikes: 500
//!   acceptance_probability: 0.05
//! logging:
//!   level: debug
//!   format: compact
//! ```
//!
//! Every field has a default, so partial files are fine. Values are checked
//! by [`SorterConfig::validate`] when a sorter is built.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::channel_model::{ChannelFitSettings, OrderCriterion};
use crate::gmm::EmConfig;
use crate::observe::LogConfig;
use crate::projection::{delay_in_samples, ProjectionMode, ProjectionParams};

/// Environment variable naming a configuration file.
pub const CONFIG_ENV_VAR: &str = "SPIKESORT_CONFIG";

/// Error type for configuration operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Configuration file not found
    NotFound(String),
    /// Failed to read or write a configuration file
    ReadError(String),
    /// Failed to parse configuration
    ParseError(String),
    /// Invalid configuration value
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(msg) => write!(f, "config not found: {}", msg),
            ConfigError::ReadError(msg) => write!(f, "failed to read config: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "failed to parse config: {}", msg),
            ConfigError::ValidationError(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

/// Sorter parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    /// Electrode channels; spikes must carry a channel below this
    pub num_channels: usize,
    /// Samples before the threshold crossing
    pub samples_pre: usize,
    /// Samples after the threshold crossing
    pub samples_post: usize,
    /// Sample used by the inflection projections
    pub peak_sample_index: usize,
    pub sample_rate_hz: f64,
    /// Offset of the second dual-inflection sample after the peak
    pub second_sample_delay_ms: f64,
    pub projection_mode: ProjectionMode,
    /// Feature dimension for PCA and Haar
    pub projection_dimension: usize,
    /// Largest mixture order tried per channel
    pub max_components: usize,
    /// Channels with fewer reservoir spikes are not sorted
    pub min_training_spikes: usize,
    /// Smallest membership probability that still assigns a unit
    pub acceptance_probability: f64,
    /// Reservoir admission cap per channel
    pub max_training_spikes_per_channel: usize,
    /// Reservoir admission cap over all channels
    pub reservoir_capacity: usize,
    pub order_criterion: OrderCriterion,
    /// Base seed; each channel derives its own
    pub seed: u64,
    pub em: EmConfig,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            num_channels: 16,
            samples_pre: 10,
            samples_post: 21,
            peak_sample_index: 10,
            sample_rate_hz: 25_000.0,
            second_sample_delay_ms: 0.2,
            projection_mode: ProjectionMode::Pca,
            projection_dimension: 2,
            max_components: 5,
            min_training_spikes: 100,
            acceptance_probability: 0.01,
            max_training_spikes_per_channel: 1_000,
            reservoir_capacity: 25_000,
            order_criterion: OrderCriterion::Bic,
            seed: 42,
            em: EmConfig::default(),
        }
    }
}

impl SorterConfig {
    pub fn builder() -> SorterConfigBuilder {
        SorterConfigBuilder::new()
    }

    /// Samples per spike snippet.
    pub fn snippet_len(&self) -> usize {
        self.samples_pre + self.samples_post + 1
    }

    /// Index of the second dual-inflection sample.
    pub fn second_sample_index(&self) -> usize {
        self.peak_sample_index + delay_in_samples(self.sample_rate_hz, self.second_sample_delay_ms)
    }

    /// Projection parameters with the dual-inflection delay resolved.
    pub fn projection_params(&self) -> ProjectionParams {
        ProjectionParams {
            mode: self.projection_mode,
            snippet_len: self.snippet_len(),
            peak_sample: self.peak_sample_index,
            second_sample: self.second_sample_index(),
            dimension: self.projection_dimension,
        }
    }

    pub fn channel_fit_settings(&self) -> ChannelFitSettings {
        ChannelFitSettings {
            projection: self.projection_params(),
            max_components: self.max_components,
            criterion: self.order_criterion,
            acceptance_probability: self.acceptance_probability,
            em: self.em,
        }
    }

    /// Check every value; the first problem found is reported.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_channels == 0 {
            return Err(invalid("num_channels must be > 0"));
        }
        let len = self.snippet_len();
        if self.peak_sample_index >= len {
            return Err(invalid(format!(
                "peak_sample_index {} outside a {}-sample snippet",
                self.peak_sample_index, len
            )));
        }
        if !(self.sample_rate_hz > 0.0) || !self.sample_rate_hz.is_finite() {
            return Err(invalid("sample_rate_hz must be positive"));
        }
        if !(self.second_sample_delay_ms >= 0.0) {
            return Err(invalid("second_sample_delay_ms must be >= 0"));
        }
        if self.projection_mode == ProjectionMode::DualInflection
            && self.second_sample_index() >= len
        {
            return Err(invalid(format!(
                "second sample {} ({} ms after the peak) outside a {}-sample snippet",
                self.second_sample_index(),
                self.second_sample_delay_ms,
                len
            )));
        }
        if self.projection_mode.uses_dimension()
            && (self.projection_dimension == 0 || self.projection_dimension > len)
        {
            return Err(invalid(format!(
                "projection_dimension must be in 1..={} for {}",
                len, self.projection_mode
            )));
        }
        if !(self.acceptance_probability > 0.0 && self.acceptance_probability < 1.0) {
            return Err(invalid("acceptance_probability must be in (0, 1)"));
        }
        if self.max_components == 0 {
            return Err(invalid("max_components must be > 0"));
        }
        if self.min_training_spikes < self.max_components {
            return Err(invalid("min_training_spikes must be >= max_components"));
        }
        if self.max_training_spikes_per_channel == 0 || self.reservoir_capacity == 0 {
            return Err(invalid("reservoir caps must be > 0"));
        }
        if let OrderCriterion::LikelihoodRatio { significance } = self.order_criterion {
            if !(significance > 0.0 && significance < 1.0) {
                return Err(invalid("likelihood-ratio significance must be in (0, 1)"));
            }
        }
        if self.em.max_iterations == 0 {
            return Err(invalid("em.max_iterations must be > 0"));
        }
        if !(self.em.tolerance > 0.0) || !(self.em.regularization >= 0.0) {
            return Err(invalid("em.tolerance must be > 0 and em.regularization >= 0"));
        }
        if !(0.0..1.0).contains(&self.em.min_component_weight) {
            return Err(invalid("em.min_component_weight must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Builder for [`SorterConfig`].
#[derive(Debug, Clone, Default)]
pub struct SorterConfigBuilder {
    config: SorterConfig,
}

impl SorterConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_channels(mut self, n: usize) -> Self {
        self.config.num_channels = n;
        self
    }

    /// Snippet geometry; the peak sits at index `pre`.
    pub fn window(mut self, pre: usize, post: usize) -> Self {
        self.config.samples_pre = pre;
        self.config.samples_post = post;
        self.config.peak_sample_index = pre;
        self
    }

    pub fn peak_sample_index(mut self, index: usize) -> Self {
        self.config.peak_sample_index = index;
        self
    }

    pub fn sample_rate_hz(mut self, rate: f64) -> Self {
        self.config.sample_rate_hz = rate;
        self
    }

    pub fn second_sample_delay_ms(mut self, ms: f64) -> Self {
        self.config.second_sample_delay_ms = ms;
        self
    }

    pub fn projection(mut self, mode: ProjectionMode) -> Self {
        self.config.projection_mode = mode;
        self
    }

    pub fn projection_dimension(mut self, dim: usize) -> Self {
        self.config.projection_dimension = dim;
        self
    }

    pub fn max_components(mut self, k: usize) -> Self {
        self.config.max_components = k;
        self
    }

    pub fn min_training_spikes(mut self, n: usize) -> Self {
        self.config.min_training_spikes = n;
        self
    }

    pub fn acceptance_probability(mut self, p: f64) -> Self {
        self.config.acceptance_probability = p;
        self
    }

    pub fn max_training_spikes_per_channel(mut self, n: usize) -> Self {
        self.config.max_training_spikes_per_channel = n;
        self
    }

    pub fn reservoir_capacity(mut self, n: usize) -> Self {
        self.config.reservoir_capacity = n;
        self
    }

    pub fn order_criterion(mut self, criterion: OrderCriterion) -> Self {
        self.config.order_criterion = criterion;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn em(mut self, em: EmConfig) -> Self {
        self.config.em = em;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<SorterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeSortConfig {
    pub version: String,
    pub sorter: SorterConfig,
    pub logging: LogConfig,
}

impl Default for SpikeSortConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            sorter: SorterConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl SpikeSortConfig {
    /// Load from the search path, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(ConfigError::NotFound(format!(
                    "{} points to {}",
                    CONFIG_ENV_VAR,
                    path.display()
                )));
            }
            return Self::load_from(&path);
        }

        for path in Self::config_search_paths() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load and validate a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let config = Self::parse(&content)?;
        config.sorter.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse YAML without validating.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_yaml()?;
        std::fs::write(path, content)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Candidate files after the environment variable, in priority order.
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./spikesort.yaml")];
        if let Some(dirs) = directories::ProjectDirs::from("", "", "spikesort") {
            paths.push(dirs.config_dir().join("config.yaml"));
        }
        paths.push(PathBuf::from("/etc/spikesort/config.yaml"));
        paths
    }
}
