//! # Spike Sorter
//!
//! Drives the hoard → train → classify lifecycle over all channels.
//!
//! ```text
//!  acquisition ──hoard()──► TrainingReservoir (Mutex, append-only to caps)
//!                                  │ snapshot at start of train()
//!                                  ▼
//!                 per channel (rayon): Projection::fit → ChannelModel::train
//!                                  │ merged in channel order
//!                                  ▼
//!                 SortingModel { channel models, UnitDictionary }
//!                                  │ swapped in whole (RwLock<Option<Arc<_>>>)
//!                                  ▼
//!  live spikes ──classify()──► unit labels written back
//! ```
//!
//! A training pass builds its model entirely off to the side; classification
//! keeps using the previous `Arc<SortingModel>` until the new one is swapped
//! in. A failed or cancelled pass leaves the previous model untouched.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, info_span, warn};

use crate::channel_model::{ChannelFitSettings, ChannelModel};
use crate::config::SorterConfig;
use crate::linalg::Matrix;
use crate::observe::SorterMetrics;
use crate::reservoir::{HoardReport, TrainingReservoir};
use crate::rt::{spawn_worker, CancelToken, WorkerConfig};
use crate::types::{SortError, SortResult, SpikeWaveform, NOISE_UNIT};
use crate::units::{UnitDictionary, UnitKey};

/// Name of the thread started by [`SpikeSorter::spawn_training`].
pub const TRAINING_THREAD_NAME: &str = "spikesort-train";

/// Seed of one channel's fit, derived from the configured base seed.
pub fn channel_seed(base: u64, channel: usize) -> u64 {
    base ^ (channel as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

// ---------------------------------------------------------------------------
// Model set
// ---------------------------------------------------------------------------

/// Immutable result of one training pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SortingModel {
    /// Sorted by channel.
    channels: Vec<ChannelModel>,
    units: UnitDictionary,
}

impl SortingModel {
    /// Assign unit starts in channel order and build the dictionary.
    fn assemble(mut channels: Vec<ChannelModel>) -> Self {
        channels.sort_by_key(ChannelModel::channel);
        let mut units = UnitDictionary::new();
        for model in &mut channels {
            let start = units.register_channel(model.channel(), model.k());
            model.set_unit_start(start);
        }
        Self { channels, units }
    }

    /// Channels with a trained model, ascending.
    pub fn channels_to_sort(&self) -> Vec<usize> {
        self.channels.iter().map(ChannelModel::channel).collect()
    }

    pub fn channel_model(&self, channel: usize) -> Option<&ChannelModel> {
        self.channels
            .binary_search_by_key(&channel, ChannelModel::channel)
            .ok()
            .map(|i| &self.channels[i])
    }

    pub fn channel_models(&self) -> &[ChannelModel] {
        &self.channels
    }

    pub fn units(&self) -> &UnitDictionary {
        &self.units
    }

    pub fn total_units(&self) -> usize {
        self.units.total_units()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What happened to one channel during a training pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Sorted {
        channel: usize,
        units: usize,
        unit_start: u32,
    },
    /// Fewer reservoir spikes than the training minimum.
    Skipped {
        channel: usize,
        spikes: usize,
        required: usize,
    },
    /// Projection or mixture fit failed; the channel is left unsorted.
    Failed { channel: usize, reason: String },
}

impl ChannelOutcome {
    pub fn channel(&self) -> usize {
        match self {
            ChannelOutcome::Sorted { channel, .. }
            | ChannelOutcome::Skipped { channel, .. }
            | ChannelOutcome::Failed { channel, .. } => *channel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainStatus {
    /// At least one channel is sorted.
    Sorted,
    /// The pass completed but no channel could be sorted.
    NothingSortable,
}

/// Summary of a completed training pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub status: TrainStatus,
    pub channels_sorted: usize,
    pub channels_skipped: usize,
    pub channels_failed: usize,
    pub total_units: usize,
    /// Reservoir spikes the pass trained on.
    pub training_spikes: usize,
    pub duration_ms: f64,
    /// One entry per channel, in channel order.
    pub outcomes: Vec<ChannelOutcome>,
}

impl TrainReport {
    pub fn is_success(&self) -> bool {
        self.status == TrainStatus::Sorted
    }
}

/// Summary of one [`SpikeSorter::classify`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyReport {
    /// Spikes assigned a unit
    pub classified: usize,
    /// Spikes on sorted channels labelled noise
    pub rejected: usize,
    /// Spikes on channels without a model, left untouched
    pub unsorted_channel: usize,
    /// Spikes with an unknown channel or wrong length, left untouched
    pub malformed: usize,
}

enum ChannelFit {
    Trained(ChannelModel),
    Skipped(usize),
    Failed(String),
}

// ---------------------------------------------------------------------------
// Sorter
// ---------------------------------------------------------------------------

/// Multi-channel spike sorter.
///
/// All methods take `&self`; share it across threads with `Arc`.
#[derive(Debug)]
pub struct SpikeSorter {
    config: SorterConfig,
    reservoir: Mutex<TrainingReservoir>,
    model: RwLock<Option<Arc<SortingModel>>>,
    metrics: SorterMetrics,
}

impl SpikeSorter {
    /// Validate `config` and create an untrained sorter.
    pub fn new(config: SorterConfig) -> SortResult<Self> {
        config.validate()?;
        let reservoir = TrainingReservoir::new(
            config.num_channels,
            config.snippet_len(),
            config.max_training_spikes_per_channel,
            config.reservoir_capacity,
        );
        Ok(Self::from_parts(config, reservoir, None))
    }

    pub(crate) fn from_parts(
        config: SorterConfig,
        reservoir: TrainingReservoir,
        model: Option<SortingModel>,
    ) -> Self {
        let metrics = SorterMetrics::new();
        if let Some(m) = &model {
            metrics.channels_sorted.set(m.channels.len() as i64);
            metrics.total_units.set(m.total_units() as i64);
        }
        Self {
            config,
            reservoir: Mutex::new(reservoir),
            model: RwLock::new(model.map(Arc::new)),
            metrics,
        }
    }

    pub fn config(&self) -> &SorterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SorterMetrics {
        &self.metrics
    }

    fn lock_reservoir(&self) -> MutexGuard<'_, TrainingReservoir> {
        self.reservoir.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add spikes to the training reservoir, up to the configured caps.
    pub fn hoard(&self, batch: &[SpikeWaveform]) -> HoardReport {
        let report = self.lock_reservoir().hoard(batch);
        self.metrics.spikes_hoarded.inc_by(report.admitted as u64);
        self.metrics.spikes_dropped.inc_by(report.dropped as u64);
        self.metrics.spikes_malformed.inc_by(report.malformed as u64);
        report
    }

    /// Copy of the current reservoir.
    pub fn reservoir_snapshot(&self) -> TrainingReservoir {
        self.lock_reservoir().clone()
    }

    pub fn reservoir_counts(&self) -> Vec<usize> {
        self.lock_reservoir().counts()
    }

    pub fn clear_reservoir(&self) {
        self.lock_reservoir().clear();
    }

    /// Train a fresh model set from the reservoir and swap it in.
    ///
    /// Fails with [`SortError::EmptyReservoir`] when nothing was hoarded and
    /// with [`SortError::Cancelled`] when `cancel` fires; in both cases the
    /// current model is kept. Channels that cannot be sorted are reported in
    /// the returned [`TrainReport`].
    pub fn train(&self, cancel: &CancelToken) -> SortResult<TrainReport> {
        let span = info_span!("train", channels = self.config.num_channels);
        let _entered = span.enter();
        let started = Instant::now();

        let reservoir = {
            let guard = self.lock_reservoir();
            if guard.is_empty() {
                warn!("training requested with an empty reservoir");
                return Err(SortError::EmptyReservoir);
            }
            guard.clone()
        };
        info!(spikes = reservoir.len(), "training started");

        let settings = self.config.channel_fit_settings();
        let fits = (0..self.config.num_channels)
            .into_par_iter()
            .map(|channel| {
                span.in_scope(|| self.train_channel(channel, &reservoir, &settings, cancel))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .collect::<SortResult<Vec<ChannelFit>>>();
        let fits = match fits {
            Ok(fits) => fits,
            Err(e) => {
                info!(error = %e, "training aborted, previous model kept");
                return Err(e);
            }
        };

        let mut outcomes = Vec::with_capacity(fits.len());
        let mut trained = Vec::new();
        for (channel, fit) in fits.into_iter().enumerate() {
            match fit {
                ChannelFit::Trained(model) => trained.push(model),
                ChannelFit::Skipped(spikes) => outcomes.push(ChannelOutcome::Skipped {
                    channel,
                    spikes,
                    required: self.config.min_training_spikes,
                }),
                ChannelFit::Failed(reason) => {
                    outcomes.push(ChannelOutcome::Failed { channel, reason })
                }
            }
        }

        let model = SortingModel::assemble(trained);
        for m in &model.channels {
            outcomes.push(ChannelOutcome::Sorted {
                channel: m.channel(),
                units: m.k(),
                unit_start: m.unit_start(),
            });
        }
        outcomes.sort_by_key(ChannelOutcome::channel);

        let count = |pred: fn(&ChannelOutcome) -> bool| outcomes.iter().filter(|o| pred(o)).count();
        let channels_sorted = model.channels.len();
        let channels_skipped = count(|o| matches!(o, ChannelOutcome::Skipped { .. }));
        let channels_failed = count(|o| matches!(o, ChannelOutcome::Failed { .. }));
        let total_units = model.total_units();
        let status = if model.is_empty() {
            TrainStatus::NothingSortable
        } else {
            TrainStatus::Sorted
        };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.install(model);

        self.metrics.training_runs.inc();
        self.metrics.training_failures.inc_by(channels_failed as u64);
        self.metrics.channels_sorted.set(channels_sorted as i64);
        self.metrics.total_units.set(total_units as i64);
        self.metrics.training_duration_ms.observe(duration_ms);

        if status == TrainStatus::NothingSortable {
            warn!(
                skipped = channels_skipped,
                failed = channels_failed,
                "training finished with no sortable channel"
            );
        } else {
            info!(
                sorted = channels_sorted,
                skipped = channels_skipped,
                failed = channels_failed,
                units = total_units,
                duration_ms,
                "training finished"
            );
        }

        Ok(TrainReport {
            status,
            channels_sorted,
            channels_skipped,
            channels_failed,
            total_units,
            training_spikes: reservoir.len(),
            duration_ms,
            outcomes,
        })
    }

    fn train_channel(
        &self,
        channel: usize,
        reservoir: &TrainingReservoir,
        settings: &ChannelFitSettings,
        cancel: &CancelToken,
    ) -> SortResult<ChannelFit> {
        if cancel.is_cancelled() {
            return Err(SortError::Cancelled);
        }
        let spikes = reservoir.count(channel);
        if spikes < self.config.min_training_spikes {
            if spikes > 0 {
                debug!(channel, spikes, "too few spikes to sort channel");
            }
            return Ok(ChannelFit::Skipped(spikes));
        }

        let snippets = reservoir.channel_matrix(channel);
        let seed = channel_seed(self.config.seed, channel);
        match ChannelModel::train(channel, &snippets, settings, seed, cancel) {
            Ok(model) => {
                debug!(channel, spikes, units = model.k(), "channel trained");
                Ok(ChannelFit::Trained(model))
            }
            Err(SortError::Cancelled) => Err(SortError::Cancelled),
            Err(e) => {
                warn!(channel, spikes, error = %e, "channel could not be sorted");
                Ok(ChannelFit::Failed(e.to_string()))
            }
        }
    }

    fn install(&self, model: SortingModel) {
        let mut slot = self.model.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(model));
    }

    /// Run [`train`](Self::train) on a named worker thread.
    pub fn spawn_training(
        self: &Arc<Self>,
        cancel: CancelToken,
    ) -> SortResult<JoinHandle<SortResult<TrainReport>>> {
        let sorter = Arc::clone(self);
        let handle = spawn_worker(&WorkerConfig::new(TRAINING_THREAD_NAME), move || {
            sorter.train(&cancel)
        })?;
        Ok(handle)
    }

    /// Label every spike on a sorted channel with its unit (or noise).
    ///
    /// Spikes on unsorted channels and malformed spikes keep their label.
    pub fn classify(&self, spikes: &mut [SpikeWaveform]) -> SortResult<ClassifyReport> {
        let model = self.model().ok_or(SortError::NotTrained)?;
        let len = self.config.snippet_len();
        let mut report = ClassifyReport::default();

        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); self.config.num_channels];
        for (i, spike) in spikes.iter().enumerate() {
            if spike.channel >= self.config.num_channels || spike.len() != len {
                report.malformed += 1;
            } else if model.channel_model(spike.channel).is_none() {
                report.unsorted_channel += 1;
            } else {
                groups[spike.channel].push(i);
            }
        }
        if report.malformed > 0 {
            warn!(malformed = report.malformed, "classify skipped malformed spikes");
            self.metrics.spikes_malformed.inc_by(report.malformed as u64);
        }

        let labels: Vec<Vec<(usize, u32)>> = {
            let view: &[SpikeWaveform] = spikes;
            model
                .channels
                .par_iter()
                .filter(|cm| !groups[cm.channel()].is_empty())
                .map(|cm| {
                    let members = &groups[cm.channel()];
                    let mut data = Vec::with_capacity(members.len() * len);
                    for &i in members {
                        data.extend_from_slice(&view[i].samples);
                    }
                    let snippets = Matrix::from_data(members.len(), len, data);
                    let classes = cm.classify_snippets(&snippets);
                    members
                        .iter()
                        .zip(classes)
                        .map(|(&i, class)| (i, cm.unit_label(class)))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (i, label) in labels.into_iter().flatten() {
            spikes[i].unit = label;
            if label == NOISE_UNIT {
                report.rejected += 1;
            } else {
                report.classified += 1;
            }
        }

        self.metrics.spikes_classified.inc_by(report.classified as u64);
        self.metrics.spikes_rejected.inc_by(report.rejected as u64);
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current model set, if any pass has completed.
    pub fn model(&self) -> Option<Arc<SortingModel>> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_trained(&self) -> bool {
        self.model().is_some()
    }

    pub fn channels_to_sort(&self) -> Vec<usize> {
        self.model().map(|m| m.channels_to_sort()).unwrap_or_default()
    }

    pub fn total_units(&self) -> usize {
        self.model().map_or(0, |m| m.total_units())
    }

    /// Channel and local index of an absolute unit id.
    pub fn unit_key(&self, unit: u32) -> Option<UnitKey> {
        self.model()?.units().lookup(unit)
    }

    /// Channel of an absolute unit id.
    pub fn unit_channel(&self, unit: u32) -> Option<usize> {
        self.unit_key(unit).map(|k| k.channel)
    }

    /// Absolute id of local unit `local` on `channel`.
    pub fn unit_for(&self, channel: usize, local: usize) -> Option<u32> {
        self.model()?.units().absolute_id(channel, local)
    }

    /// Units found on `channel` by the current model.
    pub fn channel_units(&self, channel: usize) -> usize {
        self.model()
            .and_then(|m| m.channel_model(channel).map(ChannelModel::k))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{Projection, ProjectionMode};
    use crate::synth::{biphasic_template, LabeledSpike, SpikeGenerator};

    const NOISE_STD: f64 = 5.0;

    fn config(mode: ProjectionMode, channels: usize, min_spikes: usize) -> SorterConfig {
        SorterConfig::builder()
            .num_channels(channels)
            .projection(mode)
            .projection_dimension(2)
            .max_components(4)
            .min_training_spikes(min_spikes)
            .acceptance_probability(0.01)
            .seed(1234)
            .build()
            .unwrap()
    }

    fn templates(channel: usize) -> Vec<Vec<f64>> {
        let shift = 5.0 * channel as f64;
        vec![
            biphasic_template(32, 10, 60.0 + shift, 1.5),
            biphasic_template(32, 10, 130.0 + shift, 2.5),
        ]
    }

    fn labeled(gen: &mut SpikeGenerator, channel: usize, count: usize) -> Vec<LabeledSpike> {
        gen.labeled(channel, &templates(channel), count)
    }

    fn strip(spikes: Vec<LabeledSpike>) -> Vec<SpikeWaveform> {
        spikes.into_iter().map(|l| l.spike).collect()
    }

    /// Label the noise-free template of each unit, which sits at its cluster center.
    fn expected_labels(sorter: &SpikeSorter, channel: usize) -> Vec<u32> {
        let mut spikes: Vec<SpikeWaveform> = templates(channel)
            .into_iter()
            .map(|t| SpikeWaveform::new(channel, 0, -20.0, t))
            .collect();
        sorter.classify(&mut spikes).unwrap();
        spikes.iter().map(|s| s.unit).collect()
    }

    fn trained_sorter(mode: ProjectionMode) -> (SpikeSorter, SpikeGenerator) {
        let sorter = SpikeSorter::new(config(mode, 2, 100)).unwrap();
        let mut gen = SpikeGenerator::new(17, NOISE_STD);
        for channel in 0..2 {
            sorter.hoard(&strip(labeled(&mut gen, channel, 300)));
        }
        sorter.train(&CancelToken::new()).unwrap();
        (sorter, gen)
    }

    #[test]
    fn test_end_to_end_four_channels() {
        let sorter = SpikeSorter::new(config(ProjectionMode::Pca, 4, 500)).unwrap();
        let mut gen = SpikeGenerator::new(2024, NOISE_STD);
        for channel in 0..3 {
            let report = sorter.hoard(&strip(labeled(&mut gen, channel, 600)));
            assert_eq!(report.admitted, 600);
        }
        sorter.hoard(&strip(labeled(&mut gen, 3, 10)));

        let report = sorter.train(&CancelToken::new()).unwrap();
        assert!(report.is_success());
        assert_eq!(sorter.channels_to_sort(), vec![0, 1, 2]);
        for channel in 0..3 {
            assert_eq!(sorter.channel_units(channel), 2);
        }
        assert_eq!(sorter.total_units(), 6);
        assert_eq!(report.channels_skipped, 1);
        assert!(matches!(
            report.outcomes[3],
            ChannelOutcome::Skipped { channel: 3, spikes: 10, required: 500 }
        ));

        for channel in 0..3 {
            let expected = expected_labels(&sorter, channel);
            assert_ne!(expected[0], expected[1]);
            assert!(expected.iter().all(|&u| u != NOISE_UNIT));

            let fresh = labeled(&mut gen, channel, 400);
            let truth: Vec<usize> = fresh.iter().map(|l| l.unit).collect();
            let mut spikes = strip(fresh);
            sorter.classify(&mut spikes).unwrap();
            let correct = spikes
                .iter()
                .zip(&truth)
                .filter(|(s, &u)| s.unit == expected[u])
                .count();
            assert!(
                correct as f64 >= 0.95 * spikes.len() as f64,
                "channel {channel}: {correct}/{} correct",
                spikes.len()
            );
        }
    }

    #[test]
    fn test_retraining_is_idempotent() {
        let (sorter, mut gen) = trained_sorter(ProjectionMode::Pca);
        let first = sorter.model().unwrap();
        let held_out = strip(labeled(&mut gen, 0, 100));
        let mut a = held_out.clone();
        sorter.classify(&mut a).unwrap();

        sorter.train(&CancelToken::new()).unwrap();
        let second = sorter.model().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);

        let mut b = held_out;
        sorter.classify(&mut b).unwrap();
        let labels = |v: &[SpikeWaveform]| v.iter().map(|s| s.unit).collect::<Vec<_>>();
        assert_eq!(labels(&a), labels(&b));
    }

    #[test]
    fn test_reservoir_cap_through_sorter() {
        let config = SorterConfig::builder()
            .num_channels(3)
            .max_components(2)
            .min_training_spikes(10)
            .max_training_spikes_per_channel(25)
            .build()
            .unwrap();
        let sorter = SpikeSorter::new(config).unwrap();
        let mut gen = SpikeGenerator::new(5, NOISE_STD);
        for _ in 0..4 {
            for channel in 0..3 {
                sorter.hoard(&gen.batch(channel, &templates(channel), 7 + channel));
            }
        }
        assert!(sorter.reservoir_counts().iter().all(|&c| c <= 25));
        assert_eq!(sorter.reservoir_counts()[2], 25);
        let snapshot = sorter.metrics().snapshot();
        assert_eq!(snapshot.spikes_hoarded + snapshot.spikes_dropped, 4 * (7 + 8 + 9));
    }

    #[test]
    fn test_labels_within_unit_range() {
        for mode in [
            ProjectionMode::SingleInflection,
            ProjectionMode::DualInflection,
            ProjectionMode::Pca,
            ProjectionMode::Haar,
        ] {
            let (sorter, mut gen) = trained_sorter(mode);
            assert_eq!(sorter.channels_to_sort(), vec![0, 1], "{mode}");
            for channel in 0..2 {
                assert!(sorter.channel_units(channel) >= 1, "{mode}");
            }

            let mut spikes = Vec::new();
            for channel in 0..2 {
                spikes.extend(strip(labeled(&mut gen, channel, 150)));
            }
            // Far outside every cluster.
            spikes.push(SpikeWaveform::new(0, 0, -20.0, vec![900.0; 32]));
            spikes.push(SpikeWaveform::new(1, 0, -20.0, vec![0.0; 7]));
            let report = sorter.classify(&mut spikes).unwrap();

            let total = sorter.total_units() as u32;
            assert!(spikes.iter().all(|s| s.unit <= total), "{mode}");
            assert_eq!(spikes[spikes.len() - 2].unit, NOISE_UNIT, "{mode}");
            assert_eq!(report.malformed, 1);
            assert_eq!(report.classified + report.rejected, spikes.len() - 1);
            assert!(report.rejected >= 1, "{mode}");
            assert!(report.classified > 0, "{mode}");
            assert_eq!(sorter.metrics().snapshot().spikes_malformed, 1);
        }
    }

    #[test]
    fn test_unit_dictionary_round_trip() {
        let (sorter, _) = trained_sorter(ProjectionMode::Pca);
        let total = sorter.total_units() as u32;
        assert!(total > 0);
        let mut seen = std::collections::HashSet::new();
        for id in 1..=total {
            let key = sorter.unit_key(id).unwrap();
            assert_eq!(sorter.unit_for(key.channel, key.local), Some(id));
            assert_eq!(sorter.unit_channel(id), Some(key.channel));
            assert!(seen.insert((key.channel, key.local)));
        }
        assert_eq!(sorter.unit_key(total + 1), None);
        assert_eq!(sorter.unit_key(NOISE_UNIT), None);
    }

    #[test]
    fn test_projection_is_frozen_at_training() {
        for mode in [ProjectionMode::Pca, ProjectionMode::DualInflection] {
            let (sorter, mut gen) = trained_sorter(mode);
            let reservoir = sorter.reservoir_snapshot();
            let model = sorter.model().unwrap();
            let channel_model = model.channel_model(0).unwrap();
            let training = reservoir.channel_matrix(0);

            let params = sorter.config().projection_params();
            let refit = Projection::fit(&params, &training).unwrap();
            assert_eq!(channel_model.projection(), &refit);
            assert_eq!(channel_model.features(&training), refit.project_all(&training));

            // The batch a spike arrives in does not change its label.
            let mut alone: Vec<SpikeWaveform> = reservoir.channel(0).to_vec();
            sorter.classify(&mut alone).unwrap();
            let mut mixed = reservoir.channel(0).to_vec();
            mixed.extend(strip(labeled(&mut gen, 0, 200)));
            sorter.classify(&mut mixed).unwrap();
            for (a, b) in alone.iter().zip(&mixed) {
                assert_eq!(a.unit, b.unit);
            }
        }
    }

    #[test]
    fn test_dual_inflection_uses_delay() {
        let (sorter, _) = trained_sorter(ProjectionMode::DualInflection);
        let model = sorter.model().unwrap();
        match model.channel_model(1).unwrap().projection() {
            Projection::DualInflection { peak, second } => {
                assert_eq!(*peak, 10);
                assert_eq!(*second, 15);
            }
            other => panic!("unexpected projection {:?}", other.mode()),
        }
    }

    #[test]
    fn test_preconditions() {
        let sorter = SpikeSorter::new(config(ProjectionMode::Pca, 2, 50)).unwrap();
        let mut spikes = vec![SpikeWaveform::new(0, 0, -20.0, vec![0.0; 32])];
        assert!(matches!(sorter.classify(&mut spikes), Err(SortError::NotTrained)));
        assert!(matches!(
            sorter.train(&CancelToken::new()),
            Err(SortError::EmptyReservoir)
        ));
        assert!(!sorter.is_trained());
        assert_eq!(sorter.total_units(), 0);
    }

    #[test]
    fn test_nothing_sortable_is_reported() {
        let sorter = SpikeSorter::new(config(ProjectionMode::Pca, 2, 500)).unwrap();
        let mut gen = SpikeGenerator::new(1, NOISE_STD);
        sorter.hoard(&strip(labeled(&mut gen, 0, 20)));
        let report = sorter.train(&CancelToken::new()).unwrap();
        assert_eq!(report.status, TrainStatus::NothingSortable);
        assert!(sorter.is_trained());
        assert!(sorter.channels_to_sort().is_empty());

        let mut spikes = strip(labeled(&mut gen, 0, 5));
        let report = sorter.classify(&mut spikes).unwrap();
        assert_eq!(report.unsorted_channel, 5);
        assert!(spikes.iter().all(|s| s.unit == NOISE_UNIT));
    }

    #[test]
    fn test_failed_channel_is_excluded() {
        let sorter = SpikeSorter::new(config(ProjectionMode::Pca, 2, 100)).unwrap();
        let mut gen = SpikeGenerator::new(9, NOISE_STD);
        sorter.hoard(&strip(labeled(&mut gen, 0, 200)));
        // Identical snippets leave PCA nothing to fit.
        let mut flat = SpikeGenerator::new(9, 0.0);
        sorter.hoard(&flat.batch(1, &templates(1)[..1], 200));

        let report = sorter.train(&CancelToken::new()).unwrap();
        assert_eq!(report.channels_failed, 1);
        assert_eq!(sorter.channels_to_sort(), vec![0]);
        assert!(matches!(report.outcomes[1], ChannelOutcome::Failed { channel: 1, .. }));
        assert_eq!(sorter.metrics().snapshot().training_failures, 1);
    }

    #[test]
    fn test_short_channel_fails_pca_locally() {
        let config = SorterConfig::builder()
            .num_channels(1)
            .projection(ProjectionMode::Pca)
            .projection_dimension(5)
            .max_components(1)
            .min_training_spikes(3)
            .build()
            .unwrap();
        let sorter = SpikeSorter::new(config).unwrap();
        let mut gen = SpikeGenerator::new(4, NOISE_STD);
        sorter.hoard(&strip(labeled(&mut gen, 0, 3)));

        let report = sorter.train(&CancelToken::new()).unwrap();
        assert_eq!(report.status, TrainStatus::NothingSortable);
        assert_eq!(report.channels_failed, 1);
        assert!(matches!(report.outcomes[0], ChannelOutcome::Failed { channel: 0, .. }));
        assert!(sorter.channels_to_sort().is_empty());
    }

    #[test]
    fn test_cancelled_training_keeps_model() {
        let (sorter, _) = trained_sorter(ProjectionMode::Pca);
        let before = sorter.model().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(sorter.train(&cancel), Err(SortError::Cancelled)));
        assert!(Arc::ptr_eq(&before, &sorter.model().unwrap()));
    }

    #[test]
    fn test_background_training_while_classifying() {
        let (sorter, mut gen) = trained_sorter(ProjectionMode::Pca);
        let sorter = Arc::new(sorter);
        let before = sorter.total_units() as u32;
        let handle = sorter.spawn_training(CancelToken::new()).unwrap();

        let mut spikes = strip(labeled(&mut gen, 1, 50));
        sorter.classify(&mut spikes).unwrap();
        assert!(spikes.iter().all(|s| s.unit <= before));

        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.total_units as u32, before);
        assert_eq!(sorter.metrics().snapshot().training_runs, 2);
    }
}
