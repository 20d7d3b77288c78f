//! Save and restore of a complete sorter.
//!
//! A [`SorterSnapshot`] holds everything a [`SpikeSorter`] needs to resume
//! without retraining: the configuration, the training reservoir and the
//! current model (channel models with their frozen projections, plus the unit
//! dictionary). The JSON layout is whatever serde derives; callers should
//! treat it as opaque.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

use crate::config::SorterConfig;
use crate::reservoir::TrainingReservoir;
use crate::sorter::{SortingModel, SpikeSorter};
use crate::types::{SortError, SortResult};
use crate::units::UnitDictionary;

/// Layout version written into every snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SorterSnapshot {
    pub version: u32,
    pub config: SorterConfig,
    pub reservoir: TrainingReservoir,
    /// `None` until the first successful training pass.
    pub model: Option<SortingModel>,
}

impl SorterSnapshot {
    pub fn to_json(&self) -> SortResult<String> {
        serde_json::to_string(self).map_err(|e| SortError::Snapshot(e.to_string()))
    }

    /// Parse and check the layout version.
    pub fn from_json(json: &str) -> SortResult<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| SortError::Snapshot(e.to_string()))?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    pub fn save(&self, path: &Path) -> SortResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self).map_err(|e| SortError::Snapshot(e.to_string()))?;
        writer.flush()?;
        debug!(path = %path.display(), "snapshot written");
        Ok(())
    }

    pub fn load(path: &Path) -> SortResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: Self =
            serde_json::from_reader(reader).map_err(|e| SortError::Snapshot(e.to_string()))?;
        snapshot.check_version()?;
        debug!(path = %path.display(), "snapshot read");
        Ok(snapshot)
    }

    fn check_version(&self) -> SortResult<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SortError::Snapshot(format!(
                "unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }
        Ok(())
    }

    /// Reject snapshots whose parts disagree with their own configuration.
    fn check_consistency(&self) -> SortResult<()> {
        let config = &self.config;
        if self.reservoir.num_channels() != config.num_channels {
            return Err(SortError::Snapshot(format!(
                "reservoir has {} channels, configuration {}",
                self.reservoir.num_channels(),
                config.num_channels
            )));
        }
        if self.reservoir.snippet_len() != config.snippet_len() {
            return Err(SortError::Snapshot(format!(
                "reservoir holds {}-sample snippets, configuration {}",
                self.reservoir.snippet_len(),
                config.snippet_len()
            )));
        }
        if let Some(model) = &self.model {
            let mut expected = UnitDictionary::new();
            let mut previous: Option<usize> = None;
            for cm in model.channel_models() {
                if previous.map_or(false, |p| p >= cm.channel()) {
                    return Err(SortError::Snapshot(format!(
                        "channel models out of order at channel {}",
                        cm.channel()
                    )));
                }
                previous = Some(cm.channel());
                let start = expected.register_channel(cm.channel(), cm.k());
                if cm.unit_start() != start {
                    return Err(SortError::Snapshot(format!(
                        "channel {} starts at unit {}, expected {}",
                        cm.channel(),
                        cm.unit_start(),
                        start
                    )));
                }
                if cm.channel() >= config.num_channels {
                    return Err(SortError::Snapshot(format!(
                        "model for channel {} beyond {} configured channels",
                        cm.channel(),
                        config.num_channels
                    )));
                }
                if !cm.projection().accepts_len(config.snippet_len()) {
                    return Err(SortError::Snapshot(format!(
                        "channel {} {} projection does not fit {}-sample snippets",
                        cm.channel(),
                        cm.projection().mode(),
                        config.snippet_len()
                    )));
                }
            }
            if model.units() != &expected {
                return Err(SortError::Snapshot(
                    "unit dictionary does not match channel models".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl SpikeSorter {
    /// Copy of the full sorter state.
    pub fn snapshot(&self) -> SorterSnapshot {
        SorterSnapshot {
            version: SNAPSHOT_VERSION,
            config: self.config().clone(),
            reservoir: self.reservoir_snapshot(),
            model: self.model().map(|m| (*m).clone()),
        }
    }

    /// Rebuild a sorter from a snapshot. A snapshot taken after training can
    /// classify immediately.
    pub fn restore(snapshot: SorterSnapshot) -> SortResult<Self> {
        snapshot.check_version()?;
        snapshot.config.validate()?;
        snapshot.check_consistency()?;
        info!(
            channels = snapshot.config.num_channels,
            reservoir = snapshot.reservoir.len(),
            units = snapshot.model.as_ref().map_or(0, |m| m.total_units()),
            "sorter restored"
        );
        Ok(Self::from_parts(snapshot.config, snapshot.reservoir, snapshot.model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::ProjectionMode;
    use crate::rt::CancelToken;
    use crate::synth::{biphasic_template, SpikeGenerator};
    use crate::types::SpikeWaveform;

    fn trained() -> (SpikeSorter, SpikeGenerator, Vec<Vec<f64>>) {
        let config = SorterConfig::builder()
            .num_channels(2)
            .projection(ProjectionMode::Pca)
            .max_components(3)
            .min_training_spikes(100)
            .seed(7)
            .build()
            .unwrap();
        let sorter = SpikeSorter::new(config).unwrap();
        let templates = vec![
            biphasic_template(32, 10, 60.0, 1.5),
            biphasic_template(32, 10, 140.0, 2.5),
        ];
        let mut gen = SpikeGenerator::new(99, 5.0);
        sorter.hoard(&gen.batch(0, &templates, 300));
        sorter.hoard(&gen.batch(1, &templates, 20));
        sorter.train(&CancelToken::new()).unwrap();
        (sorter, gen, templates)
    }

    fn labels(sorter: &SpikeSorter, spikes: &[SpikeWaveform]) -> Vec<u32> {
        let mut spikes = spikes.to_vec();
        sorter.classify(&mut spikes).unwrap();
        spikes.iter().map(|s| s.unit).collect()
    }

    #[test]
    fn test_restored_sorter_classifies_identically() {
        let (sorter, mut gen, templates) = trained();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sorter.json");
        sorter.snapshot().save(&path).unwrap();

        let restored = SpikeSorter::restore(SorterSnapshot::load(&path).unwrap()).unwrap();
        assert!(restored.is_trained());
        assert_eq!(restored.channels_to_sort(), sorter.channels_to_sort());
        assert_eq!(restored.total_units(), sorter.total_units());
        assert_eq!(restored.reservoir_counts(), vec![300, 20]);

        let fresh = gen.batch(0, &templates, 200);
        assert_eq!(labels(&restored, &fresh), labels(&sorter, &fresh));
    }

    #[test]
    fn test_untrained_snapshot_round_trip() {
        let sorter = SpikeSorter::new(SorterConfig::default()).unwrap();
        let snapshot = sorter.snapshot();
        assert!(snapshot.model.is_none());
        let parsed = SorterSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(parsed, snapshot);
        let restored = SpikeSorter::restore(parsed).unwrap();
        assert!(!restored.is_trained());
    }

    #[test]
    fn test_rejects_bad_snapshots() {
        let (sorter, _, _) = trained();

        let mut wrong_version = sorter.snapshot();
        wrong_version.version = SNAPSHOT_VERSION + 1;
        let json = wrong_version.to_json().unwrap();
        assert!(matches!(SorterSnapshot::from_json(&json), Err(SortError::Snapshot(_))));

        let mut resized = sorter.snapshot();
        resized.config.samples_post += 4;
        assert!(matches!(SpikeSorter::restore(resized), Err(SortError::Snapshot(_))));

        assert!(matches!(SorterSnapshot::from_json("{not json"), Err(SortError::Snapshot(_))));
    }

    fn restore_json(json: serde_json::Value) -> SortResult<SpikeSorter> {
        SpikeSorter::restore(SorterSnapshot::from_json(&json.to_string())?)
    }

    #[test]
    fn test_rejects_inconsistent_reservoir() {
        let sorter = SpikeSorter::new(SorterConfig::builder().num_channels(2).build().unwrap()).unwrap();
        let good = serde_json::to_value(sorter.snapshot()).unwrap();
        assert!(restore_json(good.clone()).is_ok());

        let mut dropped_channel = good.clone();
        dropped_channel["reservoir"]["channels"] = serde_json::json!([[]]);
        assert!(matches!(restore_json(dropped_channel), Err(SortError::Snapshot(_))));

        let mut fewer_channels = good.clone();
        fewer_channels["reservoir"]["channels"] = serde_json::json!([[]]);
        fewer_channels["reservoir"]["num_channels"] = serde_json::json!(1);
        assert!(matches!(restore_json(fewer_channels), Err(SortError::Snapshot(_))));

        let mut wrong_length = good.clone();
        wrong_length["reservoir"]["snippet_len"] = serde_json::json!(40);
        assert!(matches!(restore_json(wrong_length), Err(SortError::Snapshot(_))));

        let mut miscounted = good.clone();
        miscounted["reservoir"]["len"] = serde_json::json!(3);
        assert!(matches!(restore_json(miscounted), Err(SortError::Snapshot(_))));
    }

    #[test]
    fn test_rejects_reservoir_over_cap() {
        let (sorter, _, _) = trained();
        let mut json = serde_json::to_value(sorter.snapshot()).unwrap();
        json["reservoir"]["per_channel_cap"] = serde_json::json!(100);
        assert!(matches!(restore_json(json), Err(SortError::Snapshot(_))));
    }

    #[test]
    fn test_rejects_overlapping_unit_numbers() {
        let (sorter, mut gen, templates) = trained();
        sorter.hoard(&gen.batch(1, &templates, 300));
        sorter.train(&CancelToken::new()).unwrap();
        assert_eq!(sorter.channels_to_sort(), vec![0, 1]);
        let good = serde_json::to_value(sorter.snapshot()).unwrap();
        assert!(restore_json(good.clone()).is_ok());

        let mut shifted = good.clone();
        shifted["model"]["channels"][1]["unit_start"] = serde_json::json!(0);
        assert!(matches!(restore_json(shifted), Err(SortError::Snapshot(_))));

        let mut renumbered = good.clone();
        renumbered["model"]["units"]["ranges"][1]["start"] = serde_json::json!(0);
        assert!(matches!(restore_json(renumbered), Err(SortError::Snapshot(_))));

        let mut reordered = good;
        let channels = reordered["model"]["channels"].as_array_mut().unwrap();
        channels.swap(0, 1);
        assert!(matches!(restore_json(reordered), Err(SortError::Snapshot(_))));
    }
}
