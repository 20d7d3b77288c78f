//! Bounded store of training spikes.
//!
//! Admission is first-come: a channel accepts spikes until it holds
//! `per_channel_cap` of them, and the whole reservoir stops at `capacity`.
//! Nothing is ever evicted, so a fast-firing channel cannot crowd out a slow
//! one beyond its own cap.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::linalg::Matrix;
use crate::types::SpikeWaveform;

/// Outcome of one [`TrainingReservoir::hoard`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoardReport {
    /// Spikes stored
    pub admitted: usize,
    /// Spikes refused because a cap was reached
    pub dropped: usize,
    /// Spikes with an unknown channel or wrong snippet length
    pub malformed: usize,
}

impl HoardReport {
    pub fn total(&self) -> usize {
        self.admitted + self.dropped + self.malformed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredReservoir")]
pub struct TrainingReservoir {
    num_channels: usize,
    snippet_len: usize,
    per_channel_cap: usize,
    capacity: usize,
    channels: Vec<Vec<SpikeWaveform>>,
    len: usize,
}

/// Serialized form, checked before it becomes a [`TrainingReservoir`].
#[derive(Deserialize)]
struct StoredReservoir {
    num_channels: usize,
    snippet_len: usize,
    per_channel_cap: usize,
    capacity: usize,
    channels: Vec<Vec<SpikeWaveform>>,
    len: usize,
}

impl TryFrom<StoredReservoir> for TrainingReservoir {
    type Error = String;

    fn try_from(stored: StoredReservoir) -> Result<Self, Self::Error> {
        if stored.channels.len() != stored.num_channels {
            return Err(format!(
                "reservoir holds {} channel lists for {} channels",
                stored.channels.len(),
                stored.num_channels
            ));
        }
        let mut total = 0;
        for (channel, spikes) in stored.channels.iter().enumerate() {
            if spikes.len() > stored.per_channel_cap {
                return Err(format!(
                    "channel {} holds {} spikes over its cap of {}",
                    channel,
                    spikes.len(),
                    stored.per_channel_cap
                ));
            }
            if let Some(bad) = spikes
                .iter()
                .find(|s| s.channel != channel || s.len() != stored.snippet_len)
            {
                return Err(format!(
                    "channel {} list holds a {}-sample spike from channel {}",
                    channel,
                    bad.len(),
                    bad.channel
                ));
            }
            total += spikes.len();
        }
        if total != stored.len {
            return Err(format!(
                "reservoir length {} disagrees with {} stored spikes",
                stored.len, total
            ));
        }
        if total > stored.capacity {
            return Err(format!(
                "{} stored spikes exceed the capacity of {}",
                total, stored.capacity
            ));
        }
        Ok(Self {
            num_channels: stored.num_channels,
            snippet_len: stored.snippet_len,
            per_channel_cap: stored.per_channel_cap,
            capacity: stored.capacity,
            channels: stored.channels,
            len: stored.len,
        })
    }
}

impl TrainingReservoir {
    pub fn new(num_channels: usize, snippet_len: usize, per_channel_cap: usize, capacity: usize) -> Self {
        Self {
            num_channels,
            snippet_len,
            per_channel_cap,
            capacity,
            channels: vec![Vec::new(); num_channels],
            len: 0,
        }
    }

    /// Store what fits of `batch`.
    pub fn hoard(&mut self, batch: &[SpikeWaveform]) -> HoardReport {
        let mut report = HoardReport::default();
        for spike in batch {
            if spike.channel >= self.num_channels || spike.len() != self.snippet_len {
                report.malformed += 1;
                continue;
            }
            let slot = &mut self.channels[spike.channel];
            if slot.len() >= self.per_channel_cap || self.len >= self.capacity {
                report.dropped += 1;
                continue;
            }
            slot.push(spike.clone());
            self.len += 1;
            report.admitted += 1;
        }
        if report.malformed > 0 {
            warn!(
                malformed = report.malformed,
                channels = self.num_channels,
                snippet_len = self.snippet_len,
                "dropped malformed spikes"
            );
        }
        report
    }

    /// Spikes held for `channel`, in arrival order.
    pub fn channel(&self, channel: usize) -> &[SpikeWaveform] {
        self.channels.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Snippets of `channel` as a row matrix.
    pub fn channel_matrix(&self, channel: usize) -> Matrix {
        let spikes = self.channel(channel);
        let mut data = Vec::with_capacity(spikes.len() * self.snippet_len);
        for spike in spikes {
            data.extend_from_slice(&spike.samples);
        }
        Matrix::from_data(spikes.len(), self.snippet_len, data)
    }

    pub fn count(&self, channel: usize) -> usize {
        self.channel(channel).len()
    }

    /// Spike count of every channel.
    pub fn counts(&self) -> Vec<usize> {
        self.channels.iter().map(Vec::len).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn snippet_len(&self) -> usize {
        self.snippet_len
    }

    pub fn per_channel_cap(&self) -> usize {
        self.per_channel_cap
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.channels.iter_mut().for_each(Vec::clear);
        self.len = 0;
    }
}
