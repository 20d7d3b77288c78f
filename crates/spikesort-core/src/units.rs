//! Global unit numbering.
//!
//! Absolute unit ids are contiguous from 1 in channel registration order; id 0
//! is noise on every channel. The dictionary is rebuilt from scratch on every
//! training pass.

use serde::{Deserialize, Serialize};

use crate::types::NOISE_UNIT;

/// A unit as seen from its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub channel: usize,
    /// Zero-based component index within the channel.
    pub local: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ChannelRange {
    channel: usize,
    start: u32,
    count: u32,
}

/// Bidirectional map between absolute unit ids and `(channel, local)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDictionary {
    /// `units[id - 1]` is the key of absolute id `id`.
    units: Vec<UnitKey>,
    /// Sorted by channel.
    ranges: Vec<ChannelRange>,
}

impl UnitDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `count` units for `channel` and return the number of units
    /// allocated before it (the channel's unit start).
    ///
    /// Channels must be registered in increasing order, each at most once.
    pub fn register_channel(&mut self, channel: usize, count: usize) -> u32 {
        debug_assert!(self.ranges.last().map_or(true, |r| r.channel < channel));
        let start = self.units.len() as u32;
        self.units
            .extend((0..count).map(|local| UnitKey { channel, local }));
        self.ranges.push(ChannelRange {
            channel,
            start,
            count: count as u32,
        });
        start
    }

    /// Key of an absolute unit id; `None` for noise and unknown ids.
    pub fn lookup(&self, id: u32) -> Option<UnitKey> {
        if id == NOISE_UNIT {
            return None;
        }
        self.units.get(id as usize - 1).copied()
    }

    /// Absolute id of `(channel, local)`.
    pub fn absolute_id(&self, channel: usize, local: usize) -> Option<u32> {
        let range = self.range(channel)?;
        (local < range.count as usize).then(|| range.start + local as u32 + 1)
    }

    /// Unit start of `channel`, if it was registered.
    pub fn unit_start(&self, channel: usize) -> Option<u32> {
        self.range(channel).map(|r| r.start)
    }

    /// Units of `channel`.
    pub fn units_on(&self, channel: usize) -> usize {
        self.range(channel).map_or(0, |r| r.count as usize)
    }

    pub fn total_units(&self) -> usize {
        self.units.len()
    }

    /// `(absolute id, key)` for every unit, in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, UnitKey)> + '_ {
        self.units
            .iter()
            .enumerate()
            .map(|(i, key)| (i as u32 + 1, *key))
    }

    fn range(&self, channel: usize) -> Option<&ChannelRange> {
        self.ranges
            .binary_search_by_key(&channel, |r| r.channel)
            .ok()
            .map(|i| &self.ranges[i])
    }
}
