use std::collections::VecDeque;

use fieldtrack_proto::Position;
use time::{Date, OffsetDateTime, UtcOffset};

/// Samples kept when no capacity is configured.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Bounded FIFO of accepted samples, in arrival order.
#[derive(Debug, Clone)]
pub struct History {
    samples: VecDeque<Position>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { samples: VecDeque::with_capacity(capacity), capacity }
    }

    /// Appends `sample`, evicting the oldest entries beyond capacity.
    pub fn push(&mut self, sample: Position) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&Position> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.samples.iter()
    }

    pub fn to_vec(&self) -> Vec<Position> {
        self.samples.iter().cloned().collect()
    }

    /// Samples with `start <= timestamp <= end`.
    pub fn between(&self, start: OffsetDateTime, end: OffsetDateTime) -> Vec<Position> {
        self.samples
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Samples whose timestamp falls on `date` as seen at `offset`.
    pub fn on_date(&self, date: Date, offset: UtcOffset) -> impl Iterator<Item = &Position> {
        self.samples
            .iter()
            .filter(move |p| p.timestamp.to_offset(offset).date() == date)
    }
}
