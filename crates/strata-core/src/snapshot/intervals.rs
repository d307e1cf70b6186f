//! Interval algebra over half-open `[start, end)` millisecond ranges.

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

pub type Interval = (Timestamp, Timestamp);

/// Sort and coalesce overlapping or touching ranges, dropping empty ones.
pub fn merge_intervals(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.retain(|(start, end)| start < end);
    intervals.sort_unstable();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for (start, end) in intervals {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Ascending, non-overlapping, coalesced set of completed ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Intervals(Vec<Interval>);

impl Intervals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges<I: IntoIterator<Item = Interval>>(ranges: I) -> Self {
        Self(merge_intervals(ranges.into_iter().collect()))
    }

    pub fn as_slice(&self) -> &[Interval] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Interval> {
        self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn start(&self) -> Option<Timestamp> {
        self.0.first().map(|(start, _)| *start)
    }

    pub fn end(&self) -> Option<Timestamp> {
        self.0.last().map(|(_, end)| *end)
    }

    /// Record a completed range. Re-adding a covered range is a no-op.
    pub fn add(&mut self, interval: Interval) {
        let mut ranges = std::mem::take(&mut self.0);
        ranges.push(interval);
        self.0 = merge_intervals(ranges);
    }

    /// Forget completeness for a range, splitting ranges that straddle it.
    pub fn remove(&mut self, (start, end): Interval) {
        if start >= end {
            return;
        }
        let mut remaining = Vec::with_capacity(self.0.len() + 1);
        for &(low, high) in &self.0 {
            if high <= start || low >= end {
                remaining.push((low, high));
                continue;
            }
            if low < start {
                remaining.push((low, start));
            }
            if high > end {
                remaining.push((end, high));
            }
        }
        self.0 = remaining;
    }

    pub fn without(&self, interval: Interval) -> Self {
        let mut copy = self.clone();
        copy.remove(interval);
        copy
    }

    pub fn union(&self, other: &Intervals) -> Self {
        Self::from_ranges(self.0.iter().chain(other.0.iter()).copied())
    }

    /// Whether the whole of `interval` is recorded as complete.
    pub fn covers(&self, (start, end): Interval) -> bool {
        if start >= end {
            return true;
        }
        self.0.iter().any(|&(low, high)| low <= start && end <= high)
    }
}

impl<'a> IntoIterator for &'a Intervals {
    type Item = &'a Interval;
    type IntoIter = std::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
