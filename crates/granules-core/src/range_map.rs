// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! A sorted interval map over keys.
//!
//! The map always covers `[Key::EMPTY, map_end)` with non-overlapping,
//! totally ordered intervals; inserting fragments neighbors as needed.
//! Intervals are stored by their start key; each interval extends to the
//! start of the next one.

use rand::Rng;

use crate::{Key, KeyRange};
use std::collections::BTreeMap;

/// An interval map assigning a value to every key in `[Key::EMPTY, map_end)`.
#[derive(Debug, Clone)]
pub struct RangeMap<V> {
    entries: BTreeMap<Key, V>,
    map_end: Key,
}

impl<V: Clone> RangeMap<V> {
    /// Creates a map covering `[Key::EMPTY, map_end)` with `default`.
    pub fn new(default: V, map_end: Key) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(Key::EMPTY, default);
        Self { entries, map_end }
    }

    /// Upper bound of the covered key space.
    pub fn map_end(&self) -> &Key {
        &self.map_end
    }

    /// The number of stored intervals.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; the map covers the key space even when freshly created.
    pub fn is_empty(&self) -> bool {
        false
    }

    // Start key of the interval containing `key`.
    fn boundary_at_or_before(&self, key: &Key) -> Key {
        self.entries
            .range::<Key, _>(..=key)
            .next_back()
            .map(|(start, _)| start.clone())
            .expect("the map always has a boundary at the empty key")
    }

    // End key of the interval starting at `start`.
    fn end_of(&self, start: &Key) -> Key {
        self.entries
            .range::<Key, _>((
                std::ops::Bound::Excluded(start),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(next, _)| next.clone())
            .unwrap_or_else(|| self.map_end.clone())
    }

    /// Replaces the value over `range`, fragmenting overlapping intervals.
    ///
    /// `O(log n + k)` for `k` overlapped intervals. Empty ranges are ignored.
    pub fn insert(&mut self, range: KeyRange, value: V) {
        if range.is_empty() {
            return;
        }
        debug_assert!(
            range.end <= self.map_end,
            "insert must stay inside the covered key space"
        );

        // Preserve the truncated tail of the interval straddling `range.end`.
        if !self.entries.contains_key(&range.end) && range.end < self.map_end {
            let tail_value = self
                .entries
                .range::<Key, _>(..=&range.end)
                .next_back()
                .map(|(_, v)| v.clone())
                .expect("the map always has a boundary at the empty key");
            self.entries.insert(range.end.clone(), tail_value);
        }

        // Drop every boundary inside the inserted range, then set its start.
        let inner: Vec<Key> = self
            .entries
            .range::<Key, _>(&range.begin..&range.end)
            .map(|(k, _)| k.clone())
            .collect();
        for key in inner {
            self.entries.remove(&key);
        }
        self.entries.insert(range.begin, value);
    }

    /// Returns the unique interval covering `key` and its value.
    ///
    /// Panics if `key` is outside the covered key space.
    pub fn range_containing(&self, key: &Key) -> (KeyRange, &V) {
        assert!(*key < self.map_end, "key outside the covered key space");
        let start = self.boundary_at_or_before(key);
        let end = self.end_of(&start);
        let value = &self.entries[&start];
        (KeyRange::new(start, end), value)
    }

    /// Returns every stored interval overlapping `range`, in key order.
    pub fn intersecting_ranges(&self, range: &KeyRange) -> Vec<(KeyRange, &V)> {
        if range.is_empty() {
            return Vec::new();
        }
        let first = self.boundary_at_or_before(&range.begin);
        let mut result = Vec::new();
        for (start, value) in self.entries.range::<Key, _>(&first..&range.end) {
            let end = self.end_of(start);
            if end > range.begin {
                result.push((KeyRange::new(start.clone(), end), value));
            }
        }
        result
    }

    /// Returns all stored intervals in key order.
    pub fn ranges(&self) -> Vec<(KeyRange, &V)> {
        self.entries
            .iter()
            .map(|(start, value)| (KeyRange::new(start.clone(), self.end_of(start)), value))
            .collect()
    }

    /// Uniformly picks one stored interval.
    pub fn random_range<R: Rng>(&self, rng: &mut R) -> (KeyRange, &V) {
        let idx = rng.gen_range(0..self.entries.len());
        let (start, value) = self.entries.iter().nth(idx).expect("index is in bounds");
        (KeyRange::new(start.clone(), self.end_of(start)), value)
    }
}

impl<V: Clone + PartialEq> RangeMap<V> {
    /// Merges neighboring intervals inside `bounds` that share a value.
    pub fn coalesce(&mut self, bounds: &KeyRange) {
        let candidates: Vec<Key> = self
            .entries
            .range::<Key, _>((
                std::ops::Bound::Excluded(&bounds.begin),
                std::ops::Bound::Included(&bounds.end),
            ))
            .map(|(k, _)| k.clone())
            .collect();
        for key in candidates {
            let previous = self
                .entries
                .range::<Key, _>(..&key)
                .next_back()
                .map(|(_, v)| v.clone())
                .expect("the map always has a boundary at the empty key");
            if self.entries[&key] == previous {
                self.entries.remove(&key);
            }
        }
    }
}
