// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cumulative exclusion map over extended sequence numbers.
//!
//! When a sequencer skips padding-only packets, the skipped sequence numbers
//! are never stored, but later sequence numbers still need to land on
//! contiguous ring slots. [`RangeMap`] records the skipped runs as half-open
//! exclusions and answers, for any sequence number, how many earlier numbers
//! were excluded — a stepwise, non-decreasing offset that the sequencer
//! subtracts before taking the slot index.

use crate::Error;

/// One excluded run `[start, end)` plus the cumulative excluded count that
/// applies to keys at or after `end` (up to the next exclusion).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Exclusion {
    start: u64,
    end: u64,
    offset_after: u64,
}

/// An append-only map from extended sequence number to cumulative excluded
/// count.
///
/// Exclusions must be appended in increasing order and are coalesced when
/// adjacent. History is bounded: when more than `capacity` disjoint
/// exclusions are retained, the oldest are folded into a base offset. Keys
/// older than the folded history resolve to that base offset, which is
/// correct for every key a bounded ring can still name.
#[derive(Clone, Debug)]
pub struct RangeMap {
    capacity: usize,
    base_offset: u64,
    exclusions: Vec<Exclusion>,
}

impl RangeMap {
    /// Creates a map retaining up to `capacity` disjoint exclusions.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            base_offset: 0,
            exclusions: Vec::new(),
        }
    }

    /// Returns the cumulative excluded count for `key`, or
    /// [`Error::ExcludedKey`] if `key` itself lies inside an exclusion.
    pub fn get_value(&self, key: u64) -> Result<u64, Error> {
        match self.exclusions.partition_point(|e| e.start <= key) {
            0 => Ok(self.base_offset),
            n => {
                let e = &self.exclusions[n - 1];
                if key < e.end {
                    Err(Error::ExcludedKey {
                        key,
                        start: e.start,
                        end: e.end,
                    })
                } else {
                    Ok(e.offset_after)
                }
            }
        }
    }

    /// Appends the exclusion `[start, end_exclusive)`.
    ///
    /// Coalesces with the previous exclusion when contiguous. Returns
    /// [`Error::InvalidRange`] for an empty range and [`Error::RangeOverlap`]
    /// when the range begins before the end of the last recorded exclusion.
    pub fn exclude_range(&mut self, start: u64, end_exclusive: u64) -> Result<(), Error> {
        if start >= end_exclusive {
            return Err(Error::InvalidRange {
                start,
                end: end_exclusive,
            });
        }
        let excluded = end_exclusive - start;
        match self.exclusions.last_mut() {
            Some(last) if start < last.end => {
                return Err(Error::RangeOverlap {
                    start,
                    end: end_exclusive,
                    prior_end: last.end,
                });
            }
            Some(last) if start == last.end => {
                last.end = end_exclusive;
                last.offset_after += excluded;
                return Ok(());
            }
            _ => {}
        }
        let offset_after = self
            .exclusions
            .last()
            .map_or(self.base_offset, |e| e.offset_after)
            + excluded;
        self.exclusions.push(Exclusion {
            start,
            end: end_exclusive,
            offset_after,
        });
        if self.exclusions.len() > self.capacity {
            let drop = self.exclusions.len() - self.capacity;
            self.base_offset = self.exclusions[drop - 1].offset_after;
            self.exclusions.drain(..drop);
        }
        Ok(())
    }
}
