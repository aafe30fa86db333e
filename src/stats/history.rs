// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed ring of per-sequence-number packet records.
//!
//! The stats engine needs to answer two questions after the fact: "was this
//! sequence number actually sent?" (to tell duplicates from late arrivals)
//! and "what was sent between two receiver reports?" (to attribute bytes and
//! losses to a reporting interval). Both are bounded by how far back a
//! receiver can usefully refer, so a fixed power-of-two ring indexed by a
//! bitmask of the extended sequence number is enough.

use log::error;

/// Ring size. Must stay a power of two; indexing is `esn & MASK`.
pub(crate) const SN_RECORD_SIZE: usize = 4096;
const SN_RECORD_MASK: u64 = SN_RECORD_SIZE as u64 - 1;

const FLAG_MARKER: u8 = 1 << 0;
const FLAG_PADDING: u8 = 1 << 1;
const FLAG_OUT_OF_ORDER: u8 = 1 << 2;

/// One slot. `pkt_size == 0` means the sequence number is missing: either
/// never seen or declared lost when a later packet revealed the gap.
#[derive(Copy, Clone, Debug, Default)]
struct SnRecord {
    pkt_size: u16,
    hdr_size: u8,
    flags: u8,
}

/// Totals over a run of sequence numbers, as walked out of the ring.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IntervalStats {
    pub packets: u64,
    pub bytes: u64,
    pub header_bytes: u64,
    pub packets_padding: u64,
    pub bytes_padding: u64,
    pub header_bytes_padding: u64,
    pub packets_lost: u64,
    pub packets_out_of_order: u64,
    pub frames: u32,
}

impl IntervalStats {
    pub fn aggregate(&mut self, other: &IntervalStats) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.header_bytes += other.header_bytes;
        self.packets_padding += other.packets_padding;
        self.bytes_padding += other.bytes_padding;
        self.header_bytes_padding += other.header_bytes_padding;
        self.packets_lost += other.packets_lost;
        self.packets_out_of_order += other.packets_out_of_order;
        self.frames += other.frames;
    }
}

#[derive(Clone)]
pub(crate) struct SnHistory {
    records: Box<[SnRecord; SN_RECORD_SIZE]>,
}

impl SnHistory {
    pub fn new() -> Self {
        Self {
            records: Box::new(
                [SnRecord {
                    pkt_size: 0,
                    hdr_size: 0,
                    flags: 0,
                }; SN_RECORD_SIZE],
            ),
        }
    }

    /// Slot for a sequence number at or behind the highest (`ehsn`), or
    /// `None` when it is too old for the ring or ahead of the highest.
    fn bounded_slot(&self, esn: u64, ehsn: u64) -> Option<usize> {
        let offset = ehsn.wrapping_sub(esn) as i64;
        if !(0..SN_RECORD_SIZE as i64).contains(&offset) {
            return None;
        }
        Some((esn & SN_RECORD_MASK) as usize)
    }

    /// Records the packet for `esn`. For a sequence number behind the
    /// current highest, the write is dropped if the slot has already been
    /// lapped.
    pub fn set(
        &mut self,
        esn: u64,
        ehsn: u64,
        pkt_size: u16,
        hdr_size: u8,
        payload_size: u16,
        marker: bool,
        out_of_order: bool,
    ) {
        let slot = if (esn.wrapping_sub(ehsn) as i64) < 0 {
            match self.bounded_slot(esn, ehsn) {
                Some(slot) => slot,
                None => return,
            }
        } else {
            (esn & SN_RECORD_MASK) as usize
        };
        let rec = &mut self.records[slot];
        rec.pkt_size = pkt_size;
        rec.hdr_size = hdr_size;
        if marker {
            rec.flags |= FLAG_MARKER;
        }
        if payload_size == 0 {
            rec.flags |= FLAG_PADDING;
        }
        if out_of_order {
            rec.flags |= FLAG_OUT_OF_ORDER;
        }
    }

    /// Marks `[start, end)` missing.
    pub fn clear_range(&mut self, start_inclusive: u64, end_exclusive: u64) {
        if end_exclusive <= start_inclusive {
            return;
        }
        // Clearing more than one lap would rewrite every slot; start at the
        // last lap's worth.
        let start = if end_exclusive - start_inclusive > SN_RECORD_SIZE as u64 {
            end_exclusive - SN_RECORD_SIZE as u64
        } else {
            start_inclusive
        };
        for esn in start..end_exclusive {
            self.records[(esn & SN_RECORD_MASK) as usize] = SnRecord::default();
        }
    }

    /// Whether `esn` is currently recorded as missing. Sequence numbers
    /// outside the ring window are reported as not missing.
    pub fn is_lost(&self, esn: u64, ehsn: u64) -> bool {
        self.bounded_slot(esn, ehsn)
            .is_some_and(|slot| self.records[slot].pkt_size == 0)
    }

    /// Walks `[start, end)` and classifies every slot, for attributing one
    /// receiver-report interval. `ehsn` bounds the walk to the live window;
    /// slots outside it are counted and logged, not classified.
    pub fn interval_stats(
        &self,
        start_inclusive: u64,
        end_exclusive: u64,
        ehsn: u64,
    ) -> IntervalStats {
        let mut stats = IntervalStats::default();
        if end_exclusive <= start_inclusive {
            return stats;
        }
        let mut not_found: u32 = 0;
        // Anything more than one ring behind the end can only be not-found;
        // account for it without walking it.
        let mut start = start_inclusive;
        if end_exclusive - start_inclusive > SN_RECORD_SIZE as u64 {
            let skipped = end_exclusive - start_inclusive - SN_RECORD_SIZE as u64;
            not_found = not_found.saturating_add(skipped.min(u64::from(u32::MAX)) as u32);
            start = end_exclusive - SN_RECORD_SIZE as u64;
        }
        let mut esn = start;
        while esn != end_exclusive {
            match self.bounded_slot(esn, ehsn) {
                None => not_found = not_found.saturating_add(1),
                Some(slot) => {
                    let rec = &self.records[slot];
                    if rec.pkt_size == 0 {
                        stats.packets_lost += 1;
                    } else if rec.flags & FLAG_PADDING != 0 {
                        stats.packets_padding += 1;
                        stats.bytes_padding += u64::from(rec.pkt_size);
                        stats.header_bytes_padding += u64::from(rec.hdr_size);
                    } else {
                        stats.packets += 1;
                        stats.bytes += u64::from(rec.pkt_size);
                        stats.header_bytes += u64::from(rec.hdr_size);
                        if rec.flags & FLAG_OUT_OF_ORDER != 0 {
                            stats.packets_out_of_order += 1;
                        }
                    }
                    if rec.flags & FLAG_MARKER != 0 {
                        stats.frames += 1;
                    }
                }
            }
            esn = esn.wrapping_add(1);
        }
        if not_found != 0 {
            error!(
                "could not find some packets: start={start_inclusive} end={end_exclusive} count={not_found} ext_highest_sn={ehsn}"
            );
        }
        stats
    }
}
