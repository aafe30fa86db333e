// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Remembers forwarded packets so NACKs can be answered.
//!
//! A downstream track forwards packets with rewritten sequence numbers and
//! timestamps. When the subscriber NACKs one of those rewritten sequence
//! numbers, the forwarder must find the matching *publisher* packet and the
//! rewriting that was applied to it. [`Sequencer`] is the bounded ring that
//! remembers exactly that, keyed by rewritten extended sequence number, and
//! doubles as the throttle that keeps duplicate NACKs from turning into
//! duplicate retransmissions.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use log::{error, warn};

use crate::hex::LimitedHex;
use crate::range_map::RangeMap;

/// Assumed round-trip time until a measured one arrives, in milliseconds.
pub const DEFAULT_RTT_MS: u32 = 70;

/// A NACK arriving within this many milliseconds of the previous
/// (re)transmission of the same packet is ignored; the packet is likely
/// still in flight.
const IGNORE_RETRANSMISSION_MS: u32 = 100;

/// Maximum number of NACKs honored per stored packet.
pub const MAX_NACK_ACKS: u8 = 3;

/// Metadata for one forwarded packet, as stored in the ring.
///
/// A slot with both sequence numbers zero is empty (never written, or
/// invalidated by a stale padding exclusion).
#[derive(Clone, Default)]
pub struct PacketMeta {
    /// Sequence number on the publisher's stream, used to locate the
    /// original packet for retransmission.
    pub source_seq_no: u16,

    /// Rewritten sequence number forwarded to this subscriber. Specific to
    /// the down track; never shared across tracks.
    pub target_seq_no: u16,

    /// Rewritten RTP timestamp forwarded to this subscriber.
    pub timestamp: u32,

    /// Rewritten marker bit.
    pub marker: bool,

    /// Spatial layer the packet was taken from.
    pub layer: i8,

    /// Codec-specific bytes needed to reconstruct the packet. Opaque here.
    pub codec_bytes: Bytes,

    /// Dependency descriptor bytes, if the stream carries them. Opaque here.
    pub dd_bytes: Bytes,

    /// Milliseconds (since sequencer start) at which a retransmission of
    /// this packet was last sent — seeded with the original transmission
    /// time, so a NACK racing the first copy is ignored too.
    last_nack: u32,

    /// Number of NACKs honored for this packet, capped at [`MAX_NACK_ACKS`].
    nacked: u8,
}

impl std::fmt::Debug for PacketMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketMeta")
            .field("source_seq_no", &self.source_seq_no)
            .field("target_seq_no", &self.target_seq_no)
            .field("timestamp", &self.timestamp)
            .field("marker", &self.marker)
            .field("layer", &self.layer)
            .field("last_nack", &self.last_nack)
            .field("nacked", &self.nacked)
            .field("codec_bytes", &LimitedHex::new(&self.codec_bytes, 16))
            .field("dd_bytes", &LimitedHex::new(&self.dd_bytes, 16))
            .finish()
    }
}

/// A [`PacketMeta`] restored to full 64-bit sequence number and timestamp,
/// as handed to the retransmission pipeline.
#[derive(Clone, Debug)]
pub struct ExtPacketMeta {
    pub packet: PacketMeta,
    pub ext_sequence_number: u64,
    pub ext_timestamp: u64,
}

struct State {
    start: Instant,
    initialized: bool,
    ext_highest_sn: u64,
    ext_highest_ts: u64,

    /// Cached `sn_range_map` offset for `ext_highest_sn + 1`, so the
    /// in-order path never touches the map.
    sn_offset: u64,

    slots: Vec<PacketMeta>,
    sn_range_map: Option<RangeMap>,
    rtt: u32,
}

impl State {
    fn ref_time(&self, at: Instant) -> u32 {
        at.saturating_duration_since(self.start).as_millis() as u32
    }

    fn refresh_sn_offset(&mut self) {
        let Some(map) = self.sn_range_map.as_ref() else {
            return;
        };
        match map.get_value(self.ext_highest_sn.wrapping_add(1)) {
            Ok(v) => self.sn_offset = v,
            Err(e) => error!(
                "could not update sequence number offset, ext_highest_sn={}: {e}",
                self.ext_highest_sn
            ),
        }
    }
}

/// The packet sequence remembered for one down track.
///
/// A bounded ring of [`PacketMeta`] indexed by rewritten extended sequence
/// number modulo the ring size. All methods take `&self` and serialize on an
/// internal mutex; clones of an `Arc<Sequencer>` may be driven from the
/// forwarding path and the RTCP path concurrently.
///
/// A sequencer created with `maybe_sparse` tracks padding-only runs that
/// were skipped rather than forwarded (see [`Sequencer::push_padding`]), so
/// that skipped sequence numbers don't waste ring capacity.
pub struct Sequencer {
    state: Mutex<State>,
}

impl Sequencer {
    pub fn new(size: NonZeroUsize, maybe_sparse: bool) -> Self {
        let size = size.get();
        Self {
            state: Mutex::new(State {
                start: Instant::now(),
                initialized: false,
                ext_highest_sn: 0,
                ext_highest_ts: 0,
                sn_offset: 0,
                slots: vec![PacketMeta::default(); size],
                // Assume run lengths of at least 2 between padding bursts.
                sn_range_map: maybe_sparse.then(|| RangeMap::new((size + 1) / 2)),
                rtt: DEFAULT_RTT_MS,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the measured round-trip time in milliseconds; `0` restores the
    /// default. Shortens the duplicate-NACK suppression window on fast
    /// links.
    pub fn set_rtt(&self, rtt_ms: u32) {
        let mut s = self.lock();
        s.rtt = if rtt_ms == 0 { DEFAULT_RTT_MS } else { rtt_ms };
    }

    /// Records a forwarded packet.
    ///
    /// `ext_incoming_sn` is the publisher's extended sequence number,
    /// `ext_modified_sn`/`ext_modified_ts` the rewritten values actually
    /// sent, and `packet_time` when the packet went out. The byte slices are
    /// copied into owned buffers; the caller keeps no aliases.
    ///
    /// Packets older than the ring (or whose offset can't be resolved) are
    /// dropped with a log line; this never fails outward.
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &self,
        packet_time: Instant,
        ext_incoming_sn: u64,
        ext_modified_sn: u64,
        ext_modified_ts: u64,
        marker: bool,
        layer: i8,
        codec_bytes: &[u8],
        dd_bytes: &[u8],
    ) {
        let mut guard = self.lock();
        let s = &mut *guard;

        if !s.initialized {
            s.initialized = true;
            s.ext_highest_sn = ext_modified_sn.wrapping_sub(1);
            s.ext_highest_ts = ext_modified_ts;
            s.refresh_sn_offset();
        }

        let mut sn_offset = s.sn_offset;
        let diff = ext_modified_sn.wrapping_sub(s.ext_highest_sn) as i64;
        if diff >= 0 {
            s.ext_highest_sn = ext_modified_sn;
        } else {
            if diff < -(s.slots.len() as i64) {
                warn!(
                    "old packet, cannot be sequenced: ext_highest_sn={} ext_incoming_sn={ext_incoming_sn} ext_modified_sn={ext_modified_sn}",
                    s.ext_highest_sn
                );
                return;
            }
            if let Some(map) = s.sn_range_map.as_ref() {
                match map.get_value(ext_modified_sn) {
                    Ok(v) => sn_offset = v,
                    Err(e) => {
                        error!(
                            "could not get sequence number offset: ext_highest_sn={} ext_incoming_sn={ext_incoming_sn} ext_modified_sn={ext_modified_sn}: {e}",
                            s.ext_highest_sn
                        );
                        return;
                    }
                }
            }
        }

        if ext_modified_ts.wrapping_sub(s.ext_highest_ts) as i64 >= 0 {
            s.ext_highest_ts = ext_modified_ts;
        }

        let size = s.slots.len() as u64;
        let slot = (ext_modified_sn.wrapping_sub(sn_offset) % size) as usize;
        // Seeding last_nack with the send time delays retransmissions until
        // the original copy has had a chance to arrive.
        let last_nack = s.ref_time(packet_time);
        s.slots[slot] = PacketMeta {
            source_seq_no: ext_incoming_sn as u16,
            target_seq_no: ext_modified_sn as u16,
            timestamp: ext_modified_ts as u32,
            marker,
            layer,
            codec_bytes: Bytes::copy_from_slice(codec_bytes),
            dd_bytes: Bytes::copy_from_slice(dd_bytes),
            last_nack,
            nacked: 0,
        };
    }

    /// Declares `[ext_start_sn, ext_end_sn]` (inclusive) as padding that was
    /// skipped rather than forwarded.
    ///
    /// Normally this registers an exclusion so that later sequence numbers
    /// keep mapping to contiguous slots. A range that is entirely behind the
    /// highest sequenced packet can no longer be excluded (the offsets of
    /// everything after it are already fixed); its slots are invalidated
    /// instead, wasting a few slots for this cycle of the ring.
    ///
    /// No-op on sequencers constructed without `maybe_sparse`.
    pub fn push_padding(&self, ext_start_sn: u64, ext_end_sn: u64) {
        let mut guard = self.lock();
        let s = &mut *guard;
        let Some(map) = s.sn_range_map.as_mut() else {
            return;
        };

        if ext_start_sn <= s.ext_highest_sn {
            warn!(
                "cannot exclude old range: ext_highest_sn={} start_sn={ext_start_sn} end_sn={ext_end_sn}",
                s.ext_highest_sn
            );
            let size = s.slots.len() as u64;
            for sn in ext_start_sn..=ext_end_sn {
                let diff = sn.wrapping_sub(s.ext_highest_sn) as i64;
                if diff >= 0 || diff < -(size as i64) {
                    // Too old, or ahead of the head (the latter should not
                    // happen for a range starting behind it).
                    continue;
                }
                let sn_offset = match map.get_value(sn) {
                    Ok(v) => v,
                    Err(e) => {
                        error!("could not get sequence number offset for {sn}: {e}");
                        continue;
                    }
                };
                let slot = (sn.wrapping_sub(sn_offset) % size) as usize;
                s.slots[slot] = PacketMeta::default();
            }
            return;
        }

        if let Err(e) = map.exclude_range(ext_start_sn, ext_end_sn.wrapping_add(1)) {
            error!("could not exclude range: start_sn={ext_start_sn} end_sn={ext_end_sn}: {e}");
            return;
        }

        s.ext_highest_sn = ext_end_sn;
        s.refresh_sn_offset();
    }

    /// Answers a NACK batch: for each rewritten 16-bit sequence number,
    /// returns the stored metadata restored to 64 bits, if it should be
    /// retransmitted.
    ///
    /// Entries are silently skipped when the packet is older than the ring,
    /// fell in a padding exclusion, was displaced by a newer packet mapping
    /// to the same slot, has already been retransmitted [`MAX_NACK_ACKS`]
    /// times, or was (re)transmitted within `min(100ms, 2·rtt)` of `now`.
    pub fn ext_packet_metas(&self, seq_nos: &[u16], now: Instant) -> Vec<ExtPacketMeta> {
        let mut guard = self.lock();
        let s = &mut *guard;

        let mut out = Vec::with_capacity(seq_nos.len());
        let ref_time = s.ref_time(now);
        let ext_highest_sn = s.ext_highest_sn;
        let ext_highest_ts = s.ext_highest_ts;
        let highest_sn = ext_highest_sn as u16;
        let highest_ts = ext_highest_ts as u32;
        let suppress_window = IGNORE_RETRANSMISSION_MS.min(2 * s.rtt);
        let size = s.slots.len() as u64;

        for &sn in seq_nos {
            if highest_sn.wrapping_sub(sn) > 0x8000 {
                // Ahead of the head; should not happen, just be safe.
                continue;
            }

            // Borrow the head's epoch, stepping back one if the raw number
            // lives in the previous 16-bit cycle.
            let mut ext_sn = u64::from(sn).wrapping_add(ext_highest_sn & !0xFFFF);
            if sn > highest_sn {
                ext_sn = ext_sn.wrapping_sub(1 << 16);
            }

            if ext_highest_sn.wrapping_sub(ext_sn) >= size {
                // Too old.
                continue;
            }

            let mut sn_offset = 0;
            if let Some(map) = s.sn_range_map.as_ref() {
                match map.get_value(ext_sn) {
                    Ok(v) => sn_offset = v,
                    // A padding-only number that was excluded and never sent.
                    Err(_) => continue,
                }
            }

            let slot = (ext_sn.wrapping_sub(sn_offset) % size) as usize;
            let meta = &mut s.slots[slot];
            if meta.target_seq_no != sn {
                // Displaced by a newer packet.
                continue;
            }

            if meta.nacked < MAX_NACK_ACKS
                && ref_time.wrapping_sub(meta.last_nack) > suppress_window
            {
                meta.nacked += 1;
                meta.last_nack = ref_time;

                // NOTE: the epoch borrow here is asymmetric: a stored
                // timestamp above the head's low 32 bits steps back exactly
                // one cycle, so a slot more than one timestamp wrap old
                // would be misattributed. Slots never live that long.
                let mut ext_ts = u64::from(meta.timestamp).wrapping_add(ext_highest_ts & !0xFFFF_FFFF);
                if meta.timestamp > highest_ts {
                    ext_ts = ext_ts.wrapping_sub(1 << 32);
                }

                out.push(ExtPacketMeta {
                    packet: meta.clone(),
                    ext_sequence_number: ext_sn,
                    ext_timestamp: ext_ts,
                });
            }
        }
        out
    }
}
