// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sender-side accounting for one outbound RTP stream.
//!
//! [`SenderStats`] ingests every forwarded packet and every inbound RTCP
//! receiver report for a down track, and answers three kinds of questions:
//!
//! *   running totals: bytes, packets, padding, duplicates, reordering,
//!     loss (both as observed in the feed and as reported by the receiver),
//!     interarrival jitter, round-trip time;
//! *   deltas between named snapshots, for periodic quality reporting;
//! *   the outbound RTCP sender report, with an NTP↔RTP mapping that never
//!     runs backwards even across publisher pacing and pause/resume.
//!
//! Sequence numbers and timestamps arrive here already extended to 64 bits;
//! this module is wrap-aware only where values cross the wire (receiver
//! reports carry 32-bit counters, sender reports 32-bit timestamps).

mod history;

pub use history::IntervalStats;

use std::num::NonZeroU32;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::rtcp::{self, ReceptionReport, SenderReport, SenderReportRecord};
use crate::{Error, MonotonicAnchor};
use history::SnHistory;

/// Snapshot ids start here; `0` is never a valid id.
const FIRST_SNAPSHOT_ID: u32 = 1;

/// Ceiling on the number of packets a single snapshot delta may span.
/// A wider interval means the snapshot ring has long been lapped and the
/// delta would be fiction.
const MAX_DELTA_PACKETS: u32 = 1 << 15;

/// Burst-loss histogram: bins for runs of 1..=N missing packets, with longer
/// runs lumped into the last bin.
const GAP_HISTOGRAM_BINS: usize = 101;

/// How long after stream start [`SenderStats::maybe_adjust_first_packet_time`]
/// will still move the origin, and the largest backwards step it will accept.
const FIRST_PACKET_TIME_ADJUST_WINDOW: Duration = Duration::from_secs(120);
const FIRST_PACKET_TIME_ADJUST_THRESHOLD: Duration = Duration::from_secs(15);

/// Construction parameters for [`SenderStats`].
#[derive(Copy, Clone, Debug)]
pub struct StatsConfig {
    /// The stream's nominal RTP clock rate in Hz. Non-zero so jitter and
    /// timestamp extrapolation can divide by it.
    pub clock_rate: NonZeroU32,
}

/// Delta between two successive reads of one snapshot: everything that
/// happened to the stream in that interval.
#[derive(Clone, Debug, Serialize)]
pub struct RtpDeltaInfo {
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub duration: Duration,

    /// Packets the receiver should have seen in the interval, padding
    /// excluded.
    pub packets: u32,
    pub bytes: u64,
    pub header_bytes: u64,

    pub packets_duplicate: u32,
    pub bytes_duplicate: u64,
    pub header_bytes_duplicate: u64,

    pub packets_padding: u32,
    pub bytes_padding: u64,
    pub header_bytes_padding: u64,

    /// Loss as reported by the receiver, clamped to `[0, packets]`.
    pub packets_lost: u32,

    /// Packets this side never got from the publisher (holes in the feed).
    pub packets_missing: u32,

    pub packets_out_of_order: u32,
    pub frames: u32,

    pub rtt_max: u32,

    /// Receiver-reported jitter net of the jitter already present in the
    /// feed, in microseconds.
    pub jitter_max_us: f64,

    pub nacks: u32,
    pub plis: u32,
    pub firs: u32,
}

/// The structured stats dump: totals and derived rates for the stream so
/// far. `Display` renders the textual form.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSummary {
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: chrono::DateTime<chrono::Utc>,
    pub duration: Duration,

    pub packets: u64,
    pub packet_rate: f64,
    pub bytes: u64,
    pub header_bytes: u64,
    pub bitrate_bps: f64,

    pub packets_lost: u64,
    pub loss_rate: f64,
    pub packets_lost_from_rr: u64,

    pub packets_duplicate: u64,
    pub bytes_duplicate: u64,
    pub header_bytes_duplicate: u64,

    pub packets_padding: u64,
    pub bytes_padding: u64,
    pub header_bytes_padding: u64,

    pub packets_out_of_order: u64,

    pub frames: u32,
    pub frame_rate: f64,

    pub jitter_us: f64,
    pub max_jitter_us: f64,
    pub jitter_from_rr_us: f64,
    pub max_jitter_from_rr_us: f64,

    pub rtt_ms: u32,
    pub max_rtt_ms: u32,

    pub nacks: u32,
    pub plis: u32,
    pub firs: u32,

    pub ext_start_sn: u64,
    pub ext_highest_sn: u64,
    pub ext_start_ts: u64,
    pub ext_highest_ts: u64,

    /// Burst-loss runs: `(run_length, occurrences)`, non-empty bins only.
    pub gap_histogram: Vec<(u32, u32)>,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "t: {}..{} ({:.1}s), sn: {}..{}, ts: {}..{}, \
             packets: {} ({:.1}/s), bytes: {} ({:.0} bps), frames: {} ({:.1}/s), \
             lost: feed {} ({:.3}) / rr {}, ooo: {}, dup: {}, padding: {}, \
             jitter: {:.0}us (max {:.0}us, rr max {:.0}us), rtt: {}ms (max {}ms), \
             nack: {}, pli: {}, fir: {}",
            self.start_time.format("%FT%T%.3f"),
            self.end_time.format("%FT%T%.3f"),
            self.duration.as_secs_f64(),
            self.ext_start_sn,
            self.ext_highest_sn,
            self.ext_start_ts,
            self.ext_highest_ts,
            self.packets,
            self.packet_rate,
            self.bytes,
            self.bitrate_bps,
            self.frames,
            self.frame_rate,
            self.packets_lost,
            self.loss_rate,
            self.packets_lost_from_rr,
            self.packets_out_of_order,
            self.packets_duplicate,
            self.packets_padding,
            self.jitter_us,
            self.max_jitter_us,
            self.max_jitter_from_rr_us,
            self.rtt_ms,
            self.max_rtt_ms,
            self.nacks,
            self.plis,
            self.firs,
        )
    }
}

/// A plain snapshot: running totals copied at capture time. Deltas against
/// the previous capture give feed-side interval stats.
#[derive(Copy, Clone, Debug)]
struct Snapshot {
    start_time: Instant,
    ext_start_sn: u64,
    bytes: u64,
    header_bytes: u64,
    packets_padding: u64,
    bytes_padding: u64,
    header_bytes_padding: u64,
    packets_duplicate: u64,
    bytes_duplicate: u64,
    header_bytes_duplicate: u64,
    packets_lost: u64,
    packets_out_of_order: u64,
    frames: u32,
    nacks: u32,
    plis: u32,
    firs: u32,
    max_rtt: u32,
    max_jitter: f64,
}

/// A sender snapshot: a cursor advanced by receiver reports. Interval totals
/// are reconstructed from the sequence-number ring as reports arrive, so a
/// delta lines up exactly with what the receiver has acknowledged seeing.
#[derive(Copy, Clone, Debug)]
struct SenderSnapshot {
    start_time: Instant,
    ext_start_sn: u64,
    bytes: u64,
    header_bytes: u64,
    packets_padding: u64,
    bytes_padding: u64,
    header_bytes_padding: u64,
    packets_duplicate: u64,
    bytes_duplicate: u64,
    header_bytes_duplicate: u64,
    packets_out_of_order: u64,
    packets_lost_feed: u64,
    packets_lost: u64,
    frames: u32,
    nacks: u32,
    plis: u32,
    firs: u32,
    max_rtt: u32,
    max_jitter_feed: f64,
    max_jitter: f64,

    /// The last extended sequence number covered by a receiver report that
    /// has been folded into `interval`.
    ext_last_rr_sn: u64,
    interval: IntervalStats,
}

fn init_snapshot(start_time: Instant, ext_start_sn: u64) -> Snapshot {
    Snapshot {
        start_time,
        ext_start_sn,
        bytes: 0,
        header_bytes: 0,
        packets_padding: 0,
        bytes_padding: 0,
        header_bytes_padding: 0,
        packets_duplicate: 0,
        bytes_duplicate: 0,
        header_bytes_duplicate: 0,
        packets_lost: 0,
        packets_out_of_order: 0,
        frames: 0,
        nacks: 0,
        plis: 0,
        firs: 0,
        max_rtt: 0,
        max_jitter: 0.0,
    }
}

fn init_sender_snapshot(start_time: Instant, ext_start_sn: u64) -> SenderSnapshot {
    SenderSnapshot {
        start_time,
        ext_start_sn,
        bytes: 0,
        header_bytes: 0,
        packets_padding: 0,
        bytes_padding: 0,
        header_bytes_padding: 0,
        packets_duplicate: 0,
        bytes_duplicate: 0,
        header_bytes_duplicate: 0,
        packets_out_of_order: 0,
        packets_lost_feed: 0,
        packets_lost: 0,
        frames: 0,
        nacks: 0,
        plis: 0,
        firs: 0,
        max_rtt: 0,
        max_jitter_feed: 0.0,
        max_jitter: 0.0,
        ext_last_rr_sn: ext_start_sn.wrapping_sub(1),
        interval: IntervalStats::default(),
    }
}

#[derive(Clone)]
struct State {
    clock_rate: NonZeroU32,
    anchor: MonotonicAnchor,

    initialized: bool,
    start_time: Instant,
    end_time: Option<Instant>,

    /// Source time of the first and highest-timestamped media packets.
    first_time: Instant,
    highest_time: Instant,

    ext_start_sn: u64,
    ext_highest_sn: u64,
    ext_highest_sn_from_rr: u64,

    last_rr_time: Option<Instant>,
    last_rr: ReceptionReport,

    ext_start_ts: u64,
    ext_highest_ts: u64,

    packets_lost_from_rr: u64,
    jitter_from_rr: f64,
    max_jitter_from_rr: f64,

    bytes: u64,
    header_bytes: u64,
    bytes_duplicate: u64,
    header_bytes_duplicate: u64,
    bytes_padding: u64,
    header_bytes_padding: u64,
    packets_duplicate: u64,
    packets_padding: u64,
    packets_lost: u64,
    packets_out_of_order: u64,
    frames: u32,

    jitter: f64,
    max_jitter: f64,
    last_transit: Option<i64>,
    last_jitter_ext_ts: u64,

    nacks: u32,
    plis: u32,
    firs: u32,

    rtt: u32,
    max_rtt: u32,

    gap_histogram: [u32; GAP_HISTOGRAM_BINS],
    sn_history: SnHistory,

    sr_first: Option<SenderReportRecord>,
    sr_newest: Option<SenderReportRecord>,

    next_snapshot_id: u32,
    snapshots: Vec<Option<Snapshot>>,
    next_sender_snapshot_id: u32,
    sender_snapshots: Vec<Option<SenderSnapshot>>,
}

impl State {
    /// Packets sent between the stream origin and the highest sequence
    /// number, net of feed loss and padding.
    fn total_packets_primary(&self) -> u64 {
        let expected = self
            .ext_highest_sn
            .wrapping_sub(self.ext_start_sn)
            .wrapping_add(1);
        let seen = match expected.checked_sub(self.packets_lost) {
            Some(seen) => seen,
            None => return 0,
        };
        seen.saturating_sub(self.packets_padding)
    }

    /// RFC 3550 section A.8 interarrival jitter, fed once per distinct
    /// timestamp (all packets of a frame share one).
    fn update_jitter(&mut self, ext_ts: u64, packet_time: Instant) -> f64 {
        if ext_ts != self.last_jitter_ext_ts {
            let elapsed = packet_time.saturating_duration_since(self.first_time);
            let arrival_ticks =
                (elapsed.as_nanos() * u128::from(self.clock_rate.get()) / 1_000_000_000) as i64;
            let transit = arrival_ticks.wrapping_sub(ext_ts as i64);
            if let Some(last_transit) = self.last_transit {
                let d = transit.wrapping_sub(last_transit).unsigned_abs() as f64;
                self.jitter += (d - self.jitter) / 16.0;
                if self.jitter > self.max_jitter {
                    self.max_jitter = self.jitter;
                }
                let jitter = self.jitter;
                for snap in self.snapshots.iter_mut().flatten() {
                    if jitter > snap.max_jitter {
                        snap.max_jitter = jitter;
                    }
                }
            }
            self.last_transit = Some(transit);
            self.last_jitter_ext_ts = ext_ts;
        }
        self.jitter
    }

    fn update_gap_histogram(&mut self, gap: u64) {
        if gap < 2 {
            return;
        }
        let missing = (gap - 1) as usize;
        if missing > self.gap_histogram.len() {
            self.gap_histogram[GAP_HISTOGRAM_BINS - 1] += 1;
        } else {
            self.gap_histogram[missing - 1] += 1;
        }
    }

    fn capture_snapshot(&self, at: Instant) -> Snapshot {
        Snapshot {
            start_time: at,
            ext_start_sn: self.ext_highest_sn.wrapping_add(1),
            bytes: self.bytes,
            header_bytes: self.header_bytes,
            packets_padding: self.packets_padding,
            bytes_padding: self.bytes_padding,
            header_bytes_padding: self.header_bytes_padding,
            packets_duplicate: self.packets_duplicate,
            bytes_duplicate: self.bytes_duplicate,
            header_bytes_duplicate: self.header_bytes_duplicate,
            packets_lost: self.packets_lost,
            packets_out_of_order: self.packets_out_of_order,
            frames: self.frames,
            nacks: self.nacks,
            plis: self.plis,
            firs: self.firs,
            max_rtt: self.rtt,
            max_jitter: self.jitter,
        }
    }

    /// Rolls a sender snapshot forward: interval totals reconstructed from
    /// receiver reports become the new baseline, global counters are copied,
    /// and the interval maxima reset to current values.
    fn capture_sender_snapshot(&self, at: Instant, prev: &SenderSnapshot) -> SenderSnapshot {
        SenderSnapshot {
            start_time: at,
            ext_start_sn: prev.ext_last_rr_sn.wrapping_add(1),
            bytes: prev.bytes.wrapping_add(prev.interval.bytes),
            header_bytes: prev.header_bytes.wrapping_add(prev.interval.header_bytes),
            packets_padding: prev
                .packets_padding
                .wrapping_add(prev.interval.packets_padding),
            bytes_padding: prev.bytes_padding.wrapping_add(prev.interval.bytes_padding),
            header_bytes_padding: prev
                .header_bytes_padding
                .wrapping_add(prev.interval.header_bytes_padding),
            packets_duplicate: self.packets_duplicate,
            bytes_duplicate: self.bytes_duplicate,
            header_bytes_duplicate: self.header_bytes_duplicate,
            packets_out_of_order: prev
                .packets_out_of_order
                .wrapping_add(prev.interval.packets_out_of_order),
            packets_lost_feed: self.packets_lost,
            packets_lost: 0,
            frames: prev.frames.wrapping_add(prev.interval.frames),
            nacks: self.nacks,
            plis: self.plis,
            firs: self.firs,
            max_rtt: self.rtt,
            max_jitter_feed: self.jitter,
            max_jitter: self.jitter_from_rr,
            ext_last_rr_sn: prev.ext_last_rr_sn,
            interval: IntervalStats::default(),
        }
    }
}

/// RTP statistics for the sending side of one stream.
///
/// All methods take `&self`; internally a single `RwLock` serializes
/// mutation, and the handful of demonstrably read-only accessors share the
/// read side. Nothing blocks beyond the lock and nothing suspends; callers
/// drive this from their forwarding and RTCP paths, passing `now` explicitly
/// wherever wall progress matters so the object itself never reads a clock
/// after construction.
///
/// The stream starts accounting at the first *media* packet: a padding-only
/// packet never initializes the stream (receivers commonly prime a track
/// with padding before media flows).
pub struct SenderStats {
    state: RwLock<State>,
}

impl SenderStats {
    pub fn new(config: StatsConfig) -> Self {
        let anchor = MonotonicAnchor::now();
        Self {
            state: RwLock::new(State {
                clock_rate: config.clock_rate,
                anchor,
                initialized: false,
                start_time: anchor.reference(),
                end_time: None,
                first_time: anchor.reference(),
                highest_time: anchor.reference(),
                ext_start_sn: 0,
                ext_highest_sn: 0,
                ext_highest_sn_from_rr: 0,
                last_rr_time: None,
                last_rr: ReceptionReport::default(),
                ext_start_ts: 0,
                ext_highest_ts: 0,
                packets_lost_from_rr: 0,
                jitter_from_rr: 0.0,
                max_jitter_from_rr: 0.0,
                bytes: 0,
                header_bytes: 0,
                bytes_duplicate: 0,
                header_bytes_duplicate: 0,
                bytes_padding: 0,
                header_bytes_padding: 0,
                packets_duplicate: 0,
                packets_padding: 0,
                packets_lost: 0,
                packets_out_of_order: 0,
                frames: 0,
                jitter: 0.0,
                max_jitter: 0.0,
                last_transit: None,
                last_jitter_ext_ts: 0,
                nacks: 0,
                plis: 0,
                firs: 0,
                rtt: 0,
                max_rtt: 0,
                gap_histogram: [0; GAP_HISTOGRAM_BINS],
                sn_history: SnHistory::new(),
                sr_first: None,
                sr_newest: None,
                next_snapshot_id: FIRST_SNAPSHOT_ID,
                snapshots: Vec::new(),
                next_sender_snapshot_id: FIRST_SNAPSHOT_ID,
                sender_snapshots: Vec::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deep-copies `from`'s state into `self`, for track migration. No-op
    /// unless `from` is initialized and `self` is not.
    pub fn seed_from(&self, from: &SenderStats) {
        let from_state = from.read();
        let mut s = self.write();
        if !from_state.initialized || s.initialized {
            return;
        }
        let clock_rate = s.clock_rate;
        *s = from_state.clone();
        s.clock_rate = clock_rate;
    }

    /// Marks the stream ended; all further updates are ignored.
    pub fn stop(&self, now: Instant) {
        let mut s = self.write();
        if s.end_time.is_none() {
            s.end_time = Some(now);
        }
    }

    /// Records one forwarded packet.
    ///
    /// `packet_time` is when the packet was received from the publisher;
    /// `payload_size == 0` marks a padding-only packet. The first media
    /// packet initializes the stream origin. No-op once [`stop`] has been
    /// called.
    ///
    /// [`stop`]: SenderStats::stop
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        packet_time: Instant,
        ext_sequence_number: u64,
        ext_timestamp: u64,
        marker: bool,
        hdr_size: usize,
        payload_size: usize,
        padding_size: usize,
    ) {
        let mut guard = self.write();
        let s = &mut *guard;
        if s.end_time.is_some() {
            return;
        }

        if !s.initialized {
            if payload_size == 0 {
                // Do not start on a padding-only packet.
                return;
            }
            s.initialized = true;
            s.start_time = packet_time;
            s.first_time = packet_time;
            s.highest_time = packet_time;
            s.ext_start_sn = ext_sequence_number;
            s.ext_highest_sn = ext_sequence_number.wrapping_sub(1);
            s.ext_start_ts = ext_timestamp;
            s.ext_highest_ts = ext_timestamp;

            // Snapshots allocated before the stream began anchor to the
            // origin now that there is one.
            let (start_time, ext_start_sn) = (s.start_time, s.ext_start_sn);
            for slot in s.snapshots.iter_mut() {
                *slot = Some(init_snapshot(start_time, ext_start_sn));
            }
            for slot in s.sender_snapshots.iter_mut() {
                *slot = Some(init_sender_snapshot(start_time, ext_start_sn));
            }

            debug!(
                "rtp sender stream start: start_sn={} start_ts={}",
                s.ext_start_sn, s.ext_start_ts
            );
        }

        let pkt_size = (hdr_size + payload_size + padding_size) as u64;
        let mut is_duplicate = false;
        let gap_sn = ext_sequence_number.wrapping_sub(s.ext_highest_sn) as i64;
        if gap_sn <= 0 {
            // Duplicate or out-of-order.
            if payload_size == 0 && ext_sequence_number < s.ext_start_sn {
                // Padding from before the origin; the stream does not start
                // any earlier because of it.
                return;
            }

            if ext_sequence_number < s.ext_start_sn {
                // A media packet from before the recorded origin: extend the
                // origin backwards and re-anchor snapshots still pointing at
                // the old one.
                s.packets_lost += s.ext_start_sn - ext_sequence_number;
                let old_start = s.ext_start_sn;
                for snap in s.snapshots.iter_mut().flatten() {
                    if snap.ext_start_sn == old_start {
                        snap.ext_start_sn = ext_sequence_number;
                    }
                }
                for snap in s.sender_snapshots.iter_mut().flatten() {
                    if snap.ext_start_sn == old_start {
                        snap.ext_start_sn = ext_sequence_number;
                        if snap.ext_last_rr_sn == old_start.wrapping_sub(1) {
                            snap.ext_last_rr_sn = ext_sequence_number.wrapping_sub(1);
                        }
                    }
                }
                s.ext_start_sn = ext_sequence_number;
            }

            if ext_timestamp < s.ext_start_ts {
                s.ext_start_ts = ext_timestamp;
            }

            if gap_sn != 0 {
                s.packets_out_of_order += 1;
            }

            if !s.sn_history.is_lost(ext_sequence_number, s.ext_highest_sn) {
                s.bytes_duplicate += pkt_size;
                s.header_bytes_duplicate += hdr_size as u64;
                s.packets_duplicate += 1;
                is_duplicate = true;
            } else {
                // A late arrival filling a hole.
                s.packets_lost = s.packets_lost.saturating_sub(1);
                s.sn_history.set(
                    ext_sequence_number,
                    s.ext_highest_sn,
                    pkt_size as u16,
                    hdr_size as u8,
                    payload_size as u16,
                    marker,
                    true,
                );
            }
        } else {
            // In order, possibly revealing a gap.
            s.update_gap_histogram(gap_sn as u64);
            s.sn_history
                .clear_range(s.ext_highest_sn.wrapping_add(1), ext_sequence_number);
            s.packets_lost += (gap_sn - 1) as u64;
            s.sn_history.set(
                ext_sequence_number,
                s.ext_highest_sn,
                pkt_size as u16,
                hdr_size as u8,
                payload_size as u16,
                marker,
                false,
            );
            if ext_timestamp != s.ext_highest_ts {
                // Advance only on the first packet of a timestamp; the rest
                // of the frame shares it.
                s.highest_time = packet_time;
            }
            s.ext_highest_sn = ext_sequence_number;
            s.ext_highest_ts = ext_timestamp;
        }

        if !is_duplicate {
            if payload_size == 0 {
                s.packets_padding += 1;
                s.bytes_padding += pkt_size;
                s.header_bytes_padding += hdr_size as u64;
            } else {
                s.bytes += pkt_size;
                s.header_bytes += hdr_size as u64;
                if marker {
                    s.frames += 1;
                }
                let jitter = s.update_jitter(ext_timestamp, packet_time);
                for snap in s.sender_snapshots.iter_mut().flatten() {
                    if jitter > snap.max_jitter_feed {
                        snap.max_jitter_feed = jitter;
                    }
                }
            }
        }
    }

    /// Ingests one reception report block from the receiver's RR.
    ///
    /// Returns `(rtt_ms, rtt_changed)` as computed from the block's LSR/DLSR
    /// against the newest sender report, even when the block itself is
    /// discarded as out of order. Reports that would place the receiver
    /// before the stream origin are dropped quietly: receivers priming a
    /// track with padding report sequence numbers from before the first
    /// media packet.
    pub fn update_from_receiver_report(&self, rr: ReceptionReport, now: Instant) -> (u32, bool) {
        let mut guard = self.write();
        let s = &mut *guard;
        if !s.initialized || s.end_time.is_some() {
            return (0, false);
        }

        let mut ext_highest_sn_from_rr = (s.ext_highest_sn_from_rr & 0xFFFF_FFFF_0000_0000)
            .wrapping_add(u64::from(rr.last_sequence_number));
        if s.last_rr_time.is_some()
            && rr
                .last_sequence_number
                .wrapping_sub(s.last_rr.last_sequence_number)
                < (1 << 31)
            && rr.last_sequence_number < s.last_rr.last_sequence_number
        {
            ext_highest_sn_from_rr = ext_highest_sn_from_rr.wrapping_add(1 << 32);
        }
        if ext_highest_sn_from_rr.wrapping_add(s.ext_start_sn & 0xFFFF_FFFF_FFFF_0000)
            < s.ext_start_sn
        {
            return (0, false);
        }

        let mut rtt = 0;
        let mut rtt_changed = false;
        if let Some(sr) = s.sr_newest {
            match rtcp::rtt_from_reception_report(&rr, sr.ntp, s.anchor.ntp_at(now)) {
                Ok(r) => {
                    rtt = r;
                    rtt_changed = r != s.rtt;
                }
                // Routine while reports cross on the wire.
                Err(Error::NoSenderReport | Error::StaleSenderReport) => {}
                Err(e) => warn!("error getting rtt: {e}"),
            }
        }

        if s.last_rr_time.is_some() && s.ext_highest_sn_from_rr > ext_highest_sn_from_rr {
            debug!(
                "receiver report potentially out of order: existing={} received={}",
                s.ext_highest_sn_from_rr, ext_highest_sn_from_rr
            );
            return (rtt, rtt_changed);
        }
        s.ext_highest_sn_from_rr = ext_highest_sn_from_rr;

        let mut packets_lost_from_rr =
            (s.packets_lost_from_rr & 0xFFFF_FFFF_0000_0000).wrapping_add(u64::from(rr.total_lost));
        if rr.total_lost.wrapping_sub(s.last_rr.total_lost) < (1 << 31)
            && rr.total_lost < s.last_rr.total_lost
        {
            packets_lost_from_rr = packets_lost_from_rr.wrapping_add(1 << 32);
        }
        s.packets_lost_from_rr = packets_lost_from_rr;

        if rtt_changed {
            s.rtt = rtt;
            if rtt > s.max_rtt {
                s.max_rtt = rtt;
            }
        }

        s.jitter_from_rr = f64::from(rr.jitter);
        if s.jitter_from_rr > s.max_jitter_from_rr {
            s.max_jitter_from_rr = s.jitter_from_rr;
        }

        for snap in s.snapshots.iter_mut().flatten() {
            if rtt_changed && rtt > snap.max_rtt {
                snap.max_rtt = rtt;
            }
        }

        let ext_last_rr_sn = s
            .ext_highest_sn_from_rr
            .wrapping_add(s.ext_start_sn & 0xFFFF_FFFF_FFFF_0000);
        let jitter_from_rr = s.jitter_from_rr;
        let ext_highest_sn = s.ext_highest_sn;
        for snap in s.sender_snapshots.iter_mut().flatten() {
            if rtt_changed && rtt > snap.max_rtt {
                snap.max_rtt = rtt;
            }
            if jitter_from_rr > snap.max_jitter {
                snap.max_jitter = jitter_from_rr;
            }
            // Attribute everything newly acknowledged to this snapshot's
            // running interval.
            let interval = s.sn_history.interval_stats(
                snap.ext_last_rr_sn.wrapping_add(1),
                ext_last_rr_sn.wrapping_add(1),
                ext_highest_sn,
            );
            snap.interval.aggregate(&interval);
            snap.ext_last_rr_sn = ext_last_rr_sn;
        }

        s.last_rr_time = Some(now);
        s.last_rr = rr;
        (rtt, rtt_changed)
    }

    /// When the receiver last reported, if it has.
    pub fn last_receiver_report_time(&self) -> Option<Instant> {
        self.read().last_rr_time
    }

    /// See [`State::total_packets_primary`]: packets sent excluding padding
    /// and holes.
    pub fn total_packets_primary(&self) -> u64 {
        self.read().total_packets_primary()
    }

    /// Within a short window after stream start, accepts evidence (a
    /// timestamp older than the origin timestamp, mapped through the clock
    /// rate) that the stream actually began earlier, and moves the origin
    /// back. Implausibly large steps are dropped with a warning instead.
    pub fn maybe_adjust_first_packet_time(&self, ext_ts: u64, now: Instant) {
        let mut guard = self.write();
        let s = &mut *guard;
        if !s.initialized {
            return;
        }
        if now.saturating_duration_since(s.start_time) > FIRST_PACKET_TIME_ADJUST_WINDOW {
            return;
        }
        let elapsed_ticks = ext_ts.wrapping_sub(s.ext_start_ts) as i64;
        if elapsed_ticks < 0 {
            return;
        }
        let offset = Duration::from_nanos(
            (elapsed_ticks as u64).saturating_mul(1_000_000_000) / u64::from(s.clock_rate.get()),
        );
        let Some(implied_first) = now.checked_sub(offset) else {
            return;
        };
        if implied_first >= s.first_time {
            return;
        }
        let adjustment = s.first_time - implied_first;
        if adjustment > FIRST_PACKET_TIME_ADJUST_THRESHOLD {
            warn!(
                "first packet time adjustment too big, ignoring: {}ms",
                adjustment.as_millis()
            );
        } else {
            s.first_time = implied_first;
        }
    }

    /// The extended RTP timestamp the stream should be at by `at`, per the
    /// nominal clock rate. [`Error::Uninitialized`] before the first media
    /// packet.
    pub fn expected_rtp_timestamp(&self, at: Instant) -> Result<u64, Error> {
        let s = self.read();
        if !s.initialized {
            return Err(Error::Uninitialized);
        }
        let ticks = elapsed_ticks(at, s.first_time, s.clock_rate.get());
        Ok(s.ext_start_ts.wrapping_add(ticks as u64))
    }

    /// Builds the outbound RTCP sender report.
    ///
    /// The RTP timestamp is extrapolated from the highest forwarded
    /// timestamp; when a measured publisher clock rate is available and the
    /// publisher paces slower than nominal, the later of the two estimates
    /// wins. If even that lands behind the previously emitted report (pause/
    /// resume, pacing), the report is extrapolated from the previous one so
    /// the NTP↔RTP mapping never steps backwards.
    pub fn rtcp_sender_report(
        &self,
        ssrc: u32,
        calculated_clock_rate: Option<u32>,
        now: Instant,
    ) -> Option<SenderReport> {
        let mut guard = self.write();
        let s = &mut *guard;
        if !s.initialized {
            return None;
        }

        let now_ntp = s.anchor.ntp_at(now);
        let clock_rate = s.clock_rate.get();
        let time_since_first = now.saturating_duration_since(s.first_time);

        let ticks_since_highest = elapsed_ticks(now, s.highest_time, clock_rate);
        let mut now_rtp_ext = s.ext_highest_ts.wrapping_add(ticks_since_highest as u64);

        if let Some(rate) = calculated_clock_rate.filter(|&r| r != 0) {
            let using_rate = s
                .ext_start_ts
                .wrapping_add((f64::from(rate) * time_since_first.as_secs_f64()) as u64);
            if using_rate > now_rtp_ext {
                now_rtp_ext = using_rate;
            }
        }

        if let Some(prev) = s.sr_newest {
            if now_rtp_ext < prev.rtp_ext {
                info!(
                    "sender report out of order, repairing: prev_ext={} curr_ext={}",
                    prev.rtp_ext, now_rtp_ext
                );
                let ntp_diff_secs = now_ntp.0.wrapping_sub(prev.ntp.0) as f64 / (1u64 << 32) as f64;
                now_rtp_ext = prev
                    .rtp_ext
                    .wrapping_add((ntp_diff_secs * f64::from(clock_rate)) as u64);
            }
        }

        let record = SenderReportRecord {
            ntp: now_ntp,
            rtp: now_rtp_ext as u32,
            rtp_ext: now_rtp_ext,
            at: now,
        };
        s.sr_newest = Some(record);
        if s.sr_first.is_none() {
            s.sr_first = Some(record);
        }

        Some(SenderReport {
            ssrc,
            ntp_time: now_ntp,
            rtp_time: now_rtp_ext as u32,
            packet_count: (s.total_packets_primary() + s.packets_duplicate + s.packets_padding)
                as u32,
            octet_count: (s.bytes + s.bytes_duplicate + s.bytes_padding) as u32,
        })
    }

    /// Allocates a plain snapshot cursor. The first delta read covers from
    /// this moment (or from stream start, if the stream hasn't begun yet).
    pub fn new_snapshot_id(&self, now: Instant) -> u32 {
        let mut s = self.write();
        let id = s.next_snapshot_id;
        s.next_snapshot_id += 1;
        let seed = s.initialized.then(|| s.capture_snapshot(now));
        s.snapshots.push(seed);
        id
    }

    /// Allocates a receiver-report-driven snapshot cursor for
    /// [`delta_info_sender`].
    ///
    /// [`delta_info_sender`]: SenderStats::delta_info_sender
    pub fn new_sender_snapshot_id(&self, now: Instant) -> u32 {
        let mut s = self.write();
        let id = s.next_sender_snapshot_id;
        s.next_sender_snapshot_id += 1;
        let seed = s
            .initialized
            .then(|| init_sender_snapshot(now, s.ext_highest_sn));
        s.sender_snapshots.push(seed);
        id
    }

    /// Returns the feed-side delta since the previous read of this snapshot
    /// and resets the snapshot to now. `None` for an unknown id, before the
    /// stream initializes, or when the interval is implausibly wide.
    pub fn delta_info(&self, snapshot_id: u32, now: Instant) -> Option<RtpDeltaInfo> {
        let mut guard = self.write();
        let s = &mut *guard;
        if !s.initialized {
            return None;
        }
        let idx = snapshot_id.checked_sub(FIRST_SNAPSHOT_ID)? as usize;
        let (start_time, ext_start_sn) = (s.start_time, s.ext_start_sn);
        let slot = s.snapshots.get_mut(idx)?;
        let then = match *slot {
            Some(then) => then,
            None => {
                let init = init_snapshot(start_time, ext_start_sn);
                *slot = Some(init);
                init
            }
        };
        let now_snap = s.capture_snapshot(now);
        s.snapshots[idx] = Some(now_snap);

        let packets_expected = now_snap.ext_start_sn.wrapping_sub(then.ext_start_sn) as u32;
        if packets_expected > MAX_DELTA_PACKETS {
            warn!(
                "too many packets expected in delta: then={} now={} expected={packets_expected}",
                then.ext_start_sn, now_snap.ext_start_sn
            );
            return None;
        }
        let start_wall = s.anchor.wall_at(then.start_time);
        let duration = now_snap.start_time.saturating_duration_since(then.start_time);
        if packets_expected == 0 {
            return Some(zero_delta(start_wall, duration));
        }

        let mut packets_lost = now_snap.packets_lost.wrapping_sub(then.packets_lost) as u32;
        if (packets_lost as i32) < 0 {
            packets_lost = 0;
        }
        if packets_lost > packets_expected {
            warn!(
                "unexpected number of packets lost: then={} now={} expected={packets_expected} lost={packets_lost}",
                then.ext_start_sn, now_snap.ext_start_sn
            );
            packets_lost = packets_expected;
        }

        let jitter_max_us =
            then.max_jitter / f64::from(s.clock_rate.get()) * 1e6;
        Some(RtpDeltaInfo {
            start_time: start_wall,
            duration,
            packets: packets_expected.wrapping_sub(
                now_snap.packets_padding.wrapping_sub(then.packets_padding) as u32,
            ),
            bytes: now_snap.bytes.wrapping_sub(then.bytes),
            header_bytes: now_snap.header_bytes.wrapping_sub(then.header_bytes),
            packets_duplicate: now_snap
                .packets_duplicate
                .wrapping_sub(then.packets_duplicate) as u32,
            bytes_duplicate: now_snap.bytes_duplicate.wrapping_sub(then.bytes_duplicate),
            header_bytes_duplicate: now_snap
                .header_bytes_duplicate
                .wrapping_sub(then.header_bytes_duplicate),
            packets_padding: now_snap.packets_padding.wrapping_sub(then.packets_padding) as u32,
            bytes_padding: now_snap.bytes_padding.wrapping_sub(then.bytes_padding),
            header_bytes_padding: now_snap
                .header_bytes_padding
                .wrapping_sub(then.header_bytes_padding),
            packets_lost,
            packets_missing: packets_lost,
            packets_out_of_order: now_snap
                .packets_out_of_order
                .wrapping_sub(then.packets_out_of_order) as u32,
            frames: now_snap.frames.wrapping_sub(then.frames),
            rtt_max: then.max_rtt,
            jitter_max_us,
            nacks: now_snap.nacks.wrapping_sub(then.nacks),
            plis: now_snap.plis.wrapping_sub(then.plis),
            firs: now_snap.firs.wrapping_sub(then.firs),
        })
    }

    /// Returns the receiver-report-aligned delta since the previous read of
    /// this snapshot and resets the snapshot.
    ///
    /// `None` until the first receiver report arrives (there is nothing
    /// acknowledged to report against), for an unknown id, or when the
    /// interval is implausibly wide. Between two reads with no intervening
    /// receiver progress, returns a zero delta.
    pub fn delta_info_sender(&self, snapshot_id: u32) -> Option<RtpDeltaInfo> {
        let mut guard = self.write();
        let s = &mut *guard;
        let last_rr_time = s.last_rr_time?;
        if !s.initialized {
            return None;
        }
        let idx = snapshot_id.checked_sub(FIRST_SNAPSHOT_ID)? as usize;
        let (start_time, ext_start_sn) = (s.start_time, s.ext_start_sn);
        let slot = s.sender_snapshots.get_mut(idx)?;
        let then = match *slot {
            Some(then) => then,
            None => {
                let init = init_sender_snapshot(start_time, ext_start_sn);
                *slot = Some(init);
                init
            }
        };
        let now_snap = s.capture_sender_snapshot(last_rr_time, &then);
        s.sender_snapshots[idx] = Some(now_snap);

        let packets_expected = now_snap.ext_start_sn.wrapping_sub(then.ext_start_sn) as u32;
        if packets_expected > MAX_DELTA_PACKETS {
            warn!(
                "too many packets expected in delta (sender): then={} now={} expected={packets_expected}",
                then.ext_start_sn, now_snap.ext_start_sn
            );
            return None;
        }
        let start_wall = s.anchor.wall_at(then.start_time);
        let duration = now_snap.start_time.saturating_duration_since(then.start_time);
        if packets_expected == 0 {
            // No receiver progress since the last read.
            return Some(zero_delta(start_wall, duration));
        }

        let mut packets_lost = now_snap.packets_lost.wrapping_sub(then.packets_lost) as u32;
        if (packets_lost as i32) < 0 {
            packets_lost = 0;
        }
        let mut packets_lost_feed =
            now_snap.packets_lost_feed.wrapping_sub(then.packets_lost_feed) as u32;
        if (packets_lost_feed as i32) < 0 {
            packets_lost_feed = 0;
        }
        if packets_lost > packets_expected {
            warn!(
                "unexpected number of packets lost: then={} now={} expected={packets_expected} lost={packets_lost} feed={packets_lost_feed}",
                then.ext_start_sn, now_snap.ext_start_sn
            );
            packets_lost = packets_expected;
        }

        // Discount jitter the feed already carried; what's left is what this
        // hop and the last mile added.
        let jitter_max = (then.max_jitter - then.max_jitter_feed).max(0.0);
        let jitter_max_us = jitter_max / f64::from(s.clock_rate.get()) * 1e6;

        Some(RtpDeltaInfo {
            start_time: start_wall,
            duration,
            packets: packets_expected.wrapping_sub(
                now_snap.packets_padding.wrapping_sub(then.packets_padding) as u32,
            ),
            bytes: now_snap.bytes.wrapping_sub(then.bytes),
            header_bytes: now_snap.header_bytes.wrapping_sub(then.header_bytes),
            packets_duplicate: now_snap
                .packets_duplicate
                .wrapping_sub(then.packets_duplicate) as u32,
            bytes_duplicate: now_snap.bytes_duplicate.wrapping_sub(then.bytes_duplicate),
            header_bytes_duplicate: now_snap
                .header_bytes_duplicate
                .wrapping_sub(then.header_bytes_duplicate),
            packets_padding: now_snap.packets_padding.wrapping_sub(then.packets_padding) as u32,
            bytes_padding: now_snap.bytes_padding.wrapping_sub(then.bytes_padding),
            header_bytes_padding: now_snap
                .header_bytes_padding
                .wrapping_sub(then.header_bytes_padding),
            packets_lost,
            packets_missing: packets_lost_feed,
            packets_out_of_order: now_snap
                .packets_out_of_order
                .wrapping_sub(then.packets_out_of_order) as u32,
            frames: now_snap.frames.wrapping_sub(then.frames),
            rtt_max: then.max_rtt,
            jitter_max_us,
            nacks: now_snap.nacks.wrapping_sub(then.nacks),
            plis: now_snap.plis.wrapping_sub(then.plis),
            firs: now_snap.firs.wrapping_sub(then.firs),
        })
    }

    /// Counts NACKs received from the receiver. Counted, never interpreted.
    pub fn update_nacks(&self, count: u32) {
        let mut s = self.write();
        if s.end_time.is_none() {
            s.nacks += count;
        }
    }

    /// Counts Picture Loss Indications received.
    pub fn update_plis(&self, count: u32) {
        let mut s = self.write();
        if s.end_time.is_none() {
            s.plis += count;
        }
    }

    /// Counts Full Intra Requests received.
    pub fn update_firs(&self, count: u32) {
        let mut s = self.write();
        if s.end_time.is_none() {
            s.firs += count;
        }
    }

    /// The structured dump; `None` before the stream initializes.
    pub fn summary(&self, now: Instant) -> Option<StatsSummary> {
        let s = self.read();
        if !s.initialized {
            return None;
        }
        let end = s.end_time.unwrap_or(now);
        let elapsed = end.saturating_duration_since(s.start_time);
        let elapsed_secs = elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
        let clock_rate = f64::from(s.clock_rate.get());
        let packets = s.total_packets_primary();
        let packets_expected = s
            .ext_highest_sn
            .wrapping_sub(s.ext_start_sn)
            .wrapping_add(1);
        Some(StatsSummary {
            start_time: s.anchor.wall_at(s.start_time),
            end_time: s.anchor.wall_at(end),
            duration: elapsed,
            packets,
            packet_rate: packets as f64 / elapsed_secs,
            bytes: s.bytes,
            header_bytes: s.header_bytes,
            bitrate_bps: s.bytes as f64 * 8.0 / elapsed_secs,
            packets_lost: s.packets_lost,
            loss_rate: if packets_expected == 0 {
                0.0
            } else {
                s.packets_lost as f64 / packets_expected as f64
            },
            packets_lost_from_rr: s.packets_lost_from_rr,
            packets_duplicate: s.packets_duplicate,
            bytes_duplicate: s.bytes_duplicate,
            header_bytes_duplicate: s.header_bytes_duplicate,
            packets_padding: s.packets_padding,
            bytes_padding: s.bytes_padding,
            header_bytes_padding: s.header_bytes_padding,
            packets_out_of_order: s.packets_out_of_order,
            frames: s.frames,
            frame_rate: f64::from(s.frames) / elapsed_secs,
            jitter_us: s.jitter / clock_rate * 1e6,
            max_jitter_us: s.max_jitter / clock_rate * 1e6,
            jitter_from_rr_us: s.jitter_from_rr / clock_rate * 1e6,
            max_jitter_from_rr_us: s.max_jitter_from_rr / clock_rate * 1e6,
            rtt_ms: s.rtt,
            max_rtt_ms: s.max_rtt,
            nacks: s.nacks,
            plis: s.plis,
            firs: s.firs,
            ext_start_sn: s.ext_start_sn,
            ext_highest_sn: s.ext_highest_sn,
            ext_start_ts: s.ext_start_ts,
            ext_highest_ts: s.ext_highest_ts,
            gap_histogram: s
                .gap_histogram
                .iter()
                .enumerate()
                .filter(|(_, &count)| count != 0)
                .map(|(i, &count)| (i as u32 + 1, count))
                .collect(),
        })
    }
}

fn zero_delta(start_time: chrono::DateTime<chrono::Utc>, duration: Duration) -> RtpDeltaInfo {
    RtpDeltaInfo {
        start_time,
        duration,
        packets: 0,
        bytes: 0,
        header_bytes: 0,
        packets_duplicate: 0,
        bytes_duplicate: 0,
        header_bytes_duplicate: 0,
        packets_padding: 0,
        bytes_padding: 0,
        header_bytes_padding: 0,
        packets_lost: 0,
        packets_missing: 0,
        packets_out_of_order: 0,
        frames: 0,
        rtt_max: 0,
        jitter_max_us: 0.0,
        nacks: 0,
        plis: 0,
        firs: 0,
    }
}

/// Signed elapsed clock-rate ticks from `earlier` to `later`.
fn elapsed_ticks(later: Instant, earlier: Instant, clock_rate: u32) -> i64 {
    let (negative, d) = if later >= earlier {
        (false, later - earlier)
    } else {
        (true, earlier - later)
    };
    let ticks = (d.as_nanos() * u128::from(clock_rate) / 1_000_000_000) as i64;
    if negative {
        -ticks
    } else {
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn stats(clock_rate: u32) -> SenderStats {
        SenderStats::new(StatsConfig {
            clock_rate: NonZeroU32::new(clock_rate).unwrap(),
        })
    }

    /// A media packet: 12-byte header, 988-byte payload, 1000 bytes total.
    fn media(s: &SenderStats, at: Instant, ext_sn: u64, ext_ts: u64, marker: bool) {
        s.update(at, ext_sn, ext_ts, marker, 12, 988, 0);
    }

    /// A padding-only packet: 12-byte header, 243 bytes of padding.
    fn padding(s: &SenderStats, at: Instant, ext_sn: u64, ext_ts: u64) {
        s.update(at, ext_sn, ext_ts, false, 12, 0, 243);
    }

    #[test]
    fn padding_only_packet_does_not_initialize() {
        let s = stats(90_000);
        let t0 = Instant::now();
        padding(&s, t0, 1, 1_000);
        {
            let st = s.read();
            assert!(!st.initialized);
            assert_eq!(st.packets_padding, 0);
        }
        media(&s, t0 + ms(10), 5, 2_000, true);
        let st = s.read();
        assert!(st.initialized);
        assert_eq!(st.ext_start_sn, 5);
        assert_eq!(st.ext_highest_sn, 5);
        assert_eq!(st.ext_start_ts, 2_000);
        assert_eq!(st.ext_highest_ts, 2_000);
    }

    #[test]
    fn reordering_resolves_without_loss() {
        let s = stats(90_000);
        let t0 = Instant::now();
        for (i, sn) in [100u64, 101, 103].into_iter().enumerate() {
            media(&s, t0 + ms(i as u64 * 10), sn, sn * 3_000, false);
        }
        assert_eq!(s.read().packets_lost, 1);

        media(&s, t0 + ms(30), 102, 102 * 3_000, false);
        media(&s, t0 + ms(40), 104, 104 * 3_000, false);

        let st = s.read();
        assert_eq!(st.packets_lost, 0);
        assert_eq!(st.packets_out_of_order, 1);
        assert_eq!(st.ext_highest_sn, 104);
        assert_eq!(st.total_packets_primary(), 5);
    }

    #[test]
    fn in_order_stream_is_clean() {
        let s = stats(90_000);
        let t0 = Instant::now();
        for sn in 0u64..200 {
            media(&s, t0 + ms(sn * 10), 1_000 + sn, 30_000 + sn * 3_000, sn % 2 == 0);
        }
        let st = s.read();
        assert_eq!(st.packets_lost, 0);
        assert_eq!(st.packets_out_of_order, 0);
        assert_eq!(st.packets_duplicate, 0);
        assert_eq!(st.frames, 100);
        assert_eq!(st.total_packets_primary(), 200);
        assert_eq!(st.bytes, 200 * 1_000);
        assert_eq!(st.header_bytes, 200 * 12);
    }

    #[test]
    fn primary_duplicate_padding_partition_update_calls() {
        let s = stats(90_000);
        let t0 = Instant::now();
        let mut media_calls = 0u64;
        let mut padding_calls = 0u64;
        media(&s, t0, 10, 1_000, false);
        media_calls += 1;
        for i in 1u64..=20 {
            media(&s, t0 + ms(i), 10 + i, 1_000 + i * 3_000, false);
            media_calls += 1;
        }
        padding(&s, t0 + ms(21), 31, 64_000);
        padding_calls += 1;
        // Duplicates of already-recorded numbers.
        media(&s, t0 + ms(22), 15, 1_000 + 5 * 3_000, false);
        media(&s, t0 + ms(23), 16, 1_000 + 6 * 3_000, false);
        media_calls += 2;

        let st = s.read();
        assert_eq!(
            st.total_packets_primary() + st.packets_duplicate + st.packets_padding,
            media_calls + padding_calls
        );
    }

    #[test]
    fn late_arrival_reinstates_and_duplicate_does_not_go_negative() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 100, 1_000, false);
        media(&s, t0 + ms(10), 105, 16_000, false);
        assert_eq!(s.read().packets_lost, 4);

        media(&s, t0 + ms(20), 103, 10_000, false);
        {
            let st = s.read();
            assert_eq!(st.packets_lost, 3);
            assert_eq!(st.packets_out_of_order, 1);
            assert_eq!(st.packets_duplicate, 0);
        }

        // The same late packet again is a duplicate, not another reinstatement.
        media(&s, t0 + ms(30), 103, 10_000, false);
        let st = s.read();
        assert_eq!(st.packets_lost, 3);
        assert_eq!(st.packets_duplicate, 1);
    }

    #[test]
    fn media_before_origin_extends_start_backwards() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 100, 30_000, false);
        media(&s, t0 + ms(5), 95, 15_000, false);

        let st = s.read();
        assert_eq!(st.ext_start_sn, 95);
        assert_eq!(st.ext_start_ts, 15_000);
        // 95..=99 became expected; 95 itself arrived.
        assert_eq!(st.packets_lost, 4);
        assert_eq!(st.packets_out_of_order, 1);
    }

    #[test]
    fn padding_before_origin_is_ignored() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 100, 30_000, false);
        padding(&s, t0 + ms(5), 90, 15_000);
        let st = s.read();
        assert_eq!(st.ext_start_sn, 100);
        assert_eq!(st.packets_padding, 0);
        assert_eq!(st.packets_lost, 0);
    }

    #[test]
    fn receiver_report_carries_16_bit_cycles() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 10, 1_000, false);

        let (rtt, changed) = s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 65_530,
                ..Default::default()
            },
            t0 + ms(100),
        );
        assert_eq!((rtt, changed), (0, false));
        assert_eq!(s.read().ext_highest_sn_from_rr, 65_530);

        // The receiver wrapped its 16-bit sequence number to 5 and bumped
        // its cycle count: 65_541 on the wire.
        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 65_541,
                ..Default::default()
            },
            t0 + ms(200),
        );
        let st = s.read();
        assert_eq!(st.ext_highest_sn_from_rr, 65_541);
        assert_eq!(st.ext_highest_sn_from_rr & 0xFFFF, 5);
    }

    #[test]
    fn receiver_report_32_bit_wrap_is_lifted() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 10, 1_000, false);

        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 0xFFFF_FFFA,
                ..Default::default()
            },
            t0 + ms(100),
        );
        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 5,
                ..Default::default()
            },
            t0 + ms(200),
        );
        assert_eq!(s.read().ext_highest_sn_from_rr, (1u64 << 32) + 5);
    }

    #[test]
    fn total_lost_wrap_is_lifted() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 1, 1_000, false);

        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 100,
                total_lost: 0xFFFF_FFF0,
                ..Default::default()
            },
            t0 + ms(100),
        );
        assert_eq!(s.read().packets_lost_from_rr, 0xFFFF_FFF0);
        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 200,
                total_lost: 16,
                ..Default::default()
            },
            t0 + ms(200),
        );
        assert_eq!(s.read().packets_lost_from_rr, (1u64 << 32) + 16);
    }

    #[test]
    fn out_of_order_receiver_report_is_discarded() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 1, 1_000, false);

        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 1_000,
                jitter: 50,
                ..Default::default()
            },
            t0 + ms(100),
        );
        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 900,
                jitter: 999,
                ..Default::default()
            },
            t0 + ms(200),
        );
        let st = s.read();
        assert_eq!(st.ext_highest_sn_from_rr, 1_000);
        assert_eq!(st.last_rr.last_sequence_number, 1_000);
        // The stale report's jitter was not applied either.
        assert_eq!(st.jitter_from_rr, 50.0);
    }

    #[test]
    fn receiver_report_before_stream_origin_is_dropped() {
        let s = stats(90_000);
        let t0 = Instant::now();
        // Origin in the second 16-bit cycle.
        media(&s, t0, 70_000, 1_000, false);

        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 1_000,
                ..Default::default()
            },
            t0 + ms(100),
        );
        assert!(s.last_receiver_report_time().is_none());

        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 4_500,
                ..Default::default()
            },
            t0 + ms(200),
        );
        assert!(s.last_receiver_report_time().is_some());
    }

    #[test]
    fn rtt_is_computed_against_newest_sender_report() {
        let s = stats(90_000);
        let t0 = Instant::now();
        for sn in 1u64..=10 {
            media(&s, t0 + ms(sn * 10), sn, sn * 3_000, false);
        }
        let sr_at = t0 + ms(500);
        s.rtcp_sender_report(1, None, sr_at).unwrap();
        let sr_ntp = s.read().sr_newest.unwrap().ntp;

        // Receiver held our report for 200 ms and its block reaches us
        // 300 ms after we sent it: RTT should be about 100 ms.
        let (rtt, changed) = s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 10,
                last_sender_report: (sr_ntp.0 >> 16) as u32,
                delay: 65_536 / 5,
                ..Default::default()
            },
            sr_at + ms(300),
        );
        assert!(changed);
        assert!((95..=106).contains(&rtt), "rtt={rtt}");
        let st = s.read();
        assert_eq!(st.rtt, rtt);
        assert_eq!(st.max_rtt, rtt);
    }

    #[test]
    fn sender_report_counts_and_timestamp() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 1, 30_000, true);
        media(&s, t0 + ms(10), 2, 33_000, false);
        media(&s, t0 + ms(20), 3, 36_000, false);
        padding(&s, t0 + ms(30), 4, 39_000);
        media(&s, t0 + ms(40), 2, 33_000, false); // duplicate

        let now = t0 + ms(30) + Duration::from_secs(1);
        let sr = s.rtcp_sender_report(0xabcd, None, now).unwrap();
        assert_eq!(sr.ssrc, 0xabcd);
        assert_eq!(sr.packet_count, 5); // 3 media + 1 padding + 1 duplicate
        assert_eq!(sr.octet_count, 3 * 1_000 + 1_000 + 255);
        // Extrapolated one second past the highest timestamp.
        assert_eq!(sr.rtp_time, 39_000 + 90_000);

        let first = s.read().sr_first.unwrap();
        s.rtcp_sender_report(0xabcd, None, now + ms(100)).unwrap();
        let st = s.read();
        assert_eq!(st.sr_first.unwrap().at, first.at);
        assert!(st.sr_newest.unwrap().at > first.at);
    }

    #[test]
    fn sender_report_never_steps_backwards() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 1, 3_000, false);

        // A publisher-side clock rate estimate far above nominal pushes the
        // first report ahead of the media timeline.
        let sr1 = s
            .rtcp_sender_report(1, Some(900_000), t0 + ms(100))
            .unwrap();
        assert_eq!(sr1.rtp_time, 3_000 + 90_000);

        // Without the estimate the naive extrapolation would fall behind;
        // the report is repaired from the previous one instead.
        let sr2 = s.rtcp_sender_report(1, None, t0 + ms(200)).unwrap();
        assert!(
            (93_000 + 9_000 - 10..=93_000 + 9_000 + 10).contains(&sr2.rtp_time),
            "rtp_time={}",
            sr2.rtp_time
        );
        let st = s.read();
        assert!(st.sr_newest.unwrap().rtp_ext >= u64::from(sr1.rtp_time));
    }

    #[test]
    fn sender_delta_tracks_receiver_report_intervals() {
        let s = stats(90_000);
        let t0 = Instant::now();
        let id = s.new_sender_snapshot_id(t0);
        assert!(s.delta_info_sender(id).is_none(), "no RR yet");

        for sn in 1u64..=500 {
            media(&s, t0 + ms(sn), sn, sn * 3_000, false);
        }
        let rr_0_at = t0 + ms(1_000);
        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 500,
                ..Default::default()
            },
            rr_0_at,
        );
        let delta_0 = s.delta_info_sender(id).unwrap();
        assert_eq!(delta_0.packets, 500);
        assert_eq!(delta_0.bytes, 500 * 1_000);
        assert_eq!(delta_0.packets_lost, 0);

        for sn in 501u64..=1_000 {
            media(&s, t0 + ms(1_000 + sn), sn, sn * 3_000, false);
        }
        let rr_1_at = rr_0_at + ms(200);
        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 1_000,
                ..Default::default()
            },
            rr_1_at,
        );
        let delta_1 = s.delta_info_sender(id).unwrap();
        assert_eq!(delta_1.duration, ms(200));
        assert_eq!(delta_1.packets, 500);
        assert_eq!(delta_1.bytes, 500 * 1_000);

        // No receiver progress since: a zero delta, not nothing.
        let delta_2 = s.delta_info_sender(id).unwrap();
        assert_eq!(delta_2.packets, 0);
        assert_eq!(delta_2.bytes, 0);
        assert_eq!(delta_2.duration, ms(0));
    }

    #[test]
    fn sender_delta_separates_padding() {
        let s = stats(90_000);
        let t0 = Instant::now();
        let id = s.new_sender_snapshot_id(t0);
        for sn in 1u64..=100 {
            if sn % 10 == 0 {
                padding(&s, t0 + ms(sn), sn, sn * 3_000);
            } else {
                media(&s, t0 + ms(sn), sn, sn * 3_000, sn % 3 == 0);
            }
        }
        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 100,
                ..Default::default()
            },
            t0 + ms(500),
        );
        let delta = s.delta_info_sender(id).unwrap();
        assert_eq!(delta.packets_padding, 10);
        assert_eq!(delta.packets, 90);
        assert_eq!(delta.bytes, 90 * 1_000);
        assert_eq!(delta.bytes_padding, 10 * 255);
    }

    #[test]
    fn feed_delta_resets_on_read() {
        let s = stats(90_000);
        let t0 = Instant::now();
        for sn in 100u64..105 {
            media(&s, t0 + ms(sn), sn, sn * 3_000, false);
        }
        let id = s.new_snapshot_id(t0 + ms(200));
        for sn in 105u64..115 {
            media(&s, t0 + ms(sn + 200), sn, sn * 3_000, false);
        }
        let delta = s.delta_info(id, t0 + ms(400)).unwrap();
        assert_eq!(delta.packets, 10);
        assert_eq!(delta.bytes, 10 * 1_000);
        assert_eq!(delta.duration, ms(200));

        let empty = s.delta_info(id, t0 + ms(500)).unwrap();
        assert_eq!(empty.packets, 0);
        assert_eq!(empty.bytes, 0);
    }

    #[test]
    fn oversized_delta_interval_is_refused() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 1, 3_000, false);
        let id = s.new_snapshot_id(t0);
        media(&s, t0 + ms(10), 50_000, 50_000 * 3_000, false);
        assert!(s.delta_info(id, t0 + ms(20)).is_none());
    }

    #[test]
    fn unknown_snapshot_id_returns_none() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 1, 3_000, false);
        assert!(s.delta_info(7, t0).is_none());
        assert!(s.delta_info(0, t0).is_none());
    }

    #[test]
    fn jitter_tracks_arrival_irregularity() {
        let s = stats(90_000);
        let t0 = Instant::now();
        // Perfectly paced frames: one packet per 3000-tick timestamp step.
        for i in 0u64..100 {
            media(
                &s,
                t0 + Duration::from_nanos(i * 33_333_333),
                100 + i,
                30_000 + i * 3_000,
                true,
            );
        }
        assert!(s.read().jitter < 2.0, "jitter={}", s.read().jitter);

        // One frame held back 18 ms (1620 ticks of transit change).
        media(
            &s,
            t0 + Duration::from_nanos(100 * 33_333_333) + ms(18),
            200,
            30_000 + 100 * 3_000,
            true,
        );
        let st = s.read();
        assert!(st.jitter > 50.0, "jitter={}", st.jitter);
        assert!(st.max_jitter >= st.jitter);
    }

    #[test]
    fn jitter_ignores_packets_of_the_same_frame() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 1, 3_000, false);
        media(&s, t0 + ms(20), 2, 6_000, false);
        let before = s.read().jitter;
        // Same timestamp, wildly different arrival: same frame, no effect.
        media(&s, t0 + ms(500), 3, 6_000, true);
        assert_eq!(s.read().jitter, before);
    }

    #[test]
    fn feed_jitter_is_discounted_from_sender_delta() {
        let s = stats(90_000);
        let t0 = Instant::now();
        let id = s.new_sender_snapshot_id(t0);
        // Erratic feed arrivals build up feed jitter.
        for i in 0u64..50 {
            let wobble = if i % 2 == 0 { ms(0) } else { ms(15) };
            media(&s, t0 + ms(i * 33) + wobble, 100 + i, 30_000 + i * 3_000, true);
        }
        // Receiver reports less jitter than the feed already had.
        s.update_from_receiver_report(
            ReceptionReport {
                last_sequence_number: 149,
                jitter: 10,
                ..Default::default()
            },
            t0 + ms(2_000),
        );
        let delta = s.delta_info_sender(id).unwrap();
        assert_eq!(delta.jitter_max_us, 0.0);
    }

    #[test]
    fn stop_freezes_the_stream() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 1, 3_000, false);
        media(&s, t0 + ms(10), 2, 6_000, false);
        s.stop(t0 + ms(20));

        media(&s, t0 + ms(30), 3, 9_000, false);
        s.update_nacks(4);
        let (rtt, changed) =
            s.update_from_receiver_report(ReceptionReport::default(), t0 + ms(40));
        assert_eq!((rtt, changed), (0, false));

        let st = s.read();
        assert_eq!(st.ext_highest_sn, 2);
        assert_eq!(st.nacks, 0);
        assert!(st.last_rr_time.is_none());

        let summary = s.summary(t0 + ms(500)).unwrap();
        assert_eq!(summary.duration, ms(20));
    }

    #[test]
    fn feedback_counters_accumulate() {
        let s = stats(90_000);
        s.update_nacks(3);
        s.update_nacks(2);
        s.update_plis(1);
        s.update_firs(1);
        let st = s.read();
        assert_eq!((st.nacks, st.plis, st.firs), (5, 1, 1));
    }

    #[test]
    fn seed_copies_state_once() {
        let a = stats(90_000);
        let t0 = Instant::now();
        for sn in 1u64..=20 {
            media(&a, t0 + ms(sn), sn, sn * 3_000, sn % 4 == 0);
        }
        a.update_nacks(7);

        let b = stats(90_000);
        b.seed_from(&a);
        {
            let (sa, sb) = (a.read(), b.read());
            assert!(sb.initialized);
            assert_eq!(sb.ext_start_sn, sa.ext_start_sn);
            assert_eq!(sb.ext_highest_sn, sa.ext_highest_sn);
            assert_eq!(sb.bytes, sa.bytes);
            assert_eq!(sb.nacks, 7);
        }

        // Seeding an already-initialized object is a no-op.
        let c = stats(90_000);
        let t1 = t0 + Duration::from_secs(10);
        media(&c, t1, 500, 9_000, false);
        c.seed_from(&a);
        assert_eq!(c.read().ext_start_sn, 500);
    }

    #[test]
    fn expected_timestamp_extrapolates_from_origin() {
        let s = stats(90_000);
        let t0 = Instant::now();
        assert_eq!(s.expected_rtp_timestamp(t0), Err(Error::Uninitialized));
        media(&s, t0, 1, 90_000, false);
        assert_eq!(
            s.expected_rtp_timestamp(t0 + Duration::from_secs(1)),
            Ok(90_000 + 90_000)
        );
    }

    #[test]
    fn first_packet_time_moves_back_on_evidence() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 1, 90_000, false);

        // A timestamp half a second ahead observed only 200 ms in: the
        // stream must have started 300 ms before we saw it.
        s.maybe_adjust_first_packet_time(90_000 + 45_000, t0 + ms(200));
        assert_eq!(
            s.expected_rtp_timestamp(t0),
            Ok(90_000 + 27_000),
            "origin should have moved 300ms back"
        );

        // An implausibly large step is refused.
        s.maybe_adjust_first_packet_time(90_000 + 100 * 90_000, t0 + ms(300));
        assert_eq!(s.expected_rtp_timestamp(t0), Ok(90_000 + 27_000));
    }

    #[test]
    fn summary_reports_totals_and_histogram() {
        let s = stats(90_000);
        let t0 = Instant::now();
        media(&s, t0, 100, 30_000, true);
        media(&s, t0 + ms(10), 103, 39_000, true); // run of 2 missing
        media(&s, t0 + ms(20), 110, 60_000, true); // run of 6 missing

        let summary = s.summary(t0 + ms(1_000)).unwrap();
        assert_eq!(summary.ext_start_sn, 100);
        assert_eq!(summary.ext_highest_sn, 110);
        assert_eq!(summary.packets, 3);
        assert_eq!(summary.packets_lost, 8);
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.duration, ms(1_000));
        assert_eq!(summary.gap_histogram, vec![(2, 1), (6, 1)]);

        let text = format!("{summary}");
        assert!(text.contains("sn: 100..110"), "{text}");

        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"packets\":3"), "{json}");
    }
}
