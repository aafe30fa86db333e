// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Packet tracking for the sending side of an RTP selective forwarding unit.
//!
//! A selective forwarding unit (SFU) receives each publisher's RTP stream
//! once and forwards it to any number of subscribers, rewriting sequence
//! numbers and timestamps along the way. This crate provides the two
//! per-downstream-track objects that make that forwarding accountable:
//!
//! *   [`sequencer::Sequencer`] remembers what was forwarded, so that a
//!     subscriber's NACK can be answered with a retransmission of the
//!     original publisher packet, and throttles over-eager retransmission
//!     requests.
//! *   [`stats::SenderStats`] keeps full accounting of the outbound stream
//!     (bytes, loss, reordering, jitter, round-trip time), ingests the
//!     subscriber's RTCP receiver reports, and synthesizes outbound sender
//!     reports with a monotonic NTP↔RTP mapping.
//!
//! Both are self-contained concurrent objects: every operation is
//! synchronous, lock-protected, and bounded. There is no I/O here. Callers
//! drive these objects from their packet-forwarding and RTCP-timer paths and
//! hand in already-extended 64-bit sequence numbers and timestamps; parsing,
//! header rewriting, congestion control, and pacing all live elsewhere.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::{Debug, Display};
use std::time::Instant;

mod error;
mod hex;

pub mod range_map;
pub mod rtcp;
pub mod sequencer;
pub mod stats;

pub use error::Error;

/// The Unix epoch as an [`NtpTimestamp`].
pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp((2_208_988_800) << 32);

/// A wallclock time represented using the format of the Network Time Protocol.
///
/// NTP timestamps are in a fixed-point representation of seconds since
/// 0h UTC on 1 January 1900. The top 32 bits represent the integer part
/// (wrapping around every 68 years) and the bottom 32 bits represent the
/// fractional part.
///
/// This is a simple wrapper around a `u64` in that format, with a `Display`
/// impl that writes the timestamp as a human-readable string. Currently this
/// assumes the time is within 68 years of 1970; the string will be incorrect
/// after `2038-01-19T03:14:07Z`.
///
/// An `NtpTimestamp` isn't necessarily gathered from a real NTP server.
/// Reported NTP timestamps are allowed to jump backwards and/or be complete
/// nonsense.
///
/// The NTP timestamp of the Unix epoch is available via the constant [`UNIX_EPOCH`].
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let date_time: chrono::DateTime<chrono::Local> = (*self).into();
        write!(f, "{}", date_time.format("%FT%T%.3f%:z"),)
    }
}

impl Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Write both the raw and display forms.
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl<TZ> TryFrom<chrono::DateTime<TZ>> for NtpTimestamp
where
    TZ: chrono::TimeZone,
{
    type Error = std::num::TryFromIntError;
    fn try_from(orig: chrono::DateTime<TZ>) -> Result<Self, Self::Error> {
        let epoch_naive = chrono::NaiveDate::from_ymd_opt(1900, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let epoch = chrono::TimeZone::from_local_datetime(&chrono::Utc, &epoch_naive).unwrap();
        let elapsed: chrono::Duration = orig.with_timezone(&chrono::Utc) - epoch;
        let sec_since_epoch: u32 = elapsed.num_seconds().try_into()?;
        let nanos = elapsed.to_std().unwrap().subsec_nanos();
        let frac = f64::from(nanos) / 1e9;
        let frac_int = (frac * f64::from(u32::MAX)).round() as u32;
        let val = (u64::from(sec_since_epoch) << 32) + u64::from(frac_int);
        Ok(NtpTimestamp(val))
    }
}

impl<TZ> From<NtpTimestamp> for chrono::DateTime<TZ>
where
    TZ: chrono::TimeZone,
    chrono::DateTime<TZ>: From<chrono::DateTime<chrono::Utc>>,
{
    fn from(orig: NtpTimestamp) -> Self {
        let since_epoch = orig.0.wrapping_sub(UNIX_EPOCH.0);
        let sec_since_epoch = (since_epoch >> 32) as u32;
        let frac_int = (since_epoch & 0xFFFF_FFFF) as u32;
        let frac = frac_int as f64 / f64::from(u32::MAX);
        let nanos = (frac * 1e9).round() as u32;
        let timedelta: chrono::Duration = chrono::Duration::try_seconds(sec_since_epoch.into())
            .unwrap()
            + chrono::Duration::nanoseconds(nanos.into());
        let date_time = chrono::DateTime::UNIX_EPOCH + timedelta;
        date_time.into()
    }
}

/// A paired wallclock/monotonic reading, captured once at construction.
///
/// Every wallclock value this crate reports is derived as
/// `wall + (instant - anchored instant)`, so reported times can never run
/// backwards even if the realtime clock jumps. A backwards step would be
/// visible downstream: the NTP timestamps in outbound sender reports are
/// what receivers use to line RTP time up with wallclock time.
#[derive(Copy, Clone, Debug)]
pub(crate) struct MonotonicAnchor {
    wall: chrono::DateTime<chrono::Utc>,
    instant: Instant,
}

impl MonotonicAnchor {
    pub(crate) fn now() -> Self {
        Self {
            wall: chrono::Utc::now(),
            instant: Instant::now(),
        }
    }

    /// The anchored instant, usable as a placeholder before real times are
    /// known.
    pub(crate) fn reference(&self) -> Instant {
        self.instant
    }

    /// Returns the wallclock rendering of `at`.
    pub(crate) fn wall_at(&self, at: Instant) -> chrono::DateTime<chrono::Utc> {
        let delta = if at >= self.instant {
            chrono::Duration::from_std(at - self.instant)
                .unwrap_or_else(|_| chrono::Duration::zero())
        } else {
            -chrono::Duration::from_std(self.instant - at)
                .unwrap_or_else(|_| chrono::Duration::zero())
        };
        self.wall + delta
    }

    /// Returns the NTP rendering of `at`.
    ///
    /// Falls back to [`UNIX_EPOCH`] in the (unreachable in practice) case
    /// that the anchored wallclock predates 1900.
    pub(crate) fn ntp_at(&self, at: Instant) -> NtpTimestamp {
        NtpTimestamp::try_from(self.wall_at(at)).unwrap_or(UNIX_EPOCH)
    }
}
