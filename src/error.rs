// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// An error from one of this crate's fallible lookups.
///
/// Every variant is recoverable. The hot paths treat these as "skip this
/// sequence number" or "skip this report" and keep going; nothing in this
/// crate panics or corrupts state on misuse. The worst consequence of any
/// of these is a lost retransmission opportunity or a skipped reporting
/// interval.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An exclusion with `start >= end` was requested.
    #[error("invalid exclusion range [{start}, {end})")]
    InvalidRange { start: u64, end: u64 },

    /// An exclusion overlaps sequence number space that was already excluded.
    /// Exclusions must be appended in increasing order.
    #[error("exclusion [{start}, {end}) overlaps already-excluded space ending at {prior_end}")]
    RangeOverlap {
        start: u64,
        end: u64,
        prior_end: u64,
    },

    /// The queried sequence number lies inside an exclusion, so it has no
    /// offset: it names padding that was never forwarded.
    #[error("sequence number {key} lies inside exclusion [{start}, {end})")]
    ExcludedKey { key: u64, start: u64, end: u64 },

    /// The stream has not seen a media packet yet, so there is no origin to
    /// extrapolate from.
    #[error("stream not initialized")]
    Uninitialized,

    /// The receiver report carries a zero last-SR timestamp; the receiver has
    /// not seen any of our sender reports, so no round-trip time can be
    /// computed. Expected while a stream is starting up.
    #[error("receiver report carries no last-SR timestamp")]
    NoSenderReport,

    /// The receiver report references a sender report other than the newest
    /// one we sent; computing a round-trip time against it would overstate
    /// the RTT. Expected when reports cross on the wire.
    #[error("receiver report references a stale sender report")]
    StaleSenderReport,
}
