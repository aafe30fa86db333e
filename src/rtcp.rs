// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The slice of RTCP this crate consumes and produces, as described in
//! [RFC 3550 section 6.4](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4).
//!
//! These are plain data types: parsing inbound compound packets and
//! serializing outbound reports belong to the transport layer. The stats
//! engine only reads and writes the fields below.

use std::time::Instant;

use crate::{Error, NtpTimestamp};

/// One reception report block, as found in a receiver report (RR) or
/// appended to a sender report, defined in
/// [RFC 3550 section 6.4.2](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.2):
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 SSRC_1 (SSRC of first source)                 |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | fraction lost |       cumulative number of packets lost       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           extended highest sequence number received           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      interarrival jitter                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         last SR (LSR)                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   delay since last SR (DLSR)                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceptionReport {
    /// SSRC of the source this block reports on.
    pub ssrc: u32,

    /// Fraction of packets lost since the previous report, as an 8-bit
    /// fixed-point fraction.
    pub fraction_lost: u8,

    /// Cumulative number of packets lost. 24 bits (signed) on the wire;
    /// the parser hands it to us already widened.
    pub total_lost: u32,

    /// Extended highest sequence number received: the receiver's count of
    /// sequence number cycles in the top 16 bits, the raw sequence number in
    /// the bottom 16.
    pub last_sequence_number: u32,

    /// Interarrival jitter in timestamp (clock-rate) units.
    pub jitter: u32,

    /// The middle 32 bits of the NTP timestamp of the last sender report the
    /// receiver saw (LSR), or zero if it has seen none.
    pub last_sender_report: u32,

    /// Delay between receiving that sender report and sending this block
    /// (DLSR), in units of 1/65536 seconds.
    pub delay: u32,
}

/// The sender-info portion of an outbound sender report (SR), defined in
/// [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1).
/// Produced by [`crate::stats::SenderStats::rtcp_sender_report`]; the caller
/// appends reception report blocks and serializes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,

    /// Wallclock time at which this report was generated.
    pub ntp_time: NtpTimestamp,

    /// The RTP timestamp corresponding to `ntp_time`: the same instant
    /// expressed in the stream's clock-rate units, so receivers can line the
    /// media timeline up against the wallclock.
    pub rtp_time: u32,

    /// Total packets sent since the stream began, including padding and
    /// retransmitted duplicates. Wraps mod 2^32.
    pub packet_count: u32,

    /// Total payload octets sent (not including headers or padding octet
    /// counts excluded by RFC 3550; here, all accounted bytes). Wraps.
    pub octet_count: u32,
}

/// Bookkeeping for a sender report this side emitted, kept so a later report
/// can be generated consistently with it and so receiver reports referencing
/// it (via LSR/DLSR) can be turned into a round-trip time.
#[derive(Copy, Clone, Debug)]
pub struct SenderReportRecord {
    pub ntp: NtpTimestamp,
    pub rtp: u32,

    /// The unwrapped 64-bit form of `rtp`.
    pub rtp_ext: u64,

    /// When the report was generated.
    pub at: Instant,
}

/// Computes the round-trip time, in milliseconds, implied by a reception
/// report block.
///
/// Per [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1),
/// the receiver echoes the middle 32 bits of the NTP timestamp of the last
/// sender report it saw (LSR) along with how long it held it (DLSR); the
/// round trip is then `now - LSR - DLSR` in units of 1/65536 seconds.
///
/// `last_sr_ntp` is the NTP timestamp of the newest sender report we
/// actually sent and `now_ntp` the current time. Returns
/// [`Error::NoSenderReport`] when the block's LSR is zero and
/// [`Error::StaleSenderReport`] when it names some earlier report; both are
/// routine (stream startup, reports crossing on the wire) and callers are
/// expected to ignore them quietly.
pub fn rtt_from_reception_report(
    rr: &ReceptionReport,
    last_sr_ntp: NtpTimestamp,
    now_ntp: NtpTimestamp,
) -> Result<u32, Error> {
    if rr.last_sender_report == 0 {
        return Err(Error::NoSenderReport);
    }
    if rr.last_sender_report != ((last_sr_ntp.0 >> 16) as u32) {
        return Err(Error::StaleSenderReport);
    }
    let now_mid = (now_ntp.0 >> 16) as u32;
    let delta = now_mid
        .wrapping_sub(rr.last_sender_report)
        .wrapping_sub(rr.delay);
    // 1/65536ths of a second to milliseconds, rounding up.
    Ok(((u64::from(delta) * 1_000 + 0xFFFF) >> 16) as u32)
}
