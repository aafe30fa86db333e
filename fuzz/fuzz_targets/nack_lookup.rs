// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use downtrack::sequencer::Sequencer;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let s = Sequencer::new(NonZeroUsize::new(64).unwrap(), true);
    let t0 = Instant::now();
    let mut ext_sn: u64 = 0x1_0000;
    let mut ext_ts: u64 = 0x1_0000_0000;
    for chunk in data.chunks_exact(2) {
        let op = chunk[0];
        let arg = u64::from(chunk[1]);
        match op & 0b11 {
            0 => {
                ext_sn += arg;
                ext_ts += arg * 3_000;
                s.push(t0, ext_sn, ext_sn, ext_ts, op & 0b100 != 0, 0, &chunk[..1], &[]);
            }
            1 => {
                if op & 0b100 != 0 {
                    // A skipped padding run ahead of the head.
                    let start = ext_sn + 1;
                    let end = start + (arg & 0x7);
                    s.push_padding(start, end);
                    ext_sn = end;
                } else {
                    // A stale range behind the head.
                    let start = ext_sn.saturating_sub(arg);
                    s.push_padding(start, start + u64::from(op >> 4));
                }
            }
            _ => {
                let sn = ext_sn.wrapping_sub(arg) as u16;
                let at = t0 + Duration::from_millis(u64::from(op) * 8);
                for meta in s.ext_packet_metas(&[sn], at) {
                    assert_eq!(meta.ext_sequence_number & 0xFFFF, u64::from(sn));
                    assert_eq!(meta.packet.target_seq_no, sn);
                }
            }
        }
    }
});
