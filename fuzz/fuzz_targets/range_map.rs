// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use downtrack::range_map::RangeMap;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut map = RangeMap::new(8);
    let mut cursor: u64 = 0;
    for chunk in data.chunks_exact(3) {
        cursor += u64::from(chunk[0]);
        let len = u64::from(chunk[1] & 0x0f);
        let _ = map.exclude_range(cursor, cursor + len);
        let _ = map.get_value(cursor.wrapping_add(u64::from(chunk[2])));
    }

    // The offset must be a stepwise non-decreasing function wherever it is
    // defined.
    let mut prev = 0;
    for key in 0..cursor.saturating_add(32).min(1 << 16) {
        if let Ok(offset) = map.get_value(key) {
            assert!(offset >= prev, "offset went backwards at {key}");
            prev = offset;
        }
    }
});
