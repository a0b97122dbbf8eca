// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Instant;

use once_cell::sync::Lazy;

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since process start, truncated to 32 bits.
///
/// The KCP engine works with a wrapping 32-bit millisecond clock; all
/// callers must use the same epoch.
#[inline]
pub fn millis_now() -> u32 {
    CLOCK_EPOCH.elapsed().as_millis() as u32
}

/// 32-bit FNV-1a over an arbitrary byte string.
pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in data {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
