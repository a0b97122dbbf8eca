// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use nettide::buffer::ByteRing;

#[test]
fn interleaved_writes_and_consumes() {
    let mut ring = ByteRing::with_capacity(8);

    ring.write(b"abc");
    ring.consume(1);
    ring.write(b"def");
    assert_eq!(ring.readable(), b"bcdef");

    ring.consume(2);
    assert_eq!(ring.readable(), b"def");
    assert_eq!(ring.len(), 3);

    ring.consume(3);
    assert!(ring.is_empty());
}

#[test]
fn clear_resets_both_cursors() {
    let mut ring = ByteRing::new();
    ring.write(b"leftover");
    ring.consume(4);
    ring.clear();
    assert!(ring.is_empty());
    ring.write(b"fresh");
    assert_eq!(ring.readable(), b"fresh");
}

#[test]
fn grows_past_initial_capacity() {
    let mut ring = ByteRing::with_capacity(4);
    let big = vec![0x5au8; 1 << 16];
    ring.write(&big);
    assert_eq!(ring.len(), big.len());
    assert_eq!(ring.readable(), big.as_slice());
}
