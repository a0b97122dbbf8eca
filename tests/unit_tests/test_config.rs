// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use nettide::cfg::config::Config;

#[test]
fn defaults_are_usable_without_a_file() {
    let cfg = Config::default();
    assert_eq!(cfg.runtime.concurrency, 0);
    assert_eq!(cfg.connect_timeout(), Duration::from_secs(5));
    assert_eq!(cfg.reconnect_delay(), Duration::from_secs(3));
    assert_eq!(cfg.accept_backoff(), Duration::from_secs(1));
    assert!(cfg.kcp.nodelay);
    assert!(cfg.kcp.no_congestion);
}

#[test]
fn yaml_round_trip() -> Result<()> {
    let cfg = Config::load_from_file("tests/config.yaml")?;
    assert_eq!(cfg.runtime.concurrency, 2);
    assert_eq!(cfg.net.connect_timeout_ms, 5_000);
    assert_eq!(cfg.kcp.syn_retransmit_ms, 500);
    Ok(())
}

#[test]
fn missing_file_is_an_error() {
    assert!(Config::load_from_file("tests/does_not_exist.yaml").is_err());
}
