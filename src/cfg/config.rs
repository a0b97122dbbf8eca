// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Framework configuration.
///
/// Everything has a sensible default so embedded use never needs a file;
/// `load_from_file` reads the same structure from YAML.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Executor pool and buffer sizing.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Timeouts and connection behavior.
    #[serde(default)]
    pub net: NetConfig,
    /// KCP overlay tuning.
    #[serde(default)]
    pub kcp: KcpConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(default, rename = "Concurrency")]
    /// Number of executors in the pool; 0 selects 2x hardware concurrency.
    pub concurrency: usize,

    #[serde(default = "default_recv_chunk", rename = "RecvChunkSize")]
    /// Read-at-least-1 chunk size for stream sessions.
    pub recv_chunk_size: usize,

    #[serde(default = "default_datagram_buffer", rename = "DatagramBufferSize")]
    /// Scratch buffer for UDP receive paths.
    pub datagram_buffer_size: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NetConfig {
    #[serde(default = "default_connect_timeout", rename = "ConnectTimeoutMs")]
    /// Budget covering name resolution plus connect.
    pub connect_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout", rename = "HandshakeTimeoutMs")]
    /// Budget for the overlay handshake (TLS, KCP).
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_shutdown_timeout", rename = "ShutdownTimeoutMs")]
    /// Grace period for overlay shutdown against unresponsive peers.
    pub shutdown_timeout_ms: u64,

    #[serde(default = "default_reconnect_delay", rename = "ReconnectDelayMs")]
    /// Client re-connect delay after a session stops (opt-in feature).
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_accept_backoff", rename = "AcceptBackoffMs")]
    /// Pause after a transient accept failure (fd exhaustion).
    pub accept_backoff_ms: u64,

    #[serde(default, rename = "KeepAlive")]
    /// Apply TCP keepalive to stream sessions.
    pub keepalive: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct KcpConfig {
    #[serde(default = "default_syn_retransmit", rename = "SynRetransmitMs")]
    /// SYN retransmit cadence during the client handshake.
    pub syn_retransmit_ms: u64,

    #[serde(default = "default_true", rename = "NoDelay")]
    pub nodelay: bool,

    #[serde(default = "default_kcp_interval", rename = "IntervalMs")]
    pub interval_ms: i32,

    #[serde(default = "default_kcp_resend", rename = "Resend")]
    pub resend: i32,

    #[serde(default = "default_true", rename = "NoCongestion")]
    pub no_congestion: bool,

    #[serde(default = "default_snd_wnd", rename = "SendWindow")]
    pub send_window: u16,

    #[serde(default = "default_rcv_wnd", rename = "RecvWindow")]
    pub recv_window: u16,
}

fn default_recv_chunk() -> usize {
    16 * 1024
}
fn default_datagram_buffer() -> usize {
    64 * 1024
}
fn default_connect_timeout() -> u64 {
    5_000
}
fn default_handshake_timeout() -> u64 {
    5_000
}
fn default_shutdown_timeout() -> u64 {
    5_000
}
fn default_reconnect_delay() -> u64 {
    3_000
}
fn default_accept_backoff() -> u64 {
    1_000
}
fn default_syn_retransmit() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_kcp_interval() -> i32 {
    10
}
fn default_kcp_resend() -> i32 {
    2
}
fn default_snd_wnd() -> u16 {
    128
}
fn default_rcv_wnd() -> u16 {
    512
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            recv_chunk_size: default_recv_chunk(),
            datagram_buffer_size: default_datagram_buffer(),
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            accept_backoff_ms: default_accept_backoff(),
            keepalive: false,
        }
    }
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            syn_retransmit_ms: default_syn_retransmit(),
            nodelay: true,
            interval_ms: default_kcp_interval(),
            resend: default_kcp_resend(),
            no_congestion: true,
            send_window: default_snd_wnd(),
            recv_window: default_rcv_wnd(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.net.connect_timeout_ms)
    }

    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.net.handshake_timeout_ms)
    }

    #[inline]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.net.shutdown_timeout_ms)
    }

    #[inline]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.net.reconnect_delay_ms)
    }

    #[inline]
    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.net.accept_backoff_ms)
    }
}
