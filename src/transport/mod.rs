//! Transport overlays: the layer between the raw socket and user bytes.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use crate::{error::NetResult, session::Session};

pub mod binary;
pub mod kcp;
pub mod tls;

pub use tls::TlsContext;

/// Socket family a server or client runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Udp,
}

/// Overlay riding on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayKind {
    Binary,
    Tls,
    Kcp,
}

/// Per-session overlay state.
///
/// All variants share one contract: `handshake` completes before the
/// session registers, inbound bytes pass through the overlay before the
/// upper protocol sees them, and `shutdown` runs the overlay's close
/// rules during session teardown.
pub(crate) enum Overlay {
    Binary,
    Tls(tls::TlsOverlay),
    Kcp(Box<kcp::KcpOverlay>),
}

impl Overlay {
    /// TLS and KCP handshakes are user-visible through the `handshake`
    /// event; the binary overlay completes silently.
    pub(crate) fn wants_handshake_event(&self) -> bool {
        !matches!(self, Overlay::Binary)
    }

    pub(crate) async fn handshake(&self, session: &Arc<Session>) -> NetResult<()> {
        match self {
            Overlay::Binary => binary::handshake(session).await,
            Overlay::Tls(t) => t.handshake(session).await,
            Overlay::Kcp(k) => k.handshake(session).await,
        }
    }

    pub(crate) async fn shutdown(&self, session: &Arc<Session>) {
        match self {
            Overlay::Binary => binary::shutdown(session).await,
            Overlay::Tls(_) => {
                // close_notify first; the socket closes once the TLS
                // shutdown resolves or the grace period runs out.
                session
                    .shutdown_stream(Some(session.cfg().shutdown_timeout()))
                    .await;
            },
            Overlay::Kcp(k) => k.shutdown(session).await,
        }
    }
}
