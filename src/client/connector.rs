// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc};

use tokio::net::{self, TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::{
    client::client::ClientInner,
    error::{NetError, NetResult},
    event::SessionPtr,
    transport::SocketKind,
};

/// Resolve, connect and hand the socket to the session, all on the
/// session's executor. The session already claimed `Stopped -> Starting`.
pub(crate) fn spawn_connect(inner: Arc<ClientInner>, session: SessionPtr) {
    let executor = Arc::clone(session.executor());
    executor.spawn(async move {
        run_connect(inner, session).await;
    });
}

/// One connect attempt under the connect timeout. The timer races the
/// whole resolve+connect sequence; losing it fails the attempt with
/// `TimedOut`.
pub(crate) async fn run_connect(inner: Arc<ClientInner>, session: SessionPtr) {
    let Some((host, port)) = session.remote_target() else {
        session.stop(NetError::InvalidArgument);
        return;
    };
    let budget = session.cfg().connect_timeout();
    let outcome =
        match tokio::time::timeout(budget, dial(&inner, &session, &host, port)).await
        {
            Ok(r) => r,
            Err(_) => Err(NetError::TimedOut),
        };
    match outcome {
        Ok(()) => session.spawn_start(true),
        Err(e) => {
            warn!(id = session.id(), host, port, "connect failed: {e}");
            session.stop(e);
        },
    }
}

async fn dial(
    inner: &Arc<ClientInner>,
    session: &SessionPtr,
    host: &str,
    port: u16,
) -> NetResult<()> {
    match inner.socket_kind {
        SocketKind::Tcp => {
            let addrs: Vec<SocketAddr> = net::lookup_host((host, port))
                .await
                .map_err(NetError::from)?
                .collect();
            if addrs.is_empty() {
                return Err(NetError::HostUnreachable);
            }
            // Endpoints in resolver order; the first that connects wins.
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        session.install_stream(stream, Some(addr));
                        return Ok(());
                    },
                    Err(e) => {
                        let err: NetError = e.into();
                        if err.is_aborted() {
                            return Err(err);
                        }
                        debug!(%addr, "endpoint failed: {err}");
                    },
                }
            }
            Err(NetError::HostUnreachable)
        },
        SocketKind::Udp => {
            let addr = net::lookup_host((host, port))
                .await
                .map_err(NetError::from)?
                .next()
                .ok_or(NetError::HostUnreachable)?;
            let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(addr).await?;
            session.install_udp(Arc::new(socket), addr);
            Ok(())
        },
    }
}

/// Re-dial a stopped session after the configured delay (client opt-in).
pub(crate) fn schedule_reconnect(inner: Arc<ClientInner>, session: SessionPtr) {
    let delay = session.cfg().reconnect_delay();
    let executor = Arc::clone(session.executor());
    executor.spawn(async move {
        tokio::time::sleep(delay).await;
        if inner.is_stopped() || !inner.reconnect_enabled() {
            return;
        }
        if !session.claim_starting() {
            return;
        }
        debug!(id = session.id(), "reconnecting");
        run_connect(inner, session).await;
    });
}
