// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    net::{self, TcpListener, TcpSocket},
    sync::oneshot,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{NetError, NetResult},
    server::server::ServerInner,
    session::SessionState,
};

/// Bind the listener, report the bound address, then accept until
/// cancelled. Runs on executor 0.
pub(crate) async fn run(
    inner: Arc<ServerInner>,
    host: String,
    port: u16,
    token: CancellationToken,
    ready: oneshot::Sender<NetResult<SocketAddr>>,
) {
    let listener = match bind(&host, port).await {
        Ok(l) => l,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        },
    };
    let local = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        },
    };
    let _ = ready.send(Ok(local));
    accept_loop(inner, listener, token).await;
}

async fn bind(host: &str, port: u16) -> NetResult<TcpListener> {
    let mut addrs = net::lookup_host((host, port)).await.map_err(NetError::from)?;
    let addr = addrs.next().ok_or(NetError::HostUnreachable)?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    listener: TcpListener,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer)) => {
                if matches!(
                    inner.state(),
                    SessionState::Stopping | SessionState::Stopped
                ) {
                    break;
                }
                debug!(%peer, "accepted connection");
                let session = inner.make_stream_session(stream, peer);
                session.spawn_start(false);
            },
            Err(e) => {
                // Transient resource errors (notably fd exhaustion):
                // pause, then resume without dropping existing sessions.
                warn!("accept failed: {e}; backing off");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(inner.cfg().accept_backoff()) => {},
                }
            },
        }
    }
    debug!("acceptor stopped");
}
