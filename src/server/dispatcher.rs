// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::{Arc, PoisonError},
};

use bytes::Bytes;
use tokio::{
    net::{self, UdpSocket},
    sync::oneshot,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{NetError, NetResult},
    server::server::ServerInner,
    session::{SessionKey, SessionState},
};

/// Bind the shared UDP socket, report the bound address, then
/// demultiplex inbound datagrams by peer endpoint. Runs on executor 0;
/// only this loop ever reads the socket.
pub(crate) async fn run(
    inner: Arc<ServerInner>,
    host: String,
    port: u16,
    token: CancellationToken,
    ready: oneshot::Sender<NetResult<SocketAddr>>,
) {
    let socket = match bind(&host, port).await {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        },
    };
    let local = match socket.local_addr() {
        Ok(a) => a,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        },
    };
    let socket = Arc::new(socket);
    {
        *inner
            .udp_socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&socket));
    }
    let _ = ready.send(Ok(local));
    recv_loop(inner, socket, token).await;
}

async fn bind(host: &str, port: u16) -> NetResult<UdpSocket> {
    let mut addrs = net::lookup_host((host, port)).await.map_err(NetError::from)?;
    let addr = addrs.next().ok_or(NetError::HostUnreachable)?;
    Ok(UdpSocket::bind(addr).await?)
}

async fn recv_loop(
    inner: Arc<ServerInner>,
    socket: Arc<UdpSocket>,
    token: CancellationToken,
) {
    let mut scratch = vec![0u8; inner.cfg().runtime.datagram_buffer_size];
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            res = socket.recv_from(&mut scratch) => res,
        };
        match received {
            Ok((n, peer)) => {
                if matches!(
                    inner.state(),
                    SessionState::Stopping | SessionState::Stopped
                ) {
                    break;
                }
                let data = Bytes::copy_from_slice(&scratch[..n]);
                match inner.registry.get(&SessionKey::Peer(peer)) {
                    Some(session) => session.push_inbound(data),
                    None => {
                        // Unknown endpoint: mint a session and let its
                        // start path surface the datagram (KCP reads it
                        // as the SYN, binary as the first message).
                        debug!(%peer, "new udp endpoint");
                        let session = inner.make_udp_session(peer);
                        session.set_first_packet(data);
                        session.spawn_start(false);
                    },
                }
            },
            Err(e) => {
                warn!("udp recv failed: {e}; backing off");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(inner.cfg().accept_backoff()) => {},
                }
            },
        }
    }
    debug!("dispatcher stopped");
}
