// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use nettide::{client::Client, server::Server};
use serial_test::serial;
use tokio::sync::mpsc;

use crate::integration_tests::common::take;

/// Every datagram lands on the session keyed by its source endpoint, and
/// the datagram that creates a session is delivered as its first message.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn datagrams_demultiplex_by_endpoint() -> Result<()> {
    const PEERS: usize = 3;

    let (recv_tx, mut recv_rx) = mpsc::unbounded_channel();
    let mut server = Server::udp(2).context("server")?;
    server.on_recv(move |session, data| {
        let _ = recv_tx.send((session.id(), data.clone()));
        let _ = session.send(data);
    });
    server.start("127.0.0.1", 0).await.context("start")?;
    let port = server.listen_port();

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let mut client = Client::udp(2).context("client")?;
    client.on_connect(move |session, ec| {
        if ec.is_none() {
            let _ = conn_tx.send(Arc::clone(session));
        }
    });
    client.on_recv(move |session, data| {
        let _ = reply_tx.send((session.id(), data));
    });

    for _ in 0..PEERS {
        client.add("127.0.0.1", port).context("add")?;
    }
    let connected = take(&mut conn_rx, PEERS).await.context("connects")?;
    for session in &connected {
        let tag = format!("peer-{}", session.id());
        session.send(Bytes::from(tag)).context("send")?;
    }

    // The server sees one session per source endpoint, each delivering
    // the first (and only) datagram of that peer.
    let inbound = take(&mut recv_rx, PEERS).await.context("server recv")?;
    let server_ids: HashSet<u64> = inbound.iter().map(|(id, _)| *id).collect();
    assert_eq!(server_ids.len(), PEERS, "sessions collapsed across peers");
    assert_eq!(server.session_count(), PEERS);

    // Each client session gets its own tag echoed back, nobody else's.
    let replies = take(&mut reply_rx, PEERS).await.context("replies")?;
    for (id, data) in replies {
        let tag = String::from_utf8_lossy(&data);
        assert_eq!(tag, format!("peer-{id}"));
    }

    client.shutdown();
    server.shutdown();
    Ok(())
}
