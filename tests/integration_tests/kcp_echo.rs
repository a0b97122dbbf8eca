// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use bytes::Bytes;
use nettide::{client::Client, error::NetError, server::Server};
use serial_test::serial;
use tokio::sync::mpsc;

use crate::integration_tests::common::{next, take};

/// Conversation setup (SYN / SYN-ACK), echo of a small payload, and
/// message-boundary preservation across a batch of sends.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn handshake_then_reliable_echo() -> Result<()> {
    const BATCH: usize = 50;

    let (hs_tx, mut hs_rx) = mpsc::unbounded_channel();
    let mut server = Server::kcp(2).context("server")?;
    server.on_handshake(move |_, ec| {
        let _ = hs_tx.send(ec.cloned());
    });
    server.on_recv(|session, data| {
        let _ = session.send(data);
    });
    server.start("127.0.0.1", 0).await.context("start")?;
    let port = server.listen_port();

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let (client_hs_tx, mut client_hs_rx) = mpsc::unbounded_channel();
    let mut client = Client::kcp(2).context("client")?;
    client.on_handshake(move |_, ec| {
        let _ = client_hs_tx.send(ec.cloned());
    });
    client.on_connect(move |session, ec| {
        if ec.is_none() {
            let _ = conn_tx.send(Arc::clone(session));
        }
    });
    client.on_recv(move |_, data| {
        let _ = reply_tx.send(data);
    });
    client.add("127.0.0.1", port).context("add")?;

    ensure!(
        next(&mut client_hs_rx).await.context("client handshake")?.is_none(),
        "client handshake failed"
    );
    let session = next(&mut conn_rx).await.context("connect")?;

    // A small payload survives the round trip.
    session.send(Bytes::from_static(b"ping")).context("send")?;
    let first = next(&mut reply_rx).await.context("first reply")?;
    assert_eq!(first.as_ref(), b"ping");

    // The server-side handshake observed the SYN and reported success.
    ensure!(
        next(&mut hs_rx).await.context("server handshake")?.is_none(),
        "server handshake failed"
    );

    // N messages arrive as N messages with identical payloads, in order.
    for i in 0..BATCH {
        let payload = vec![i as u8; i + 1];
        session.send(payload).context("batch send")?;
    }
    let replies = take(&mut reply_rx, BATCH).await.context("batch replies")?;
    for (i, reply) in replies.iter().enumerate() {
        assert_eq!(reply.len(), i + 1, "message {i} boundary lost");
        assert!(reply.iter().all(|b| *b == i as u8), "message {i} corrupted");
    }

    client.shutdown();
    server.shutdown();
    Ok(())
}

/// Client-initiated close: the server observes the FIN, marks the
/// session stopped and does not reply with its own FIN.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn fin_tears_down_server_session() -> Result<()> {
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
    let mut server = Server::kcp(2).context("server")?;
    server.on_recv(|session, data| {
        let _ = session.send(data);
    });
    server.on_disconnect(move |_, ec| {
        let _ = disc_tx.send(ec.cloned());
    });
    server.start("127.0.0.1", 0).await.context("start")?;
    let port = server.listen_port();

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let (client_disc_tx, mut client_disc_rx) = mpsc::unbounded_channel();
    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel();
    let mut client = Client::kcp(2).context("client")?;
    client.on_connect(move |session, ec| {
        if ec.is_none() {
            let _ = conn_tx.send(Arc::clone(session));
        }
    });
    client.on_recv(move |_, data| {
        let _ = echo_tx.send(data);
    });
    client.on_disconnect(move |_, _| {
        let _ = client_disc_tx.send(());
    });
    client.add("127.0.0.1", port).context("add")?;
    let session = next(&mut conn_rx).await.context("connect")?;

    // Round-trip once so the server session is fully registered.
    session.send(Bytes::from_static(b"warm")).context("send")?;
    let warm = next(&mut echo_rx).await.context("warm echo")?;
    assert_eq!(warm.as_ref(), b"warm");

    session.stop(NetError::Aborted);
    next(&mut client_disc_rx).await.context("client disconnect")?;

    let cause = next(&mut disc_rx).await.context("server disconnect")?;
    assert_eq!(cause, Some(NetError::Eof));
    assert_eq!(server.session_count(), 0);

    client.shutdown();
    server.shutdown();
    Ok(())
}
