// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, Result, ensure};
use bytes::Bytes;
use nettide::{client::Client, server::Server, session::SessionState};
use serial_test::serial;
use tokio::sync::mpsc;

use crate::integration_tests::common::{expect_silence, next, take};

/// Echo server, a squad of clients each bouncing one message; every
/// session must make progress and none may wedge in `Stopping`.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn echo_squad_makes_progress() -> Result<()> {
    const CLIENTS: usize = 8;
    const ROUNDTRIPS: usize = 25;

    let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
    let mut server = Server::tcp(2).context("server")?;
    server.on_connect(move |session, _| {
        let _ = accept_tx.send(session.id());
    });
    server.on_recv(|session, data| {
        let _ = session.send(data);
    });
    server.start("127.0.0.1", 0).await.context("start")?;
    let port = server.listen_port();
    ensure!(port != 0, "listener reported no port");

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let counted = Arc::new(AtomicUsize::new(0));

    let mut client = Client::tcp(2).context("client")?;
    client.on_connect(|session, ec| {
        if ec.is_none() {
            let _ = session.send(Bytes::from_static(b"a"));
        }
    });
    {
        let counted = Arc::clone(&counted);
        client.on_recv(move |session, data| {
            let n = counted.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= CLIENTS * ROUNDTRIPS {
                let _ = session.send(data);
            }
            if n == CLIENTS * ROUNDTRIPS {
                let _ = done_tx.send(());
            }
        });
    }
    for _ in 0..CLIENTS {
        client.add("127.0.0.1", port).context("add")?;
    }

    take(&mut accept_rx, CLIENTS).await.context("accepts")?;
    next(&mut done_rx).await.context("echo progress")?;
    assert_eq!(server.session_count(), CLIENTS);
    assert_eq!(client.session_count(), CLIENTS);
    server.for_each_session(|s| {
        assert_ne!(s.state(), SessionState::Stopping);
    });

    client.shutdown();
    server.shutdown();
    Ok(())
}

/// Sends issued in sequence from several producers arrive in exactly
/// that sequence: the send queue serializes them regardless of thread.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn send_order_is_fifo() -> Result<()> {
    const MESSAGES: u32 = 500;

    let (recv_tx, mut recv_rx) = mpsc::unbounded_channel();
    let mut server = Server::tcp(2).context("server")?;
    server.on_recv(move |_, data| {
        let _ = recv_tx.send(data);
    });
    server.start("127.0.0.1", 0).await.context("start")?;
    let port = server.listen_port();

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let mut client = Client::tcp(1).context("client")?;
    client.on_connect(move |session, ec| {
        if ec.is_none() {
            let _ = conn_tx.send(Arc::clone(session));
        }
    });
    client.add("127.0.0.1", port).context("add")?;
    let session = next(&mut conn_rx).await.context("connect")?;

    // Two producer threads, each with its own ordered stream.
    let s1 = Arc::clone(&session);
    let t1 = std::thread::spawn(move || {
        for i in 0..MESSAGES {
            let mut payload = vec![b'x'];
            payload.extend_from_slice(&i.to_be_bytes());
            s1.send(payload).expect("send x");
        }
    });
    let s2 = Arc::clone(&session);
    let t2 = std::thread::spawn(move || {
        for i in 0..MESSAGES {
            let mut payload = vec![b'y'];
            payload.extend_from_slice(&i.to_be_bytes());
            s2.send(payload).expect("send y");
        }
    });
    t1.join().expect("producer x");
    t2.join().expect("producer y");

    // TCP may refragment; reassemble the byte stream, then check each
    // producer's sequence numbers are strictly increasing.
    let mut stream = Vec::new();
    while stream.len() < (MESSAGES as usize) * 2 * 5 {
        let chunk = next(&mut recv_rx).await.context("echo chunk")?;
        stream.extend_from_slice(&chunk);
    }
    let mut expect_x = 0u32;
    let mut expect_y = 0u32;
    for record in stream.chunks_exact(5) {
        let seq = u32::from_be_bytes([record[1], record[2], record[3], record[4]]);
        match record[0] {
            b'x' => {
                assert_eq!(seq, expect_x, "x stream reordered");
                expect_x += 1;
            },
            b'y' => {
                assert_eq!(seq, expect_y, "y stream reordered");
                expect_y += 1;
            },
            other => panic!("corrupt record tag {other}"),
        }
    }
    assert_eq!(expect_x, MESSAGES);
    assert_eq!(expect_y, MESSAGES);

    client.shutdown();
    server.shutdown();
    Ok(())
}

/// `disconnect` fires exactly once per connected session, and repeated
/// stops are no-ops. Empty or pre-connect sends fail without stopping
/// anything.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn disconnect_fires_exactly_once() -> Result<()> {
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
    let mut server = Server::tcp(2).context("server")?;
    server.on_disconnect(move |session, _| {
        let _ = disc_tx.send(session.id());
    });
    server.start("127.0.0.1", 0).await.context("start")?;
    let port = server.listen_port();

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let mut client = Client::tcp(1).context("client")?;
    client.on_connect(move |session, ec| {
        if ec.is_none() {
            let _ = conn_tx.send(Arc::clone(session));
        }
    });
    let pending = client.add("127.0.0.1", port).context("add")?;

    // User errors are synchronous and do not stop the session.
    assert!(pending.send(Bytes::new()).is_err());

    let session = next(&mut conn_rx).await.context("connect")?;
    assert!(session.send(Bytes::new()).is_err());
    assert!(session.is_started());

    // Stop the server-side session twice; one disconnect must surface.
    let server_side = server
        .find_session_if(|_| true)
        .context("server session missing")?;
    server_side.stop(nettide::error::NetError::Eof);
    server_side.stop(nettide::error::NetError::Eof);

    let id = next(&mut disc_rx).await.context("disconnect")?;
    assert_eq!(id, server_side.id());
    expect_silence(&mut disc_rx, std::time::Duration::from_millis(300)).await?;

    client.shutdown();
    server.shutdown();
    Ok(())
}
