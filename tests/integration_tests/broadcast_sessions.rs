// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use nettide::{client::Client, server::Server};
use serial_test::serial;
use tokio::sync::mpsc;

use crate::integration_tests::common::take;

/// `broadcast` reaches every registered session; `find_session_if` and
/// the typed per-session user-data slot behave as documented.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn broadcast_reaches_every_session() -> Result<()> {
    const CLIENTS: usize = 3;

    let (joined_tx, mut joined_rx) = mpsc::unbounded_channel();
    let mut server = Server::tcp(2).context("server")?;
    server.on_connect(move |session, _| {
        session.set_user_data(format!("member-{}", session.id()));
        let _ = joined_tx.send(session.id());
    });
    server.start("127.0.0.1", 0).await.context("start")?;
    let port = server.listen_port();

    let (recv_tx, mut recv_rx) = mpsc::unbounded_channel();
    let mut client = Client::tcp(2).context("client")?;
    client.on_recv(move |session, data| {
        let _ = recv_tx.send((session.id(), data));
    });
    for _ in 0..CLIENTS {
        client.add("127.0.0.1", port).context("add")?;
    }

    let joined = take(&mut joined_rx, CLIENTS).await.context("joins")?;
    assert_eq!(server.session_count(), CLIENTS);

    server.broadcast(Bytes::from_static(b"assemble"));
    let received = take(&mut recv_rx, CLIENTS).await.context("broadcast")?;
    for (_, data) in &received {
        assert_eq!(data.as_ref(), b"assemble");
    }
    let distinct: std::collections::HashSet<u64> =
        received.iter().map(|(id, _)| *id).collect();
    assert_eq!(distinct.len(), CLIENTS, "a session was skipped");

    // Predicate lookup plus typed user-data access.
    let wanted = joined[0];
    let found = server
        .find_session_if(|s| s.id() == wanted)
        .context("find_session_if")?;
    let tag: Arc<String> = found.user_data().context("user data")?;
    assert_eq!(*tag, format!("member-{wanted}"));
    assert!(found.user_data::<u32>().is_none(), "type confusion");

    client.shutdown();
    server.shutdown();
    Ok(())
}
