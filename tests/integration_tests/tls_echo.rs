// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use bytes::Bytes;
use nettide::{client::Client, server::Server};
use rcgen::CertifiedKey;
use serial_test::serial;
use tokio::sync::mpsc;

use crate::integration_tests::common::next;

fn self_signed() -> Result<(String, String)> {
    let CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .context("generate certificate")?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// TLS handshake (both sides observe the `handshake` event without an
/// error) followed by an echo over the encrypted stream.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn handshake_then_echo() -> Result<()> {
    let (cert_pem, key_pem) = self_signed()?;

    let (hs_tx, mut hs_rx) = mpsc::unbounded_channel();
    let mut server = Server::tls(2).context("server")?;
    server
        .tls_context()
        .set_cert("", &cert_pem, &key_pem, "")
        .context("server cert")?;
    server.on_handshake(move |_, ec| {
        let _ = hs_tx.send(ec.cloned());
    });
    server.on_recv(|session, data| {
        let _ = session.send(data);
    });
    server.start("127.0.0.1", 0).await.context("start")?;
    let port = server.listen_port();

    let (client_hs_tx, mut client_hs_rx) = mpsc::unbounded_channel();
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let mut client = Client::tls(2).context("client")?;
    client.tls_context().set_ca(&cert_pem).context("trust")?;
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

    // handshake fires first, then connect, then the echo arrives.
    ensure!(
        next(&mut client_hs_rx).await.context("client handshake")?.is_none(),
        "client handshake failed"
    );
    let session = next(&mut conn_rx).await.context("connect")?;
    ensure!(
        next(&mut hs_rx).await.context("server handshake")?.is_none(),
        "server handshake failed"
    );

    session.send(Bytes::from_static(b"hello")).context("send")?;
    let reply = next(&mut reply_rx).await.context("echo")?;
    assert_eq!(reply.as_ref(), b"hello");

    client.shutdown();
    server.shutdown();
    Ok(())
}

/// A client with no trust anchors for the server certificate must fail
/// the handshake and never reach `connect`.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn untrusted_certificate_is_rejected() -> Result<()> {
    let (cert_pem, key_pem) = self_signed()?;
    // A different certificate in the client trust store.
    let (other_cert, _) = self_signed()?;

    let mut server = Server::tls(2).context("server")?;
    server
        .tls_context()
        .set_cert("", &cert_pem, &key_pem, "")
        .context("server cert")?;
    server.start("127.0.0.1", 0).await.context("start")?;
    let port = server.listen_port();

    let (client_hs_tx, mut client_hs_rx) = mpsc::unbounded_channel();
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let mut client = Client::tls(2).context("client")?;
    client.tls_context().set_ca(&other_cert).context("trust")?;
    client.on_handshake(move |_, ec| {
        let _ = client_hs_tx.send(ec.cloned());
    });
    client.on_connect(move |_, ec| {
        if ec.is_none() {
            let _ = conn_tx.send(());
        }
    });
    client.add("127.0.0.1", port).context("add")?;

    let outcome = next(&mut client_hs_rx).await.context("handshake event")?;
    ensure!(outcome.is_some(), "handshake unexpectedly succeeded");
    crate::integration_tests::common::expect_silence(
        &mut conn_rx,
        std::time::Duration::from_millis(300),
    )
    .await?;

    client.shutdown();
    server.shutdown();
    Ok(())
}
