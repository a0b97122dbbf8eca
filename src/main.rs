// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, Result};
use nettide::{
    cfg::logger::init_logger, client::Client, executor::Timer, server::Server,
};
use tracing::info;

/// Echo benchmark in the shape of the classic demo: one server, a squad
/// of clients each bouncing "a" back and forth, and a timer printing the
/// aggregate message rate every ten seconds.
#[tokio::main]
async fn main() -> Result<()> {
    let _logger = init_logger("demos/config_logger.yaml").ok();

    let mut server = Server::tcp(8).context("server pool")?;
    let count = Arc::new(AtomicUsize::new(0));

    server.on_connect(|session, _| {
        info!(id = session.id(), "server: session connected");
    });
    server.on_disconnect(|session, _| {
        info!(id = session.id(), "server: session disconnected");
    });
    {
        let count = Arc::clone(&count);
        server.on_recv(move |session, data| {
            count.fetch_add(1, Ordering::Relaxed);
            let _ = session.send(data);
        });
    }
    server.start("0.0.0.0", 8888).await.context("server start")?;

    let rate_timer = Timer::new(server.io_pool().get_at(0));
    {
        let count = Arc::clone(&count);
        rate_timer.post_timer(10_000, move || {
            let total = count.swap(0, Ordering::Relaxed);
            info!(rate = total / 10, "messages per second");
            true
        });
    }

    let mut client = Client::tcp(4).context("client pool")?;
    client.on_connect(|session, ec| {
        if ec.is_none() {
            let _ = session.send(&b"a"[..]);
        }
    });
    client.on_recv(|session, data| {
        let _ = session.send(data);
    });
    for _ in 0..42 {
        client.add("127.0.0.1", 8888).context("client add")?;
    }

    tokio::signal::ctrl_c().await.context("ctrl-c")?;
    info!("shutting down");
    client.shutdown();
    server.shutdown();
    Ok(())
}
