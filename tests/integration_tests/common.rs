// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::{sync::mpsc, time::timeout};

pub const WAIT: Duration = Duration::from_secs(10);

/// Await the next event with the shared test deadline.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Result<T> {
    timeout(WAIT, rx.recv())
        .await
        .context("timed out waiting for event")?
        .context("event channel closed")
}

/// Await exactly `n` events.
pub async fn take<T>(rx: &mut mpsc::UnboundedReceiver<T>, n: usize) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(next(rx).await?);
    }
    Ok(out)
}

/// Assert no further event arrives within `quiet`.
pub async fn expect_silence<T: std::fmt::Debug>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    quiet: Duration,
) -> Result<()> {
    match timeout(quiet, rx.recv()).await {
        Err(_) => Ok(()),
        Ok(Some(ev)) => bail!("unexpected event: {ev:?}"),
        Ok(None) => Ok(()),
    }
}
