// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use tokio::{sync::oneshot, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{NetError, NetResult},
    executor::Executor,
};

/// Shortest scheduling distance; late handlers are re-aimed at least this
/// far into the future instead of firing in a burst.
const MIN_DELAY_MS: u64 = 10;

/// One-shot and periodic timers bound to a single executor.
///
/// Periodic firings are drift-corrected: the n-th tick aims at
/// `base + n * interval`, so handler latency never accumulates beyond one
/// interval. A completion observed after `stop()` does nothing.
pub struct Timer {
    executor: Arc<Executor>,
    token: Mutex<CancellationToken>,
}

impl Timer {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            executor,
            token: Mutex::new(CancellationToken::new()),
        }
    }

    /// Replace the cancel token, detaching any armed timer.
    fn rearm(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = fresh.clone();
        fresh
    }

    /// Run `handler` on the bound executor every `interval_ms`
    /// milliseconds for as long as it returns true.
    pub fn post_timer<F>(&self, interval_ms: u64, mut handler: F)
    where F: FnMut() -> bool + Send + 'static {
        if interval_ms == 0 {
            return;
        }
        let token = self.rearm();
        self.executor.spawn(async move {
            let base = Instant::now();
            let mut tick: u64 = 0;
            loop {
                tick += 1;
                let target = (tick * interval_ms) as i64
                    - base.elapsed().as_millis() as i64;
                let wait = target.max(MIN_DELAY_MS as i64) as u64;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(Duration::from_millis(wait)) => {},
                }
                if token.is_cancelled() || !handler() {
                    break;
                }
            }
        });
    }

    /// Fire once after `duration`, then resolve the returned waiter with
    /// the completion outcome. The handler observes `Err(Aborted)` when
    /// the timer was cancelled first.
    pub fn post_timeout<F>(&self, duration: Duration, handler: F) -> TimeoutWaiter
    where F: FnOnce(NetResult<()>) + Send + 'static {
        let token = self.rearm();
        let (tx, rx) = oneshot::channel();
        self.executor.spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => Err(NetError::Aborted),
                _ = sleep(duration) => Ok(()),
            };
            handler(outcome.clone());
            let _ = tx.send(outcome);
        });
        TimeoutWaiter {
            executor: Arc::clone(&self.executor),
            rx,
        }
    }

    /// Cancel the armed timer; idempotent.
    pub fn stop(&self) {
        let token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Completion future of [`Timer::post_timeout`].
pub struct TimeoutWaiter {
    executor: Arc<Executor>,
    rx: oneshot::Receiver<NetResult<()>>,
}

impl TimeoutWaiter {
    /// Block until the timer resolves. Refuses to block on the timer's own
    /// executor thread (that would deadlock the strand); returns `None`
    /// there. Must not be called from async contexts; use [`Self::recv`].
    pub fn wait(self) -> Option<NetResult<()>> {
        if self.executor.is_current() {
            return None;
        }
        self.rx.blocking_recv().ok()
    }

    /// Await the timer outcome.
    pub async fn recv(self) -> Option<NetResult<()>> {
        self.rx.await.ok()
    }
}
