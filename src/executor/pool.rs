// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use tokio::runtime;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

use crate::error::{NetError, NetResult};

/// The live half of an executor; absent while the executor is stopped.
struct ExecutorCore {
    handle: runtime::Handle,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    thread: thread::ThreadId,
}

/// A single-threaded event loop.
///
/// One OS thread runs a current-thread tokio runtime; everything spawned
/// here executes on that thread, which makes the executor a FIFO
/// serialization domain (a strand). Sessions are pinned to exactly one
/// executor, so their completions never run concurrently.
pub struct Executor {
    index: usize,
    core: RwLock<Option<ExecutorCore>>,
}

impl Executor {
    fn new(index: usize) -> Self {
        Self {
            index,
            core: RwLock::new(None),
        }
    }

    /// Spin up the runtime thread. The thread stays alive until the
    /// shutdown token fires and every tracked task has finished.
    fn start(&self) -> NetResult<thread::JoinHandle<()>> {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(NetError::from)?;
        let handle = rt.handle().clone();
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let drain_tracker = tracker.clone();
        let drain_token = shutdown.clone();
        let join = thread::Builder::new()
            .name(format!("nettide-io-{}", self.index))
            .spawn(move || {
                rt.block_on(async move {
                    drain_token.cancelled().await;
                    drain_tracker.close();
                    drain_tracker.wait().await;
                });
            })
            .map_err(NetError::from)?;

        let mut core = self
            .core
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *core = Some(ExecutorCore {
            handle,
            tracker,
            shutdown,
            thread: join.thread().id(),
        });
        Ok(join)
    }

    /// Spawn a tracked task onto this executor.
    ///
    /// Accepted while the runtime drains so teardown chains (session
    /// cleanup spawned from a draining executor) still run; silently
    /// dropped once the executor is fully stopped.
    pub fn spawn<F>(&self, fut: F)
    where F: Future<Output = ()> + Send + 'static {
        let core = self.core.read().unwrap_or_else(PoisonError::into_inner);
        match core.as_ref() {
            Some(c) => {
                c.tracker.spawn_on(fut, &c.handle);
            },
            None => debug!(index = self.index, "spawn on stopped executor ignored"),
        }
    }

    /// Whether the calling thread is this executor's thread.
    pub fn is_current(&self) -> bool {
        let core = self.core.read().unwrap_or_else(PoisonError::into_inner);
        core.as_ref()
            .is_some_and(|c| c.thread == thread::current().id())
    }

    fn release(&self) {
        let core = self.core.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = core.as_ref() {
            c.shutdown.cancel();
        }
    }

    fn clear(&self) {
        let mut core = self.core.write().unwrap_or_else(PoisonError::into_inner);
        *core = None;
    }
}

/// A fixed-size pool of executors.
///
/// `get()` hands out executors round-robin; index 0 is reserved by
/// convention for listen/dispatch duty so `stop()` can retire it before
/// the executors still finishing session work.
pub struct IoPool {
    executors: Vec<Arc<Executor>>,
    next: AtomicUsize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

fn default_concurrency() -> usize {
    thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(2)
}

impl IoPool {
    /// `concurrency == 0` selects 2x hardware concurrency.
    pub fn new(concurrency: usize) -> Self {
        let n = if concurrency == 0 {
            default_concurrency()
        } else {
            concurrency
        };
        Self {
            executors: (0..n).map(|i| Arc::new(Executor::new(i))).collect(),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.executors.len()
    }

    /// Start (or restart) every executor. Returns false when already
    /// running.
    pub fn start(&self) -> NetResult<bool> {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if !threads.is_empty() {
            return Ok(false);
        }
        for executor in &self.executors {
            threads.push(executor.start()?);
        }
        debug!(executors = self.executors.len(), "io pool started");
        Ok(true)
    }

    /// Stop every executor and join its thread.
    ///
    /// Executor 0 is retired first: the acceptor/dispatcher bound to it
    /// stops minting sessions before the remaining executors drain the
    /// completions still in flight. Calling from a pool thread is a no-op;
    /// tear down from an external thread.
    pub fn stop(&self) {
        if self.running_in_pool_threads() {
            warn!("IoPool::stop called from a pool thread; ignored");
            return;
        }
        let handles: Vec<thread::JoinHandle<()>> = {
            let mut threads =
                self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            threads.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        for (executor, handle) in self.executors.iter().zip(handles) {
            executor.release();
            if handle.join().is_err() {
                warn!(index = executor.index, "executor thread panicked");
            }
            executor.clear();
        }
        debug!("io pool stopped");
    }

    /// Round-robin executor selection.
    pub fn get(&self) -> Arc<Executor> {
        let i = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        Arc::clone(&self.executors[i % self.executors.len()])
    }

    /// A specific executor; out-of-range indices wrap.
    pub fn get_at(&self, index: usize) -> Arc<Executor> {
        Arc::clone(&self.executors[index % self.executors.len()])
    }

    pub fn running_in_pool_threads(&self) -> bool {
        self.executors.iter().any(|e| e.is_current())
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.stop();
    }
}
