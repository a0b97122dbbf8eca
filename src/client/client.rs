// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    mem,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::{
    cfg::config::{Config, RuntimeConfig},
    client::connector,
    error::{NetError, NetResult},
    event::{Callbacks, DataHandler, InitHandler, SessionPtr, StatusHandler},
    executor::IoPool,
    proto::{Proto, ProtoKind},
    session::{
        Role, Session, SessionRegistry,
        session::{SessionArgs, SessionIo},
    },
    transport::{Overlay, OverlayKind, SocketKind, TlsContext, kcp::KcpOverlay,
        tls::TlsOverlay},
};

pub(crate) struct ClientInner {
    pub(crate) pool: Arc<IoPool>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) socket_kind: SocketKind,
    pub(crate) overlay_kind: OverlayKind,
    pub(crate) proto_kind: ProtoKind,
    pub(crate) tls: Arc<TlsContext>,
    pub(crate) cfg: Arc<Config>,
    pub(crate) callbacks: OnceCell<Arc<Callbacks>>,
    pub(crate) next_session_id: AtomicU64,
    pub(crate) reconnect: AtomicBool,
    pub(crate) stopped: AtomicBool,
}

impl ClientInner {
    pub(crate) fn reconnect_enabled(&self) -> bool {
        self.reconnect.load(Ordering::Relaxed)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    fn callbacks_arc(&self) -> Arc<Callbacks> {
        Arc::clone(
            self.callbacks
                .get_or_init(|| Arc::new(Callbacks::default())),
        )
    }

    fn overlay_for_session(&self) -> Overlay {
        match self.overlay_kind {
            OverlayKind::Binary => Overlay::Binary,
            OverlayKind::Tls => Overlay::Tls(TlsOverlay::new(Arc::clone(&self.tls))),
            OverlayKind::Kcp => Overlay::Kcp(Box::new(KcpOverlay::new())),
        }
    }
}

/// A multi-session client: call `add` once per parallel session.
pub struct Client {
    inner: Arc<ClientInner>,
    staged: Callbacks,
}

impl Client {
    pub fn tcp(concurrency: usize) -> NetResult<Self> {
        Self::build(
            concurrency_cfg(concurrency),
            SocketKind::Tcp,
            OverlayKind::Binary,
            ProtoKind::Raw,
        )
    }

    /// TLS over TCP; install trust anchors through [`Client::tls_context`]
    /// before `add`.
    pub fn tls(concurrency: usize) -> NetResult<Self> {
        Self::build(
            concurrency_cfg(concurrency),
            SocketKind::Tcp,
            OverlayKind::Tls,
            ProtoKind::Raw,
        )
    }

    pub fn udp(concurrency: usize) -> NetResult<Self> {
        Self::build(
            concurrency_cfg(concurrency),
            SocketKind::Udp,
            OverlayKind::Binary,
            ProtoKind::Raw,
        )
    }

    pub fn kcp(concurrency: usize) -> NetResult<Self> {
        Self::build(
            concurrency_cfg(concurrency),
            SocketKind::Udp,
            OverlayKind::Kcp,
            ProtoKind::Raw,
        )
    }

    pub fn with_kinds(
        cfg: Config,
        socket: SocketKind,
        overlay: OverlayKind,
        proto: ProtoKind,
    ) -> NetResult<Self> {
        Self::build(cfg, socket, overlay, proto)
    }

    fn build(
        cfg: Config,
        socket: SocketKind,
        overlay: OverlayKind,
        proto: ProtoKind,
    ) -> NetResult<Self> {
        let valid = match overlay {
            OverlayKind::Binary => true,
            OverlayKind::Tls => socket == SocketKind::Tcp,
            OverlayKind::Kcp => socket == SocketKind::Udp,
        };
        if !valid {
            return Err(NetError::InvalidArgument);
        }
        let pool = Arc::new(IoPool::new(cfg.runtime.concurrency));
        pool.start()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                pool,
                registry: Arc::new(SessionRegistry::new()),
                socket_kind: socket,
                overlay_kind: overlay,
                proto_kind: proto,
                tls: Arc::new(TlsContext::new()),
                cfg: Arc::new(cfg),
                callbacks: OnceCell::new(),
                next_session_id: AtomicU64::new(1),
                reconnect: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            staged: Callbacks::default(),
        })
    }

    // --- bind surface ---

    pub fn on_init<F>(&mut self, f: F) -> &mut Self
    where F: Fn() + Send + Sync + 'static {
        self.staged.init = Some(Box::new(f) as InitHandler);
        self
    }

    pub fn on_connect<F>(&mut self, f: F) -> &mut Self
    where F: Fn(&SessionPtr, Option<&NetError>) + Send + Sync + 'static {
        self.staged.connect = Some(Box::new(f) as StatusHandler);
        self
    }

    pub fn on_disconnect<F>(&mut self, f: F) -> &mut Self
    where F: Fn(&SessionPtr, Option<&NetError>) + Send + Sync + 'static {
        self.staged.disconnect = Some(Box::new(f) as StatusHandler);
        self
    }

    pub fn on_handshake<F>(&mut self, f: F) -> &mut Self
    where F: Fn(&SessionPtr, Option<&NetError>) + Send + Sync + 'static {
        self.staged.handshake = Some(Box::new(f) as StatusHandler);
        self
    }

    pub fn on_recv<F>(&mut self, f: F) -> &mut Self
    where F: Fn(&SessionPtr, Bytes) + Send + Sync + 'static {
        self.staged.recv = Some(Box::new(f) as DataHandler);
        self
    }

    pub fn on_packet<F>(&mut self, f: F) -> &mut Self
    where F: Fn(&SessionPtr, Bytes) + Send + Sync + 'static {
        self.staged.packet = Some(Box::new(f) as DataHandler);
        self
    }

    /// Re-dial a stopped session after the configured delay. Applies to
    /// sessions added after the call.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.reconnect.store(enabled, Ordering::Relaxed);
    }

    // --- lifecycle ---

    /// Open one session toward `host:port`. Resolution and connect run
    /// asynchronously on the session's executor under the connect
    /// timeout; progress surfaces through the bound events.
    pub fn add(&mut self, host: &str, port: u16) -> NetResult<SessionPtr> {
        if self.inner.is_stopped() {
            return Err(NetError::Aborted);
        }
        let _ = self
            .inner
            .callbacks
            .set(Arc::new(mem::take(&mut self.staged)));
        let callbacks = self.inner.callbacks_arc();
        callbacks.call_init();

        let session = Session::new(SessionArgs {
            id: self.inner.next_session_id.fetch_add(1, Ordering::Relaxed),
            role: Role::Client,
            executor: self.inner.pool.get(),
            registry: Arc::clone(&self.inner.registry),
            callbacks,
            cfg: Arc::clone(&self.inner.cfg),
            io: match self.inner.socket_kind {
                SocketKind::Tcp => SessionIo::stream(),
                SocketKind::Udp => SessionIo::udp(None, None, false),
            },
            overlay: self.inner.overlay_for_session(),
            proto: Proto::from_kind(self.inner.proto_kind),
        });
        session.set_remote_target(host, port);
        session.set_sni_host(host);
        session.set_keepalive(self.inner.cfg.net.keepalive);

        {
            let weak = Arc::downgrade(&self.inner);
            session.set_stopped_hook(Box::new(move |session, err| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.is_stopped() || !inner.reconnect_enabled() {
                    return;
                }
                debug!(id = session.id(), ?err, "scheduling reconnect");
                connector::schedule_reconnect(inner, Arc::clone(session));
            }));
        }

        if !session.claim_starting() {
            return Err(NetError::AlreadyStarted);
        }
        connector::spawn_connect(Arc::clone(&self.inner), Arc::clone(&session));
        Ok(session)
    }

    /// Stop every session and refuse further `add`s. Idempotent.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Relaxed);
        for session in self.inner.registry.snapshot() {
            session.stop(NetError::Aborted);
        }
    }

    /// Stop, then retire the executor pool (joins the I/O threads; call
    /// from outside the pool).
    pub fn shutdown(&self) {
        self.stop();
        self.inner.pool.stop();
    }

    // --- session access ---

    /// Apply `send` to every connected session.
    pub fn broadcast<B: Into<Bytes>>(&self, data: B) {
        let data: Bytes = data.into();
        self.inner.registry.for_each(|session| {
            let _ = session.send(data.clone());
        });
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn find_session_if<F>(&self, pred: F) -> Option<SessionPtr>
    where F: FnMut(&SessionPtr) -> bool {
        self.inner.registry.find_if(pred)
    }

    pub fn tls_context(&self) -> Arc<TlsContext> {
        Arc::clone(&self.inner.tls)
    }

    pub fn io_pool(&self) -> Arc<IoPool> {
        Arc::clone(&self.inner.pool)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn concurrency_cfg(concurrency: usize) -> Config {
    Config {
        runtime: RuntimeConfig {
            concurrency,
            ..RuntimeConfig::default()
        },
        ..Config::default()
    }
}
