// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    mem,
    net::SocketAddr,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use once_cell::sync::OnceCell;
use tokio::{
    net::{TcpStream, UdpSocket},
    sync::oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cfg::config::{Config, RuntimeConfig},
    error::{NetError, NetResult},
    event::{Callbacks, DataHandler, InitHandler, SessionPtr, StatusHandler},
    executor::IoPool,
    proto::{Proto, ProtoKind},
    server::{acceptor, dispatcher},
    session::{
        Role, Session, SessionRegistry, SessionState,
        session::{SessionArgs, SessionIo},
        state::StateCell,
    },
    transport::{Overlay, OverlayKind, SocketKind, TlsContext, kcp::KcpOverlay,
        tls::TlsOverlay},
};

pub(crate) struct ServerInner {
    pub(crate) pool: Arc<IoPool>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) state: StateCell,
    pub(crate) socket_kind: SocketKind,
    pub(crate) overlay_kind: OverlayKind,
    pub(crate) proto_kind: ProtoKind,
    pub(crate) tls: Arc<TlsContext>,
    pub(crate) cfg: Arc<Config>,
    pub(crate) callbacks: OnceCell<Arc<Callbacks>>,
    pub(crate) stop_token: StdMutex<CancellationToken>,
    pub(crate) listen_addr: StdMutex<Option<SocketAddr>>,
    pub(crate) next_session_id: AtomicU64,
    pub(crate) udp_socket: StdMutex<Option<Arc<UdpSocket>>>,
}

impl ServerInner {
    pub(crate) fn state(&self) -> SessionState {
        self.state.load()
    }

    pub(crate) fn cfg(&self) -> &Config {
        &self.cfg
    }

    fn callbacks_arc(&self) -> Arc<Callbacks> {
        Arc::clone(
            self.callbacks
                .get_or_init(|| Arc::new(Callbacks::default())),
        )
    }

    fn token(&self) -> CancellationToken {
        self.stop_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn overlay_for_session(&self) -> Overlay {
        match self.overlay_kind {
            OverlayKind::Binary => Overlay::Binary,
            OverlayKind::Tls => Overlay::Tls(TlsOverlay::new(Arc::clone(&self.tls))),
            OverlayKind::Kcp => Overlay::Kcp(Box::new(KcpOverlay::new())),
        }
    }

    /// Mint a stream session; the executor comes from pool round-robin.
    pub(crate) fn make_stream_session(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Arc<Session> {
        let session = Session::new(SessionArgs {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            role: Role::Server,
            executor: self.pool.get(),
            registry: Arc::clone(&self.registry),
            callbacks: self.callbacks_arc(),
            cfg: Arc::clone(&self.cfg),
            io: SessionIo::stream(),
            overlay: self.overlay_for_session(),
            proto: Proto::from_kind(self.proto_kind),
        });
        session.install_stream(stream, Some(peer));
        session.set_keepalive(self.cfg.net.keepalive);
        session
    }

    /// Mint a datagram session keyed by the peer endpoint, sharing the
    /// dispatcher's socket.
    pub(crate) fn make_udp_session(self: &Arc<Self>, peer: SocketAddr) -> Arc<Session> {
        let socket = self
            .udp_socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Session::new(SessionArgs {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            role: Role::Server,
            executor: self.pool.get(),
            registry: Arc::clone(&self.registry),
            callbacks: self.callbacks_arc(),
            cfg: Arc::clone(&self.cfg),
            io: SessionIo::udp(socket, Some(peer), true),
            overlay: self.overlay_for_session(),
            proto: Proto::from_kind(self.proto_kind),
        })
    }

    fn stop_with(self: &Arc<Self>, err: NetError) {
        if self.state.begin_stop().is_none() {
            return;
        }
        let inner = Arc::clone(self);
        self.pool.get_at(0).spawn(async move {
            for session in inner.registry.snapshot() {
                session.stop(err.clone());
            }
            inner.token().cancel();
            *inner
                .udp_socket
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = None;
            *inner
                .listen_addr
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = None;
            inner
                .state
                .transition(SessionState::Stopping, SessionState::Stopped);
            debug!("server stopped");
        });
    }
}

/// A multi-session server over one transport/overlay/protocol
/// combination.
///
/// Owns the executor pool, the acceptor or datagram dispatcher, the
/// session registry and the callback table. Construct, `on_*` to bind
/// handlers, then `start`.
pub struct Server {
    inner: Arc<ServerInner>,
    staged: Callbacks,
}

impl Server {
    /// Plain TCP, raw frames.
    pub fn tcp(concurrency: usize) -> NetResult<Self> {
        Self::build(
            concurrency_cfg(concurrency),
            SocketKind::Tcp,
            OverlayKind::Binary,
            ProtoKind::Raw,
        )
    }

    /// TLS over TCP, raw frames. Configure [`Server::tls_context`] before
    /// `start`.
    pub fn tls(concurrency: usize) -> NetResult<Self> {
        Self::build(
            concurrency_cfg(concurrency),
            SocketKind::Tcp,
            OverlayKind::Tls,
            ProtoKind::Raw,
        )
    }

    /// Plain UDP, one session per peer endpoint.
    pub fn udp(concurrency: usize) -> NetResult<Self> {
        Self::build(
            concurrency_cfg(concurrency),
            SocketKind::Udp,
            OverlayKind::Binary,
            ProtoKind::Raw,
        )
    }

    /// Reliable UDP (KCP overlay).
    pub fn kcp(concurrency: usize) -> NetResult<Self> {
        Self::build(
            concurrency_cfg(concurrency),
            SocketKind::Udp,
            OverlayKind::Kcp,
            ProtoKind::Raw,
        )
    }

    /// WebSocket over plain TCP.
    pub fn websocket(concurrency: usize) -> NetResult<Self> {
        Self::build(
            concurrency_cfg(concurrency),
            SocketKind::Tcp,
            OverlayKind::Binary,
            ProtoKind::WebSocket,
        )
    }

    /// WebSocket over TLS.
    pub fn websocket_tls(concurrency: usize) -> NetResult<Self> {
        Self::build(
            concurrency_cfg(concurrency),
            SocketKind::Tcp,
            OverlayKind::Tls,
            ProtoKind::WebSocket,
        )
    }

    /// Arbitrary combination with an explicit config. TLS and WebSocket
    /// require TCP; KCP requires UDP.
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
        validate_kinds(socket, overlay, proto)?;
        let pool = Arc::new(IoPool::new(cfg.runtime.concurrency));
        pool.start()?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                pool,
                registry: Arc::new(SessionRegistry::new()),
                state: StateCell::new(),
                socket_kind: socket,
                overlay_kind: overlay,
                proto_kind: proto,
                tls: Arc::new(TlsContext::new()),
                cfg: Arc::new(cfg),
                callbacks: OnceCell::new(),
                stop_token: StdMutex::new(CancellationToken::new()),
                listen_addr: StdMutex::new(None),
                next_session_id: AtomicU64::new(1),
                udp_socket: StdMutex::new(None),
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

    // --- lifecycle ---

    /// Bind and start accepting/dispatching. Resolves once the listener
    /// (or dispatcher socket) is bound, so `listen_addr` is valid on
    /// return.
    pub async fn start(&mut self, host: &str, port: u16) -> NetResult<()> {
        if !self
            .inner
            .state
            .transition(SessionState::Stopped, SessionState::Starting)
        {
            return Err(NetError::AlreadyStarted);
        }
        let _ = self
            .inner
            .callbacks
            .set(Arc::new(mem::take(&mut self.staged)));

        let token = CancellationToken::new();
        {
            *self
                .inner
                .stop_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = token.clone();
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let host = host.to_string();
        match self.inner.socket_kind {
            SocketKind::Tcp => self
                .inner
                .pool
                .get_at(0)
                .spawn(acceptor::run(inner, host, port, token, ready_tx)),
            SocketKind::Udp => self
                .inner
                .pool
                .get_at(0)
                .spawn(dispatcher::run(inner, host, port, token, ready_tx)),
        }

        match ready_rx.await {
            Ok(Ok(addr)) => {
                *self
                    .inner
                    .listen_addr
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(addr);
                if !self
                    .inner
                    .state
                    .transition(SessionState::Starting, SessionState::Started)
                {
                    return Err(NetError::Aborted);
                }
                info!(%addr, "server started");
                Ok(())
            },
            Ok(Err(e)) => {
                self.inner.stop_with(e.clone());
                Err(e)
            },
            Err(_) => {
                self.inner.stop_with(NetError::Aborted);
                Err(NetError::Aborted)
            },
        }
    }

    /// Stop the server and every registered session. Idempotent.
    pub fn stop(&self, err: NetError) {
        self.inner.stop_with(err);
    }

    /// Stop, then retire the executor pool (joins the I/O threads; call
    /// from outside the pool).
    pub fn shutdown(&self) {
        self.inner.stop_with(NetError::Aborted);
        self.inner.pool.stop();
    }

    pub fn is_started(&self) -> bool {
        self.inner.state() == SessionState::Started
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state() == SessionState::Stopped
    }

    // --- session access ---

    /// Apply `send` to every registered session.
    pub fn broadcast<B: Into<Bytes>>(&self, data: B) {
        let data: Bytes = data.into();
        self.inner.registry.for_each(|session| {
            let _ = session.send(data.clone());
        });
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn for_each_session<F>(&self, f: F)
    where F: FnMut(&SessionPtr) {
        self.inner.registry.for_each(f);
    }

    pub fn find_session_if<F>(&self, pred: F) -> Option<SessionPtr>
    where F: FnMut(&SessionPtr) -> bool {
        self.inner.registry.find_if(pred)
    }

    // --- accessors ---

    pub fn tls_context(&self) -> Arc<TlsContext> {
        Arc::clone(&self.inner.tls)
    }

    pub fn io_pool(&self) -> Arc<IoPool> {
        Arc::clone(&self.inner.pool)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .listen_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_addr().map(|a| a.port()).unwrap_or(0)
    }
}

impl Drop for Server {
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

fn validate_kinds(
    socket: SocketKind,
    overlay: OverlayKind,
    proto: ProtoKind,
) -> NetResult<()> {
    let ok = match overlay {
        OverlayKind::Binary => true,
        OverlayKind::Tls => socket == SocketKind::Tcp,
        OverlayKind::Kcp => socket == SocketKind::Udp,
    };
    if !ok || (proto == ProtoKind::WebSocket && socket != SocketKind::Tcp) {
        return Err(NetError::InvalidArgument);
    }
    Ok(())
}
