// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    any::Any,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::{Mutex as TokioMutex, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    error::{NetError, NetResult},
    event::{Callbacks, Event},
    executor::Executor,
    proto::{Proto, WsAction},
    session::{
        SessionState,
        registry::{SessionKey, SessionRegistry},
        state::StateCell,
    },
    transport::Overlay,
};

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Which side of the connection this session lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Stream socket state. `pending` holds the raw TCP stream between
/// accept/connect and the overlay handshake, which turns it into the
/// boxed halves (plaintext or TLS).
pub(crate) struct StreamIo {
    pub(crate) pending: StdMutex<Option<TcpStream>>,
    pub(crate) rd: TokioMutex<Option<BoxedRead>>,
    pub(crate) wr: TokioMutex<Option<BoxedWrite>>,
}

/// Datagram socket state. Server sessions share the dispatcher's socket
/// (`shared`), never read from it and address the peer explicitly.
pub(crate) struct UdpIo {
    pub(crate) socket: StdMutex<Option<Arc<UdpSocket>>>,
    pub(crate) peer: StdMutex<Option<SocketAddr>>,
    pub(crate) shared: bool,
}

impl UdpIo {
    pub(crate) fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) enum SessionIo {
    Stream(StreamIo),
    Udp(UdpIo),
}

impl SessionIo {
    pub(crate) fn stream() -> Self {
        SessionIo::Stream(StreamIo {
            pending: StdMutex::new(None),
            rd: TokioMutex::new(None),
            wr: TokioMutex::new(None),
        })
    }

    pub(crate) fn udp(
        socket: Option<Arc<UdpSocket>>,
        peer: Option<SocketAddr>,
        shared: bool,
    ) -> Self {
        SessionIo::Udp(UdpIo {
            socket: StdMutex::new(socket),
            peer: StdMutex::new(peer),
            shared,
        })
    }
}

/// Per-run plumbing, rebuilt on every (re)start so a reconnected session
/// gets fresh queues and a fresh cancellation scope.
struct Wiring {
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
}

pub(crate) type StoppedHook = Box<dyn Fn(&Arc<Session>, &NetError) + Send + Sync>;

pub(crate) struct SessionArgs {
    pub id: u64,
    pub role: Role,
    pub executor: Arc<Executor>,
    pub registry: Arc<SessionRegistry>,
    pub callbacks: Arc<Callbacks>,
    pub cfg: Arc<Config>,
    pub io: SessionIo,
    pub overlay: Overlay,
    pub proto: Proto,
}

/// One connection: socket, overlay, buffers, send queue and lifecycle.
///
/// Every I/O completion, timer and user callback of a session runs on the
/// executor it was pinned to at creation, so per-session state needs no
/// locking beyond what crosses threads by design (the registry, the
/// outbound queue senders).
pub struct Session {
    id: u64,
    role: Role,
    state: StateCell,
    executor: Arc<Executor>,
    registry: Arc<SessionRegistry>,
    callbacks: Arc<Callbacks>,
    cfg: Arc<Config>,
    pub(crate) io: SessionIo,
    pub(crate) overlay: Overlay,
    pub(crate) proto: Proto,
    wiring: StdMutex<Option<Wiring>>,
    first_packet: StdMutex<Option<Bytes>>,
    user_data: StdMutex<Option<Arc<dyn Any + Send + Sync>>>,
    peer_addr: StdMutex<Option<SocketAddr>>,
    sni_host: StdMutex<Option<String>>,
    remote_target: StdMutex<Option<(String, u16)>>,
    keepalive: AtomicBool,
    stopped_hook: OnceCell<StoppedHook>,
}

impl Session {
    pub(crate) fn new(args: SessionArgs) -> Arc<Self> {
        Arc::new(Self {
            id: args.id,
            role: args.role,
            state: StateCell::new(),
            executor: args.executor,
            registry: args.registry,
            callbacks: args.callbacks,
            cfg: args.cfg,
            io: args.io,
            overlay: args.overlay,
            proto: args.proto,
            wiring: StdMutex::new(None),
            first_packet: StdMutex::new(None),
            user_data: StdMutex::new(None),
            peer_addr: StdMutex::new(None),
            sni_host: StdMutex::new(None),
            remote_target: StdMutex::new(None),
            keepalive: AtomicBool::new(false),
            stopped_hook: OnceCell::new(),
        })
    }

    // --- identity ---

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    pub fn is_started(&self) -> bool {
        self.state.load() == SessionState::Started
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load() == SessionState::Stopped
    }

    /// Registry identity: stream sessions use an opaque per-process id,
    /// datagram sessions their peer (server) or local (client) endpoint.
    pub fn key(&self) -> SessionKey {
        match &self.io {
            SessionIo::Stream(_) => SessionKey::Local(self.id),
            SessionIo::Udp(u) => {
                if u.shared {
                    match u.peer() {
                        Some(addr) => SessionKey::Peer(addr),
                        None => SessionKey::Local(self.id),
                    }
                } else {
                    match u.socket().and_then(|s| s.local_addr().ok()) {
                        Some(addr) => SessionKey::Peer(addr),
                        None => SessionKey::Local(self.id),
                    }
                }
            },
        }
    }

    pub(crate) fn key_bytes(&self) -> Vec<u8> {
        match self.key() {
            SessionKey::Peer(addr) => addr.to_string().into_bytes(),
            SessionKey::Local(id) => id.to_be_bytes().to_vec(),
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match &self.io {
            SessionIo::Udp(u) => u.peer(),
            SessionIo::Stream(_) => {
                *self.peer_addr.lock().unwrap_or_else(PoisonError::into_inner)
            },
        }
    }

    pub(crate) fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub(crate) fn cfg(&self) -> &Config {
        &self.cfg
    }

    // --- user data ---

    pub fn set_user_data<T: Any + Send + Sync>(&self, value: T) {
        *self.user_data.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::new(value));
    }

    /// Typed view of the per-session scratch slot; `None` on type
    /// mismatch or when unset.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.user_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .and_then(|any| any.downcast::<T>().ok())
    }

    pub fn user_data_reset(&self) {
        *self.user_data.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    // --- crate-internal plumbing ---

    pub(crate) fn stream_io(&self) -> Option<&StreamIo> {
        match &self.io {
            SessionIo::Stream(s) => Some(s),
            SessionIo::Udp(_) => None,
        }
    }

    pub(crate) fn udp_io(&self) -> Option<&UdpIo> {
        match &self.io {
            SessionIo::Udp(u) => Some(u),
            SessionIo::Stream(_) => None,
        }
    }

    pub(crate) fn install_stream(&self, stream: TcpStream, peer: Option<SocketAddr>) {
        if let Some(sio) = self.stream_io() {
            *sio.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
        }
        *self.peer_addr.lock().unwrap_or_else(PoisonError::into_inner) = peer;
    }

    pub(crate) fn install_udp(&self, socket: Arc<UdpSocket>, peer: SocketAddr) {
        if let Some(uio) = self.udp_io() {
            *uio.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(socket);
            *uio.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer);
        }
    }

    pub(crate) fn take_pending_stream(&self) -> Option<TcpStream> {
        self.stream_io().and_then(|sio| {
            sio.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        })
    }

    pub(crate) async fn install_halves(&self, rd: BoxedRead, wr: BoxedWrite) {
        if let Some(sio) = self.stream_io() {
            *sio.rd.lock().await = Some(rd);
            *sio.wr.lock().await = Some(wr);
        }
    }

    pub(crate) fn set_first_packet(&self, data: Bytes) {
        *self
            .first_packet
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(data);
    }

    pub(crate) fn take_first_packet(&self) -> Option<Bytes> {
        self.first_packet
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn set_sni_host(&self, host: &str) {
        *self.sni_host.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(host.to_string());
    }

    pub(crate) fn sni_host(&self) -> Option<String> {
        self.sni_host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_remote_target(&self, host: &str, port: u16) {
        *self
            .remote_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((host.to_string(), port));
    }

    pub(crate) fn remote_target(&self) -> Option<(String, u16)> {
        self.remote_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_keepalive(&self, enabled: bool) {
        self.keepalive.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn set_stopped_hook(&self, hook: StoppedHook) {
        let _ = self.stopped_hook.set(hook);
    }

    fn wiring_closed(&self) -> Option<CancellationToken> {
        self.wiring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|w| w.closed.clone())
    }

    // --- send path ---

    /// Queue bytes for transmission.
    ///
    /// Fails synchronously with `NotConnected` unless the session is
    /// started and with `InvalidArgument` for empty payloads; neither
    /// failure stops the session. Sends from any thread are serialized
    /// into FIFO order by the single writer task on the session strand.
    pub fn send<B: Into<Bytes>>(&self, data: B) -> NetResult<()> {
        if self.state.load() != SessionState::Started {
            return Err(NetError::NotConnected);
        }
        let data: Bytes = data.into();
        if data.is_empty() {
            return Err(NetError::InvalidArgument);
        }
        let framed = self.proto.pack(data);
        self.enqueue_raw(framed)
    }

    /// Queue already-framed bytes, bypassing the protocol packer.
    pub(crate) fn enqueue_raw(&self, data: Bytes) -> NetResult<()> {
        let wiring = self.wiring.lock().unwrap_or_else(PoisonError::into_inner);
        match wiring.as_ref() {
            Some(w) => w
                .outbound_tx
                .send(data)
                .map_err(|_| NetError::NotConnected),
            None => Err(NetError::NotConnected),
        }
    }

    /// Ordered inbound hand-off used by the UDP dispatcher.
    pub(crate) fn push_inbound(&self, data: Bytes) {
        let wiring = self.wiring.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(w) = wiring.as_ref() {
            let _ = w.inbound_tx.send(data);
        }
    }

    // --- lifecycle ---

    /// Begin the start sequence on the session's own executor.
    ///
    /// `already_starting` is set by the client connector, which claimed
    /// the `Stopped -> Starting` edge before dialing.
    pub(crate) fn spawn_start(self: &Arc<Self>, already_starting: bool) {
        let session = Arc::clone(self);
        self.executor.spawn(async move {
            session.run_start(already_starting).await;
        });
    }

    pub(crate) fn claim_starting(&self) -> bool {
        self.state
            .transition(SessionState::Stopped, SessionState::Starting)
    }

    async fn run_start(self: Arc<Self>, already_starting: bool) {
        if !already_starting && !self.claim_starting() {
            debug!(id = self.id, "start ignored: session not stopped");
            return;
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        {
            *self.wiring.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(Wiring {
                    outbound_tx: out_tx,
                    inbound_tx: in_tx,
                    closed: closed.clone(),
                });
        }

        if self.keepalive.load(Ordering::Relaxed) {
            self.apply_keepalive();
        }

        let handshake = tokio::time::timeout(
            self.cfg.handshake_timeout(),
            self.overlay.handshake(&self),
        )
        .await;
        let result = match handshake {
            Ok(r) => r,
            Err(_) => Err(NetError::TimedOut),
        };
        if self.overlay.wants_handshake_event() {
            self.callbacks
                .call_status(Event::Handshake, &self, result.as_ref().err());
        }
        if let Err(e) = result {
            self.stop(e);
            return;
        }

        if !self
            .state
            .transition(SessionState::Starting, SessionState::Started)
        {
            self.stop(NetError::Aborted);
            return;
        }
        if !self.registry.insert(Arc::clone(&self)) {
            self.stop(NetError::AddrInUse);
            return;
        }

        self.callbacks.call_status(Event::Connect, &self, None);

        // The datagram that created a binary UDP server session is its
        // first inbound delivery. (KCP consumed it as the SYN.)
        if matches!(self.overlay, Overlay::Binary)
            && let Some(first) = self.take_first_packet()
        {
            self.deliver(first);
        }

        self.spawn_writer(out_rx, closed.clone());
        self.spawn_recv(in_rx, closed);
    }

    /// Initiate teardown; idempotent, any thread.
    pub fn stop(self: &Arc<Self>, err: NetError) {
        let Some(old) = self.state.begin_stop() else {
            return;
        };
        debug!(id = self.id, ?err, "session stopping");
        let session = Arc::clone(self);
        self.executor.spawn(async move {
            session.run_stop(old, err).await;
        });
    }

    async fn run_stop(self: Arc<Self>, old: SessionState, err: NetError) {
        let removed = self.registry.remove(&self.key());
        if old == SessionState::Started {
            if !removed {
                // Another path already drained this session.
                return;
            }
            self.callbacks
                .call_status(Event::Disconnect, &self, Some(&err));
        }

        // Cancel in-flight reads/writes so their socket locks release
        // before the overlay shutdown takes them.
        if let Some(w) = self
            .wiring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            w.closed.cancel();
        }

        self.overlay.shutdown(&self).await;
        self.user_data_reset();
        self.state
            .transition(SessionState::Stopping, SessionState::Stopped);
        if let Some(hook) = self.stopped_hook.get() {
            hook(&self, &err);
        }
    }

    fn apply_keepalive(&self) {
        let Some(sio) = self.stream_io() else {
            return;
        };
        let pending = sio.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = pending.as_ref() {
            let sock = socket2::SockRef::from(stream);
            let ka = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
            if let Err(e) = sock.set_tcp_keepalive(&ka) {
                warn!(id = self.id, "keepalive setup failed: {e}");
            }
            let _ = stream.set_nodelay(true);
        }
    }

    // --- inbound path ---

    fn spawn_writer(
        self: &Arc<Self>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        closed: CancellationToken,
    ) {
        let session = Arc::clone(self);
        self.executor.spawn(async move {
            session.writer_loop(rx, closed).await;
        });
    }

    fn spawn_recv(
        self: &Arc<Self>,
        in_rx: mpsc::UnboundedReceiver<Bytes>,
        closed: CancellationToken,
    ) {
        match &self.io {
            SessionIo::Stream(_) => {
                let session = Arc::clone(self);
                self.executor.spawn(async move {
                    session.recv_loop_stream(closed).await;
                });
            },
            SessionIo::Udp(u) if u.shared => {
                let session = Arc::clone(self);
                self.executor.spawn(async move {
                    session.inbound_loop(in_rx, closed).await;
                });
            },
            SessionIo::Udp(_) => {
                let session = Arc::clone(self);
                self.executor.spawn(async move {
                    session.recv_loop_udp(closed).await;
                });
            },
        }
    }

    async fn writer_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        closed: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                _ = closed.cancelled() => break,
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
            };
            tokio::select! {
                _ = closed.cancelled() => break,
                res = self.write_one(msg) => {
                    if let Err(e) = res {
                        self.stop(e);
                        break;
                    }
                },
            }
        }
    }

    async fn write_one(&self, data: Bytes) -> NetResult<()> {
        if let Overlay::Kcp(k) = &self.overlay {
            return k.send(&data).await;
        }
        match &self.io {
            SessionIo::Stream(sio) => {
                let mut wr = sio.wr.lock().await;
                let w = wr.as_mut().ok_or(NetError::NotConnected)?;
                w.write_all(&data).await?;
                w.flush().await?;
                Ok(())
            },
            SessionIo::Udp(uio) => {
                let socket = uio.socket().ok_or(NetError::NotConnected)?;
                if uio.shared {
                    let peer = uio.peer().ok_or(NetError::NotConnected)?;
                    socket.send_to(&data, peer).await?;
                } else {
                    socket.send(&data).await?;
                }
                Ok(())
            },
        }
    }

    async fn recv_loop_stream(self: Arc<Self>, closed: CancellationToken) {
        let Some(sio) = self.stream_io() else {
            return;
        };
        let chunk = self.cfg.runtime.recv_chunk_size;
        let mut buf = BytesMut::with_capacity(chunk);
        loop {
            if self.state.load() != SessionState::Started {
                break;
            }
            buf.reserve(chunk);
            let read = tokio::select! {
                _ = closed.cancelled() => break,
                res = async {
                    let mut rd = sio.rd.lock().await;
                    match rd.as_mut() {
                        Some(r) => r.read_buf(&mut buf).await,
                        None => Err(io::Error::from(io::ErrorKind::NotConnected)),
                    }
                } => res,
            };
            match read {
                Ok(0) => {
                    self.stop(NetError::Eof);
                    break;
                },
                Ok(_) => {
                    let data = buf.split().freeze();
                    self.process_inbound(data).await;
                },
                Err(e) => {
                    self.stop(e.into());
                    break;
                },
            }
        }
    }

    async fn recv_loop_udp(self: Arc<Self>, closed: CancellationToken) {
        let Some(socket) = self.udp_io().and_then(UdpIo::socket) else {
            return;
        };
        let mut scratch = vec![0u8; self.cfg.runtime.datagram_buffer_size];
        loop {
            if self.state.load() != SessionState::Started {
                break;
            }
            let received = tokio::select! {
                _ = closed.cancelled() => break,
                res = socket.recv(&mut scratch) => res,
            };
            match received {
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&scratch[..n]);
                    self.process_inbound(data).await;
                },
                Err(e) => {
                    self.stop(e.into());
                    break;
                },
            }
        }
    }

    async fn inbound_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        closed: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                _ = closed.cancelled() => break,
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
            };
            self.process_inbound(msg).await;
        }
    }

    pub(crate) async fn process_inbound(self: &Arc<Self>, data: Bytes) {
        match &self.overlay {
            Overlay::Kcp(k) => k.handle_datagram(self, data).await,
            _ => self.deliver(data),
        }
    }

    /// Run the upper protocol over decoded overlay bytes and fire user
    /// callbacks.
    pub(crate) fn deliver(self: &Arc<Self>, data: Bytes) {
        match &self.proto {
            Proto::Raw | Proto::Http => {
                self.callbacks.call_data(Event::Recv, self, data);
            },
            Proto::Ws(codec) => {
                let actions = {
                    let mut ws = codec.lock().unwrap_or_else(PoisonError::into_inner);
                    ws.on_bytes(&data)
                };
                for action in actions {
                    match action {
                        WsAction::Reply(frame) => {
                            if let Err(e) = self.enqueue_raw(frame) {
                                debug!(id = self.id, "ws reply dropped: {e}");
                            }
                        },
                        WsAction::Deliver(payload) => {
                            self.callbacks.call_data(Event::Recv, self, payload);
                        },
                        WsAction::Control(payload) => {
                            self.callbacks.call_data(Event::Packet, self, payload);
                        },
                    }
                }
            },
        }
    }

    // --- overlay shutdown helpers ---

    /// Half-close the stream (close_notify for TLS rides on the write
    /// half) and drop both halves. `grace` bounds peers that never answer
    /// the shutdown.
    pub(crate) async fn shutdown_stream(&self, grace: Option<Duration>) {
        let Some(sio) = self.stream_io() else {
            return;
        };
        {
            let mut wr = sio.wr.lock().await;
            if let Some(w) = wr.as_mut() {
                match grace {
                    Some(d) => {
                        let _ = tokio::time::timeout(d, w.shutdown()).await;
                    },
                    None => {
                        let _ = w.shutdown().await;
                    },
                }
            }
            *wr = None;
        }
        *sio.rd.lock().await = None;
        *sio.pending.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Drop a client-owned UDP socket; the dispatcher's shared socket is
    /// never touched from sessions.
    pub(crate) fn drop_udp_socket(&self) {
        if let Some(uio) = self.udp_io()
            && !uio.shared
        {
            *uio.socket.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        match self.wiring_closed() {
            Some(token) => token,
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            },
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state.load())
            .field("key", &self.key())
            .finish()
    }
}
