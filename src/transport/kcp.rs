// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use kcp::Kcp;
use tokio::{net::UdpSocket, sync::Mutex as TokioMutex};
use tracing::debug;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32,
};

use crate::{
    error::{NetError, NetResult},
    executor::Timer,
    session::{Role, Session, SessionState},
    transport::Overlay,
    utils::{fnv1a32, millis_now},
};

pub(crate) const KCP_HDR_LEN: usize = size_of::<KcpHdr>();

const FLAG_FIN: u8 = 0x80;
const OP_SYN: u8 = 0x01;
const OP_SYNACK: u8 = 0x02;
const OP_FIN: u8 = 0x08;

/// Fixed-layout handshake header.
///
/// Control packets on the wire are exactly this size, which is how they
/// are told apart from engine output (KCP segments are never this short).
/// `seq` carries the sender's sequence (the conversation id in a
/// SYN-ACK); `ack` echoes the peer's sequence so the client can match the
/// answer to its SYN.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct KcpHdr {
    /// fin(1) rsv1(1) rsv2(1) rsv3(1) opcode(4)
    flags: u8,
    /// mask(1) payloadlen(7); zero in every control packet
    mask_len: u8,
    seq: U32<BigEndian>,
    ack: U32<BigEndian>,
}

impl KcpHdr {
    pub(crate) fn syn(seq: u32) -> Self {
        Self {
            flags: OP_SYN,
            mask_len: 0,
            seq: U32::new(seq),
            ack: U32::new(0),
        }
    }

    pub(crate) fn synack(conv: u32, echo: u32) -> Self {
        Self {
            flags: OP_SYNACK,
            mask_len: 0,
            seq: U32::new(conv),
            ack: U32::new(echo),
        }
    }

    pub(crate) fn fin() -> Self {
        Self {
            flags: FLAG_FIN | OP_FIN,
            mask_len: 0,
            seq: U32::new(0),
            ack: U32::new(0),
        }
    }

    #[inline]
    fn opcode(&self) -> u8 {
        self.flags & 0x0f
    }

    pub(crate) fn is_syn(&self) -> bool {
        self.opcode() == OP_SYN
    }

    pub(crate) fn is_synack_for(&self, seq: u32) -> bool {
        self.opcode() == OP_SYNACK && self.ack.get() == seq
    }

    pub(crate) fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0 && self.opcode() == OP_FIN
    }

    pub(crate) fn seq(&self) -> u32 {
        self.seq.get()
    }

    pub(crate) fn parse(data: &[u8]) -> Option<KcpHdr> {
        if data.len() != KCP_HDR_LEN {
            return None;
        }
        KcpHdr::read_from_bytes(data).ok()
    }
}

/// The engine's output hook: one call writes one UDP datagram. Server
/// sessions address the shared socket explicitly; clients use their
/// connected socket.
pub(crate) struct KcpOutput {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    shared: bool,
}

impl io::Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = if self.shared {
            self.socket.try_send_to(buf, self.peer)
        } else {
            self.socket.try_send(buf)
        };
        match res {
            Ok(n) => Ok(n),
            // A full socket buffer drops the datagram; the engine
            // retransmits.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(buf.len()),
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn engine_error(e: kcp::Error) -> NetError {
    NetError::Io {
        kind: io::ErrorKind::Other,
        msg: format!("kcp: {e:?}"),
    }
}

/// Reliable-UDP overlay around an opaque KCP control block.
pub(crate) struct KcpOverlay {
    engine: TokioMutex<Option<Kcp<KcpOutput>>>,
    /// Server: the conversation id. Client: the sequence sent in its SYN.
    seq: AtomicU32,
    /// Cleared once the peer initiated close; then no FIN is replied.
    send_fin: AtomicBool,
}

impl KcpOverlay {
    pub(crate) fn new() -> Self {
        Self {
            engine: TokioMutex::new(None),
            seq: AtomicU32::new(0),
            send_fin: AtomicBool::new(true),
        }
    }

    pub(crate) async fn handshake(&self, session: &Arc<Session>) -> NetResult<()> {
        match session.role() {
            Role::Server => self.server_handshake(session).await,
            Role::Client => self.client_handshake(session).await,
        }
    }

    /// The datagram that created the session must be a SYN. Answer with a
    /// SYN-ACK carrying the conversation id (FNV-1a of the session key)
    /// and the echoed client sequence, then bring up the engine.
    async fn server_handshake(&self, session: &Arc<Session>) -> NetResult<()> {
        let first = session
            .take_first_packet()
            .ok_or(NetError::NoProtocolOption)?;
        let syn = KcpHdr::parse(&first)
            .filter(KcpHdr::is_syn)
            .ok_or(NetError::NoProtocolOption)?;

        let conv = fnv1a32(&session.key_bytes());
        self.seq.store(conv, Ordering::SeqCst);
        let synack = KcpHdr::synack(conv, syn.seq());
        self.send_hdr(session, &synack).await?;

        self.start_engine(session, conv).await
    }

    /// Send a SYN stamped with the millisecond clock, retransmit it on a
    /// fixed cadence, and wait for the matching SYN-ACK to learn the
    /// conversation id.
    async fn client_handshake(&self, session: &Arc<Session>) -> NetResult<()> {
        let uio = session.udp_io().ok_or(NetError::NotConnected)?;
        let socket = uio.socket().ok_or(NetError::NotConnected)?;

        let seq = millis_now();
        self.seq.store(seq, Ordering::SeqCst);
        let syn = KcpHdr::syn(seq);
        socket.send(syn.as_bytes()).await?;

        let retransmit = Timer::new(Arc::clone(session.executor()));
        {
            let socket = Arc::clone(&socket);
            let weak = Arc::downgrade(session);
            retransmit.post_timer(session.cfg().kcp.syn_retransmit_ms, move || {
                let Some(s) = weak.upgrade() else {
                    return false;
                };
                if s.state() != SessionState::Starting {
                    return false;
                }
                match socket.try_send(syn.as_bytes()) {
                    Ok(_) => true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
                    Err(e) => {
                        s.stop(e.into());
                        false
                    },
                }
            });
        }

        let mut scratch = vec![0u8; session.cfg().runtime.datagram_buffer_size];
        let received = socket.recv(&mut scratch).await;
        retransmit.stop();
        let n = received?;

        let synack = KcpHdr::parse(&scratch[..n])
            .filter(|h| h.is_synack_for(seq))
            .ok_or(NetError::NoProtocolOption)?;
        let conv = synack.seq();
        debug!(id = session.id(), conv, "kcp handshake complete");

        self.start_engine(session, conv).await
    }

    async fn start_engine(&self, session: &Arc<Session>, conv: u32) -> NetResult<()> {
        let uio = session.udp_io().ok_or(NetError::NotConnected)?;
        let socket = uio.socket().ok_or(NetError::NotConnected)?;
        let peer = uio
            .peer()
            .or_else(|| socket.peer_addr().ok())
            .ok_or(NetError::NotConnected)?;

        let tuning = &session.cfg().kcp;
        let mut engine = Kcp::new(conv, KcpOutput {
            socket,
            peer,
            shared: uio.shared,
        });
        engine.set_nodelay(
            tuning.nodelay,
            tuning.interval_ms,
            tuning.resend,
            tuning.no_congestion,
        );
        engine.set_wndsize(tuning.send_window, tuning.recv_window);

        {
            let mut guard = self.engine.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            *guard = Some(engine);
        }
        self.send_fin.store(true, Ordering::SeqCst);
        self.spawn_ticker(session);
        Ok(())
    }

    /// Periodic engine update; the cadence comes from the engine's own
    /// `check`, bounded to keep retransmission timely.
    fn spawn_ticker(&self, session: &Arc<Session>) {
        let session = Arc::clone(session);
        let closed = session.closed_token();
        let executor = Arc::clone(session.executor());
        executor.spawn(async move {
            loop {
                if closed.is_cancelled() {
                    break;
                }
                let now = millis_now();
                // `check` reports how many milliseconds until the next
                // update is due.
                let due_in = {
                    let Overlay::Kcp(overlay) = &session.overlay else {
                        break;
                    };
                    let mut guard = overlay.engine.lock().await;
                    let Some(engine) = guard.as_mut() else {
                        break;
                    };
                    if engine.update(now).is_err() {
                        break;
                    }
                    engine.check(now)
                };
                let wait = u64::from(due_in.clamp(1, 100));
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(wait)) => {},
                }
            }
        });
    }

    async fn send_hdr(&self, session: &Arc<Session>, hdr: &KcpHdr) -> NetResult<()> {
        let uio = session.udp_io().ok_or(NetError::NotConnected)?;
        let socket = uio.socket().ok_or(NetError::NotConnected)?;
        if uio.shared {
            let peer = uio.peer().ok_or(NetError::NotConnected)?;
            socket.send_to(hdr.as_bytes(), peer).await?;
        } else {
            socket.send(hdr.as_bytes()).await?;
        }
        Ok(())
    }

    /// Steady-state inbound: header-sized datagrams are control, anything
    /// else feeds the engine.
    pub(crate) async fn handle_datagram(&self, session: &Arc<Session>, data: Bytes) {
        if !session.is_started() {
            return;
        }
        if data.len() == KCP_HDR_LEN {
            if let Some(hdr) = KcpHdr::parse(&data) {
                self.handle_control(session, &hdr).await;
            }
            return;
        }
        self.feed_engine(session, &data).await;
    }

    async fn handle_control(&self, session: &Arc<Session>, hdr: &KcpHdr) {
        match session.role() {
            Role::Server => {
                if hdr.is_fin() {
                    // Peer close; do not reply FIN.
                    self.send_fin.store(false, Ordering::SeqCst);
                    session.stop(NetError::Eof);
                } else if hdr.is_syn() {
                    // The SYN-ACK was lost and the client retransmitted;
                    // answering duplicates is idempotent.
                    let synack =
                        KcpHdr::synack(self.seq.load(Ordering::SeqCst), hdr.seq());
                    if let Err(e) = self.send_hdr(session, &synack).await {
                        session.stop(e);
                    }
                }
            },
            Role::Client => {
                if hdr.is_fin() {
                    self.send_fin.store(false, Ordering::SeqCst);
                    session.stop(NetError::Eof);
                } else if hdr.is_synack_for(self.seq.load(Ordering::SeqCst)) {
                    session.stop(NetError::Aborted);
                }
            },
        }
    }

    async fn feed_engine(&self, session: &Arc<Session>, data: &[u8]) {
        let mut messages = Vec::new();
        {
            let mut guard = self.engine.lock().await;
            let Some(engine) = guard.as_mut() else {
                return;
            };
            if engine.input(data).is_err() {
                drop(guard);
                session.stop(NetError::NoData);
                return;
            }
            loop {
                let Ok(size) = engine.peeksize() else {
                    break;
                };
                let mut buf = vec![0u8; size.max(1)];
                match engine.recv(&mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        messages.push(Bytes::from(buf));
                    },
                    Err(_) => break,
                }
            }
            let _ = engine.flush();
        }
        for msg in messages {
            session.deliver(msg);
        }
    }

    /// Writer-path send: enqueue into the engine and flush; the output
    /// hook emits the datagrams.
    pub(crate) async fn send(&self, data: &[u8]) -> NetResult<()> {
        let mut guard = self.engine.lock().await;
        let engine = guard.as_mut().ok_or(NetError::NotConnected)?;
        engine.send(data).map_err(engine_error)?;
        engine.flush().map_err(engine_error)?;
        Ok(())
    }

    pub(crate) async fn shutdown(&self, session: &Arc<Session>) {
        // FIN only leaves an established conversation, and only when the
        // peer has not closed first.
        let established = self.engine.lock().await.take().is_some();
        if established && self.send_fin.load(Ordering::SeqCst) {
            let _ = self.send_hdr(session, &KcpHdr::fin()).await;
        }
        session.drop_udp_socket();
    }
}
