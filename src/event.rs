// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;

use crate::{error::NetError, session::Session};

/// Events observable through the bind surface of servers and clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A client begins a connection attempt.
    Init,
    /// A session reached steady state (registered, recv loop running).
    Connect,
    /// A session was torn down; fires exactly once per connected session.
    Disconnect,
    /// A decoded inbound message.
    Recv,
    /// Overlay handshake finished (TLS, KCP).
    Handshake,
    /// A protocol-level control frame (e.g. WebSocket close payload).
    Packet,
}

pub type SessionPtr = Arc<Session>;

pub type InitHandler = Box<dyn Fn() + Send + Sync>;
pub type StatusHandler = Box<dyn Fn(&SessionPtr, Option<&NetError>) + Send + Sync>;
pub type DataHandler = Box<dyn Fn(&SessionPtr, Bytes) + Send + Sync>;

/// The user callback table. Handlers are installed before `start`/`add`
/// and invoked on the executor thread owning the session; no user code
/// ever runs concurrently for one session.
#[derive(Default)]
pub struct Callbacks {
    pub(crate) init: Option<InitHandler>,
    pub(crate) connect: Option<StatusHandler>,
    pub(crate) disconnect: Option<StatusHandler>,
    pub(crate) handshake: Option<StatusHandler>,
    pub(crate) recv: Option<DataHandler>,
    pub(crate) packet: Option<DataHandler>,
}

impl Callbacks {
    pub(crate) fn call_init(&self) {
        if let Some(f) = &self.init {
            f();
        }
    }

    pub(crate) fn call_status(
        &self,
        event: Event,
        session: &SessionPtr,
        ec: Option<&NetError>,
    ) {
        let handler = match event {
            Event::Connect => self.connect.as_ref(),
            Event::Disconnect => self.disconnect.as_ref(),
            Event::Handshake => self.handshake.as_ref(),
            _ => None,
        };
        if let Some(f) = handler {
            f(session, ec);
        }
    }

    pub(crate) fn call_data(&self, event: Event, session: &SessionPtr, data: Bytes) {
        let handler = match event {
            Event::Recv => self.recv.as_ref(),
            Event::Packet => self.packet.as_ref(),
            _ => None,
        };
        if let Some(f) = handler {
            f(session, data);
        }
    }
}
