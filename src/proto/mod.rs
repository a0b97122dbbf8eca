//! Upper protocols riding on an overlay: raw frames, WebSocket, and a
//! pass-through HTTP stub.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Mutex, PoisonError};

use bytes::Bytes;

pub mod websocket;

pub use websocket::WsCodec;

/// Upper protocol selection for a server or client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoKind {
    /// Deliver overlay bytes as-is.
    Raw,
    /// Server-side WebSocket handshake + RFC 6455 framing.
    WebSocket,
    /// HTTP; requests currently pass through unparsed.
    Http,
}

/// What the WebSocket codec wants done with a parsed chunk.
#[derive(Debug)]
pub enum WsAction {
    /// Already-framed bytes to put on the wire (handshake response,
    /// close echo).
    Reply(Bytes),
    /// A decoded payload for the `recv` callback.
    Deliver(Bytes),
    /// A control payload for the `packet` callback.
    Control(Bytes),
}

/// Per-session protocol state.
pub(crate) enum Proto {
    Raw,
    Ws(Mutex<WsCodec>),
    Http,
}

impl Proto {
    pub(crate) fn from_kind(kind: ProtoKind) -> Self {
        match kind {
            ProtoKind::Raw => Proto::Raw,
            ProtoKind::WebSocket => Proto::Ws(Mutex::new(WsCodec::new())),
            ProtoKind::Http => Proto::Http,
        }
    }

    /// Transform an outgoing user message into wire bytes.
    pub(crate) fn pack(&self, data: Bytes) -> Bytes {
        match self {
            Proto::Raw | Proto::Http => data,
            Proto::Ws(codec) => codec
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pack(&data),
        }
    }
}
