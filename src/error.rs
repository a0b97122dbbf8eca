// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io;

use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

/// Error taxonomy shared by servers, clients and sessions.
///
/// Setup errors stop the owning server/client, peer errors stop the
/// affected session (followed by a single `disconnect`), user errors are
/// returned synchronously and never stop anything. `Aborted` is the quiet
/// terminal code produced by cancellation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetError {
    #[error("operation aborted")]
    Aborted,
    #[error("operation timed out")]
    TimedOut,
    #[error("not connected")]
    NotConnected,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("address already in use")]
    AddrInUse,
    #[error("already started")]
    AlreadyStarted,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("protocol not available")]
    NoProtocolOption,
    #[error("end of stream")]
    Eof,
    #[error("no data available")]
    NoData,
    #[error("i/o error ({kind:?}): {msg}")]
    Io { kind: io::ErrorKind, msg: String },
    #[error("tls error: {0}")]
    Tls(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl NetError {
    #[inline]
    pub fn is_aborted(&self) -> bool {
        matches!(self, NetError::Aborted)
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::TimedOut)
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => NetError::TimedOut,
            io::ErrorKind::NotConnected => NetError::NotConnected,
            io::ErrorKind::AddrInUse => NetError::AddrInUse,
            io::ErrorKind::InvalidInput => NetError::InvalidArgument,
            io::ErrorKind::UnexpectedEof => NetError::Eof,
            io::ErrorKind::HostUnreachable => NetError::HostUnreachable,
            io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted => {
                NetError::Aborted
            },
            kind => NetError::Io {
                kind,
                msg: e.to_string(),
            },
        }
    }
}
