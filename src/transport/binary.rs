// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use crate::{error::NetResult, session::Session};

/// The plaintext overlay has no wire handshake: a freshly accepted or
/// connected stream is just split into its halves. (The first datagram of
/// a UDP server session is surfaced by the session start path itself.)
pub(crate) async fn handshake(session: &Arc<Session>) -> NetResult<()> {
    if let Some(stream) = session.take_pending_stream() {
        let (rd, wr) = stream.into_split();
        session.install_halves(Box::new(rd), Box::new(wr)).await;
    }
    Ok(())
}

/// Shut down and close the socket. UDP server sessions share the
/// dispatcher's socket and leave it alone.
pub(crate) async fn shutdown(session: &Arc<Session>) {
    session.shutdown_stream(None).await;
    session.drop_udp_socket();
}
