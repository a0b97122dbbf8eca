// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, ensure};
use nettide::{
    proto::websocket::{OPCODE_CLOSE, OPCODE_TEXT, pack_frame},
    server::Server,
};
use serial_test::serial;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};

use crate::integration_tests::common::{WAIT, next};

/// Minimal frame reader for the test client: header, extended length,
/// payload (server frames are never masked).
async fn read_frame(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.context("frame head")?;
    let opcode = head[0] & 0x0f;
    ensure!(head[1] & 0x80 == 0, "server frame must not be masked");
    let len = match head[1] & 0x7f {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.context("ext16")?;
            u16::from_be_bytes(ext) as usize
        },
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).await.context("ext64")?;
            u64::from_be_bytes(ext) as usize
        },
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.context("payload")?;
    Ok((opcode, payload))
}

/// Upgrade handshake against a raw TCP client, masked text echo, then a
/// close handshake that the server echoes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn upgrade_echo_close() -> Result<()> {
    let (packet_tx, mut packet_rx) = mpsc::unbounded_channel();
    let mut server = Server::websocket(2).context("server")?;
    server.on_recv(|session, data| {
        let _ = session.send(data);
    });
    server.on_packet(move |_, data| {
        let _ = packet_tx.send(data);
    });
    server.start("127.0.0.1", 0).await.context("start")?;
    let port = server.listen_port();

    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .context("connect")?;

    // Handshake with the RFC 6455 sample key.
    let request = "GET /chat HTTP/1.1\r\n\
                   Host: 127.0.0.1\r\n\
                   Upgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
    stream
        .write_all(request.as_bytes())
        .await
        .context("send upgrade")?;

    let mut response = vec![0u8; 1024];
    let n = timeout(WAIT, stream.read(&mut response))
        .await
        .context("response timeout")?
        .context("read response")?;
    let text = String::from_utf8_lossy(&response[..n]);
    ensure!(text.starts_with("HTTP/1.1 101"), "bad status: {text}");
    ensure!(
        text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
        "bad accept key: {text}"
    );

    // Masked text frame in, echoed text frame out.
    let frame = pack_frame(b"hello ws", OPCODE_TEXT, true, Some([0xa, 0xb, 0xc, 0xd]));
    stream.write_all(&frame).await.context("send frame")?;
    let (opcode, payload) = timeout(WAIT, read_frame(&mut stream))
        .await
        .context("echo timeout")??;
    assert_eq!(opcode, OPCODE_TEXT);
    assert_eq!(payload, b"hello ws");

    // Close handshake: code 1000 + reason, echoed back verbatim.
    let mut close_payload = 1000u16.to_be_bytes().to_vec();
    close_payload.extend_from_slice(b"done");
    let frame = pack_frame(&close_payload, OPCODE_CLOSE, true, Some([1, 1, 2, 2]));
    stream.write_all(&frame).await.context("send close")?;

    let (opcode, payload) = timeout(WAIT, read_frame(&mut stream))
        .await
        .context("close echo timeout")??;
    assert_eq!(opcode, OPCODE_CLOSE);
    assert_eq!(payload, close_payload);

    // The close payload also surfaced through the packet event.
    let control = next(&mut packet_rx).await.context("packet event")?;
    assert_eq!(control.as_ref(), close_payload.as_slice());

    server.shutdown();
    Ok(())
}
