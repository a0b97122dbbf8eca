// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server-side WebSocket: handshake detection plus RFC 6455 framing.
//!
//! Base framing layout (RFC 6455 §5.2):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest as _, Md5};
use sha1::Sha1;
use tracing::{debug, info};

use crate::{buffer::ByteRing, proto::WsAction};

/// Fixed GUID appended to the client key (RFC 6455 §4.1).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const OPCODE_TEXT: u8 = 1;
pub const OPCODE_BINARY: u8 = 2;
pub const OPCODE_CLOSE: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsMode {
    AwaitingHandshake,
    Framed,
}

/// Handshake + framing state of one WebSocket session.
#[derive(Debug)]
pub struct WsCodec {
    mode: WsMode,
    ring: ByteRing,
    /// Opcode of the last inbound data frame; outbound frames echo it.
    last_opcode: u8,
}

impl Default for WsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WsCodec {
    pub fn new() -> Self {
        Self {
            mode: WsMode::AwaitingHandshake,
            ring: ByteRing::new(),
            last_opcode: 0,
        }
    }

    pub fn is_framed(&self) -> bool {
        self.mode == WsMode::Framed
    }

    /// Feed one inbound chunk; returns the resulting actions in order.
    pub fn on_bytes(&mut self, chunk: &[u8]) -> Vec<WsAction> {
        match self.mode {
            WsMode::AwaitingHandshake => {
                let text = String::from_utf8_lossy(chunk);
                if text.contains("Upgrade: websocket") {
                    if let Some(response) = build_handshake_response(&text, chunk) {
                        self.mode = WsMode::Framed;
                        self.ring.clear();
                        return vec![WsAction::Reply(response)];
                    }
                    debug!("websocket upgrade request rejected");
                }
                Vec::new()
            },
            WsMode::Framed => {
                self.ring.write(chunk);
                let mut actions = Vec::new();
                while let Some(frame) = parse_frame(self.ring.readable()) {
                    let total = frame.header_len + frame.payload_len;
                    let mut payload =
                        self.ring.readable()[frame.header_len..total].to_vec();
                    if frame.masked {
                        for (i, b) in payload.iter_mut().enumerate() {
                            *b ^= frame.mask_key[i % 4];
                        }
                    }
                    self.ring.consume(total);

                    if frame.opcode == OPCODE_CLOSE {
                        log_close(&payload);
                        let payload = Bytes::from(payload);
                        actions.push(WsAction::Control(payload.clone()));
                        actions.push(WsAction::Reply(pack_frame(
                            &payload,
                            OPCODE_CLOSE,
                            true,
                            None,
                        )));
                        self.mode = WsMode::AwaitingHandshake;
                        self.ring.clear();
                        break;
                    }

                    self.last_opcode = frame.opcode;
                    actions.push(WsAction::Deliver(Bytes::from(payload)));
                }
                actions
            },
        }
    }

    /// Frame an outbound message. Before the handshake completes, bytes
    /// pass through untouched (the handshake response itself travels that
    /// way).
    pub fn pack(&mut self, data: &Bytes) -> Bytes {
        if self.mode != WsMode::Framed {
            return data.clone();
        }
        let opcode = if self.last_opcode == 0 {
            OPCODE_BINARY
        } else {
            self.last_opcode
        };
        pack_frame(data, opcode, true, None)
    }
}

struct FrameHeader {
    opcode: u8,
    masked: bool,
    mask_key: [u8; 4],
    header_len: usize,
    payload_len: usize,
}

/// Parse one complete frame header + payload from `buf`; `None` keeps the
/// bytes for the next call.
fn parse_frame(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < 2 {
        return None;
    }
    let opcode = buf[0] & 0x0f;
    let masked = buf[1] & 0x80 != 0;
    let short_len = (buf[1] & 0x7f) as usize;

    let mut pos = 2;
    let payload_len = match short_len {
        126 => {
            if buf.len() < pos + 2 {
                return None;
            }
            let len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
            pos += 2;
            len
        },
        127 => {
            if buf.len() < pos + 8 {
                return None;
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[pos..pos + 8]);
            pos += 8;
            u64::from_be_bytes(raw) as usize
        },
        n => n,
    };

    let mut mask_key = [0u8; 4];
    if masked {
        if buf.len() < pos + 4 {
            return None;
        }
        mask_key.copy_from_slice(&buf[pos..pos + 4]);
        pos += 4;
    }

    if buf.len() < pos + payload_len {
        return None;
    }
    Some(FrameHeader {
        opcode,
        masked,
        mask_key,
        header_len: pos,
        payload_len,
    })
}

/// Prepend the frame header; the length field is 7-bit, 16-bit or 64-bit
/// big-endian depending on payload size. `mask_key` cycles over the
/// payload when present (servers send unmasked).
pub fn pack_frame(
    payload: &[u8],
    opcode: u8,
    fin: bool,
    mask_key: Option<[u8; 4]>,
) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 14);
    out.put_u8((u8::from(fin) << 7) | (opcode & 0x0f));

    let mask_bit = u8::from(mask_key.is_some()) << 7;
    if payload.len() <= 125 {
        out.put_u8(mask_bit | payload.len() as u8);
    } else if payload.len() <= 65535 {
        out.put_u8(mask_bit | 126);
        out.put_u16(payload.len() as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(payload.len() as u64);
    }

    match mask_key {
        Some(key) => {
            out.put_slice(&key);
            for (i, b) in payload.iter().enumerate() {
                out.put_u8(b ^ key[i % 4]);
            }
        },
        None => out.put_slice(payload),
    }
    out.freeze()
}

/// Close code (first 16 bits, big-endian) and reason (rest of payload).
fn log_close(payload: &[u8]) {
    if payload.len() >= 2 {
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]);
        info!(code, reason = %reason, "websocket close handshake");
    } else {
        info!("websocket close handshake");
    }
}

/// RFC 6455 accept key: base64(SHA-1(key || GUID)).
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// hixie-76 key half: digits of the header divided by its space count,
/// big-endian.
fn decode_client_key(key: &str) -> [u8; 4] {
    let spaces = key.chars().filter(|c| *c == ' ').count() as u64;
    let digits: String = key.chars().filter(char::is_ascii_digit).collect();
    let number = digits.parse::<u64>().unwrap_or(0);
    if spaces > 0 && number > 0 {
        ((number / spaces) as u32).to_be_bytes()
    } else {
        [0u8; 4]
    }
}

/// hixie-76 response body: MD5 over both decoded key halves plus the
/// 8-byte request tail.
fn hixie76_digest(key1: &str, key2: &str, tail: &[u8]) -> Option<[u8; 16]> {
    if tail.len() != 8 {
        return None;
    }
    let mut material = [0u8; 16];
    material[..4].copy_from_slice(&decode_client_key(key1));
    material[4..8].copy_from_slice(&decode_client_key(key2));
    material[8..].copy_from_slice(tail);

    let mut digest = [0u8; 16];
    digest.copy_from_slice(&Md5::digest(material));
    Some(digest)
}

/// `GET <path> ...` request line plus `Key: Value` headers.
fn parse_http_headers(text: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    let mut lines = text.lines();
    if let Some(request) = lines.next()
        && let Some(path) = request
            .strip_prefix("GET ")
            .and_then(|rest| rest.split_whitespace().next())
    {
        headers.insert("GET".to_string(), path.to_string());
    }
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(": ") {
            headers.insert(key.to_string(), value.to_string());
        }
    }
    headers
}

/// Build the 101 response; legacy hixie-76 requests are recognized by the
/// presence of `Sec-WebSocket-Key1`.
fn build_handshake_response(text: &str, raw: &[u8]) -> Option<Bytes> {
    let headers = parse_http_headers(text);

    if headers.contains_key("Sec-WebSocket-Key1") {
        let key1 = headers.get("Sec-WebSocket-Key1")?;
        let key2 = headers.get("Sec-WebSocket-Key2")?;
        if raw.len() < 8 {
            return None;
        }
        let digest = hixie76_digest(key1, key2, &raw[raw.len() - 8..])?;

        let empty = String::new();
        let origin = headers.get("Origin").unwrap_or(&empty);
        let host = headers.get("Host").unwrap_or(&empty);
        let path = headers.get("GET").unwrap_or(&empty);
        let protocol = headers.get("Sec-WebSocket-Protocol").unwrap_or(&empty);

        let mut response = BytesMut::new();
        response.put_slice(
            format!(
                "HTTP/1.1 101 Web Socket Protocol Handshake\r\n\
                 Upgrade: WebSocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Origin: {origin}\r\n\
                 Sec-WebSocket-Location: ws://{host}{path}\r\n\
                 Sec-WebSocket-Protocol: {protocol}\r\n\r\n"
            )
            .as_bytes(),
        );
        response.put_slice(&digest);
        return Some(response.freeze());
    }

    let key = headers.get("Sec-WebSocket-Key")?;
    let accept = accept_key(key);
    Some(Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         Connection: upgrade\r\n\r\n"
    )))
}
