// src/websocket.rs
//! RFC 6455 framing and the opening handshake.
use base64::Engine;
use sha1::{Digest, Sha1};
use std::sync::Arc;

use crate::http::{Request, Response, Status};
use crate::sender::BufferedSender;

/// Appended to the client key before hashing.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u8);

impl Opcode {
    pub const CONTINUATION: Opcode = Opcode(0x0);
    pub const TEXT: Opcode = Opcode(0x1);
    pub const BINARY: Opcode = Opcode(0x2);
    pub const CLOSE: Opcode = Opcode(0x8);
    pub const PING: Opcode = Opcode(0x9);
    pub const PONG: Opcode = Opcode(0xA);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(fin: bool, opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(true, Opcode::TEXT, payload)
    }

    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(true, Opcode::BINARY, payload)
    }

    pub fn close() -> Self {
        Self::new(true, Opcode::CLOSE, Vec::new())
    }

    pub fn is_close(&self) -> bool {
        self.opcode == Opcode::CLOSE
    }

    /// Server-to-client wire bytes (unmasked).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + 10);
        self.write_head(&mut buf, false);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Client-to-server wire bytes, payload masked with `key`.
    pub fn encode_masked(&self, key: [u8; 4]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + 14);
        self.write_head(&mut buf, true);
        buf.extend_from_slice(&key);
        let start = buf.len();
        buf.extend_from_slice(&self.payload);
        apply_mask(&mut buf[start..], key);
        buf
    }

    fn write_head(&self, buf: &mut Vec<u8>, masked: bool) {
        let fin = if self.fin { 0x80 } else { 0 };
        buf.push(fin | (self.opcode.0 & 0x0F));
        let mask = if masked { 0x80 } else { 0 };
        let len = self.payload.len();
        if len < 126 {
            buf.push(mask | len as u8);
        } else if len <= u16::MAX as usize {
            buf.push(mask | 126);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            buf.push(mask | 127);
            buf.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
}

/// XOR `payload` in place against `key`, cycling every 4 bytes. Applying it
/// twice restores the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Incremental frame decoder. A frame is consumed only once all of its
/// bytes are buffered.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn parse(&mut self) -> Option<Frame> {
        let buf = &self.buf;
        if buf.len() < 2 {
            return None;
        }
        let fin = buf[0] & 0x80 != 0;
        let opcode = Opcode(buf[0] & 0x0F);
        let masked = buf[1] & 0x80 != 0;
        let mut pos = 2;

        let length = match buf[1] & 0x7F {
            126 => {
                let ext: [u8; 2] = buf.get(pos..pos + 2)?.try_into().ok()?;
                pos += 2;
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let ext: [u8; 8] = buf.get(pos..pos + 8)?.try_into().ok()?;
                pos += 8;
                // Lengths beyond the address space can never complete.
                usize::try_from(u64::from_be_bytes(ext)).ok()?
            }
            n => n as usize,
        };

        let key = if masked {
            let key: [u8; 4] = buf.get(pos..pos + 4)?.try_into().ok()?;
            pos += 4;
            Some(key)
        } else {
            None
        };

        let end = pos.checked_add(length)?;
        let mut payload = buf.get(pos..end)?.to_vec();
        if let Some(key) = key {
            apply_mask(&mut payload, key);
        }
        self.buf.drain(..end);
        Some(Frame {
            fin,
            opcode,
            payload,
        })
    }
}

/// `Base64(SHA-1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// The `101 Switching Protocols` answer to an upgrade request, or `None`
/// when the request is not a valid WebSocket upgrade.
pub fn handshake(req: &Request) -> Option<Response> {
    let upgrade = req.header("upgrade")?;
    if !upgrade.trim().eq_ignore_ascii_case("websocket") {
        return None;
    }
    let key = req.header("sec-websocket-key")?.trim();
    if key.is_empty() {
        return None;
    }
    Some(
        Response::new(Status::SwitchingProtocols)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", accept_key(key)),
    )
}

/// Where a WebSocket handler sends its frames.
#[derive(Clone)]
pub struct WsSink {
    sender: Arc<BufferedSender>,
}

impl WsSink {
    pub fn new(sender: Arc<BufferedSender>) -> Self {
        Self { sender }
    }

    pub fn send(&self, frame: Frame) {
        Response::Raw(frame.encode()).write_to(&self.sender);
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
