// Copyright 2026 The prismvnc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! WebSocket transport: HTTP upgrade handshake and RFC 6455 framing.
//!
//! The transport stays "corked" until the upgrade handshake completes:
//! nothing is written before the `101 Switching Protocols` response goes
//! out. After that every outbound payload is wrapped in exactly one binary
//! frame. Inbound, binary and continuation payloads are delivered to the
//! reader, text frames are dropped, PING is answered with a PONG carrying
//! the unmasked payload, PONG is ignored, and CLOSE reads as a remote close.
//! The server never masks; inbound masked payloads are unmasked in place.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::{Result, VncError};

/// GUID appended to the client key before hashing, per RFC 6455.
const WS_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OPCODE_CONT: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BIN: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xa;

/// Longest HTTP upgrade request the server will buffer.
const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;

/// Computes the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Result of feeding handshake bytes.
pub enum HandshakeProgress {
    /// More request bytes are needed.
    NeedMore,
    /// Handshake complete: the response to send, plus how many request bytes
    /// were consumed.
    Done { response: Bytes, consumed: usize },
}

/// Parses an HTTP upgrade request and builds the 101 response.
///
/// # Errors
///
/// Fails on malformed HTTP, a missing `Sec-WebSocket-Key`, or a request
/// larger than the handshake buffer.
pub fn handle_handshake(buf: &[u8]) -> Result<HandshakeProgress> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);

    let consumed = match request.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HANDSHAKE_SIZE {
                return Err(VncError::Protocol("oversized WebSocket handshake".into()));
            }
            return Ok(HandshakeProgress::NeedMore);
        }
        Err(e) => {
            return Err(VncError::Protocol(format!("bad WebSocket handshake: {e}")));
        }
    };

    if request.method != Some("GET") {
        return Err(VncError::Protocol("WebSocket handshake must be a GET".into()));
    }

    let mut key = None;
    let mut protocol_chat = false;
    let mut version13 = false;
    for header in request.headers.iter() {
        if header.name.eq_ignore_ascii_case("sec-websocket-key") {
            key = std::str::from_utf8(header.value).ok().map(str::trim);
        } else if header.name.eq_ignore_ascii_case("sec-websocket-protocol") {
            protocol_chat = header.value.split(|&b| b == b',').any(|part| {
                std::str::from_utf8(part).is_ok_and(|s| s.trim() == "chat")
            });
        } else if header.name.eq_ignore_ascii_case("sec-websocket-version") {
            version13 = header.value.trim_ascii() == b"13";
        }
    }

    let key = key.ok_or_else(|| {
        VncError::Protocol("WebSocket handshake without Sec-WebSocket-Key".into())
    })?;

    let mut response = String::with_capacity(192);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept_key(key)));
    if protocol_chat {
        response.push_str("Sec-WebSocket-Protocol: chat\r\n");
    }
    if version13 {
        response.push_str("Sec-WebSocket-Version: 13\r\n");
    }
    response.push_str("\r\n");

    Ok(HandshakeProgress::Done { response: Bytes::from(response), consumed })
}

/// Wraps a payload in a single unmasked binary frame.
#[must_use]
pub fn frame_binary(payload: &[u8]) -> Bytes {
    frame(OPCODE_BIN, payload)
}

fn frame(opcode: u8, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 10);
    out.put_u8(0x80 | opcode); // FIN set, no fragmentation on the way out
    if payload.len() < 126 {
        out.put_u8(payload.len() as u8);
    } else if payload.len() <= usize::from(u16::MAX) {
        out.put_u8(126);
        out.put_u16(payload.len() as u16);
    } else {
        out.put_u8(127);
        out.put_u64(payload.len() as u64);
    }
    out.put_slice(payload);
    out.freeze()
}

/// What the frame parser produced.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// A binary or continuation payload for the reader.
    Data(Vec<u8>),
    /// The peer pinged; answer with this PONG frame.
    Pong(Bytes),
    /// The peer closed the connection.
    RemoteClosed,
}

/// Incremental RFC 6455 frame parser.
#[derive(Default)]
pub struct FrameParser {
    /// Opcode of the fragmented message in progress, if any.
    fragment_opcode: Option<u8>,
}

impl FrameParser {
    /// Consumes as many complete frames from `buf` as possible.
    ///
    /// # Errors
    ///
    /// Protocol errors on reserved opcodes.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Vec<FrameEvent>> {
        let mut events = Vec::new();

        loop {
            let Some((header_len, fin, opcode, masked, payload_len, mask)) =
                peek_header(buf)?
            else {
                break;
            };

            if buf.len() < header_len + payload_len {
                break;
            }

            buf.advance(header_len);
            let mut payload = buf.split_to(payload_len).to_vec();
            if masked {
                for (i, byte) in payload.iter_mut().enumerate() {
                    *byte ^= mask[i % 4];
                }
            }

            match opcode {
                OPCODE_BIN => {
                    self.fragment_opcode = if fin { None } else { Some(OPCODE_BIN) };
                    events.push(FrameEvent::Data(payload));
                }
                OPCODE_TEXT => {
                    // Text frames have no meaning on an RFB socket.
                    self.fragment_opcode = if fin { None } else { Some(OPCODE_TEXT) };
                }
                OPCODE_CONT => match self.fragment_opcode {
                    Some(OPCODE_BIN) => {
                        if fin {
                            self.fragment_opcode = None;
                        }
                        events.push(FrameEvent::Data(payload));
                    }
                    Some(_) => {
                        if fin {
                            self.fragment_opcode = None;
                        }
                    }
                    None => {
                        return Err(VncError::Protocol(
                            "WebSocket continuation without a message".into(),
                        ));
                    }
                },
                OPCODE_PING => events.push(FrameEvent::Pong(frame(OPCODE_PONG, &payload))),
                OPCODE_PONG => {}
                OPCODE_CLOSE => {
                    events.push(FrameEvent::RemoteClosed);
                    break;
                }
                other => {
                    return Err(VncError::Protocol(format!(
                        "reserved WebSocket opcode {other:#x}"
                    )));
                }
            }
        }

        Ok(events)
    }
}

type Header = (usize, bool, u8, bool, usize, [u8; 4]);

/// Reads a frame header without consuming; `None` when incomplete.
fn peek_header(buf: &BytesMut) -> Result<Option<Header>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return Err(VncError::Protocol("WebSocket RSV bits set".into()));
    }
    let opcode = buf[0] & 0x0f;
    let masked = buf[1] & 0x80 != 0;
    let len7 = buf[1] & 0x7f;

    let (len, mut offset) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (usize::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(bytes) as usize, 10)
        }
        n => (usize::from(n), 2),
    };

    let mut mask = [0u8; 4];
    if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        mask.copy_from_slice(&buf[offset..offset + 4]);
        offset += 4;
    }

    Ok(Some((offset, fin, opcode, masked, len, mask)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn handshake_builds_101_response() {
        let request = b"GET /rfb HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
            Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";

        let HandshakeProgress::Done { response, consumed } =
            handle_handshake(request).unwrap()
        else {
            panic!("handshake incomplete");
        };

        assert_eq!(consumed, request.len());
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn handshake_without_key_fails() {
        let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(handle_handshake(request).is_err());
    }

    #[test]
    fn partial_handshake_asks_for_more() {
        let request = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(
            handle_handshake(request).unwrap(),
            HandshakeProgress::NeedMore
        ));
    }

    #[test]
    fn chat_subprotocol_is_echoed() {
        let request = b"GET / HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n\
            Sec-WebSocket-Protocol: chat\r\n\r\n";
        let HandshakeProgress::Done { response, .. } = handle_handshake(request).unwrap()
        else {
            panic!()
        };
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
    }

    #[test]
    fn masked_binary_frame_is_unmasked() {
        let payload = b"\x01\x02\x03\x04\x05";
        let mask = [0xaa, 0xbb, 0xcc, 0xdd];
        let mut frame = vec![0x82, 0x80 | payload.len() as u8];
        frame.extend_from_slice(&mask);
        for (i, &b) in payload.iter().enumerate() {
            frame.push(b ^ mask[i % 4]);
        }

        let mut parser = FrameParser::default();
        let mut buf = BytesMut::from(&frame[..]);
        let events = parser.parse(&mut buf).unwrap();
        assert_eq!(events, vec![FrameEvent::Data(payload.to_vec())]);
        assert!(buf.is_empty());
    }

    #[test]
    fn text_frames_are_dropped() {
        let mut buf = BytesMut::from(&[0x81u8, 0x02, b'h', b'i'][..]);
        let mut parser = FrameParser::default();
        assert!(parser.parse(&mut buf).unwrap().is_empty());
    }

    #[test]
    fn ping_produces_pong_with_same_payload() {
        let mut buf = BytesMut::from(&[0x89u8, 0x03, 1, 2, 3][..]);
        let mut parser = FrameParser::default();
        let events = parser.parse(&mut buf).unwrap();
        let FrameEvent::Pong(pong) = &events[0] else { panic!() };
        assert_eq!(&pong[..], &[0x8a, 0x03, 1, 2, 3]);
    }

    #[test]
    fn close_signals_remote_closed() {
        let mut buf = BytesMut::from(&[0x88u8, 0x00][..]);
        let mut parser = FrameParser::default();
        assert_eq!(parser.parse(&mut buf).unwrap(), vec![FrameEvent::RemoteClosed]);
    }

    #[test]
    fn fragmented_binary_message_delivers_both_parts() {
        // BIN without FIN, then CONT with FIN.
        let mut buf = BytesMut::from(&[0x02u8, 0x02, 1, 2, 0x80, 0x02, 3, 4][..]);
        let mut parser = FrameParser::default();
        let events = parser.parse(&mut buf).unwrap();
        assert_eq!(
            events,
            vec![FrameEvent::Data(vec![1, 2]), FrameEvent::Data(vec![3, 4])]
        );
    }

    #[test]
    fn outbound_frames_are_single_unmasked_binary() {
        let framed = frame_binary(&[9u8; 200]);
        assert_eq!(framed[0], 0x82);
        assert_eq!(framed[1], 126); // extended 16-bit length, no mask bit
        assert_eq!(u16::from_be_bytes([framed[2], framed[3]]), 200);
        assert_eq!(framed.len(), 4 + 200);
    }

    #[test]
    fn incomplete_frame_waits() {
        let mut buf = BytesMut::from(&[0x82u8, 0x05, 1, 2][..]);
        let mut parser = FrameParser::default();
        assert!(parser.parse(&mut buf).unwrap().is_empty());
        assert_eq!(buf.len(), 4);
    }
}
