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

//! VeNCrypt security negotiation, subtype X509Plain only.
//!
//! Flow: the server sends version 0.2, the client echoes it, the server
//! acknowledges and lists X509Plain, the client picks it, the stream
//! upgrades to TLS, and a plain username/password credential pair arrives
//! over the encrypted channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::VENCRYPT_X509_PLAIN;
use crate::stream::Stream;

/// Credential length cap, matching the message's 8-bit-ish practical limits.
const MAX_CRED_LEN: usize = 255;

/// Starts the handshake by sending the VeNCrypt version.
pub fn begin(stream: &mut Stream) {
    stream.send(Bytes::from_static(&[0, 2]), None);
}

/// Handles the client's version echo.
///
/// `None` until two bytes arrived; then `Ok(())` with the subtype list sent,
/// or the rejection reason.
#[must_use]
pub fn handle_version(buf: &mut BytesMut, stream: &mut Stream) -> Option<Result<(), String>> {
    if buf.len() < 2 {
        return None;
    }
    let major = buf.get_u8();
    let minor = buf.get_u8();

    if (major, minor) != (0, 2) {
        return Some(Err(format!("unsupported VeNCrypt version {major}.{minor}")));
    }

    // Ack byte, then the subtype list: count + one u32 per subtype.
    let mut msg = BytesMut::with_capacity(6);
    msg.put_u8(0);
    msg.put_u8(1);
    msg.put_u32(VENCRYPT_X509_PLAIN);
    stream.send(msg.freeze(), None);
    Some(Ok(()))
}

/// Handles the client's subtype choice.
///
/// `None` until four bytes arrived; `Ok(true)` means X509Plain was chosen
/// and acknowledged (the caller upgrades to TLS next), `Ok(false)` means
/// the choice was rejected and the connection should close.
#[must_use]
pub fn handle_subtype(buf: &mut BytesMut, stream: &mut Stream) -> Option<bool> {
    if buf.len() < 4 {
        return None;
    }
    let subtype = buf.get_u32();

    if subtype != VENCRYPT_X509_PLAIN {
        stream.send(Bytes::from_static(&[0]), None);
        return Some(false);
    }

    stream.send(Bytes::from_static(&[1]), None);
    Some(true)
}

/// Parses the plain-auth credentials sent after the TLS upgrade.
///
/// `None` until the whole message arrived; then the username and password,
/// each truncated to 255 bytes as the handshake caps them.
#[must_use]
pub fn handle_plain_auth(buf: &mut BytesMut) -> Option<(String, String)> {
    if buf.len() < 8 {
        return None;
    }
    let ulen = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let plen = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if buf.len() < 8 + ulen + plen {
        return None;
    }

    buf.advance(8);
    let user_bytes = buf.split_to(ulen);
    let pass_bytes = buf.split_to(plen);

    let username =
        String::from_utf8_lossy(&user_bytes[..ulen.min(MAX_CRED_LEN)]).into_owned();
    let password =
        String::from_utf8_lossy(&pass_bytes[..plen.min(MAX_CRED_LEN)]).into_owned();
    Some((username, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_auth_parses_credentials() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u32(6);
        buf.put_slice(b"alice");
        buf.put_slice(b"secret");

        let (user, pass) = handle_plain_auth(&mut buf).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "secret");
        assert!(buf.is_empty());
    }

    #[test]
    fn plain_auth_waits_for_whole_message() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u32(6);
        buf.put_slice(b"ali");
        assert!(handle_plain_auth(&mut buf).is_none());
    }

    #[test]
    fn oversized_credentials_are_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u32(300);
        buf.put_u32(0);
        buf.put_slice(&vec![b'a'; 300]);

        let (user, pass) = handle_plain_auth(&mut buf).unwrap();
        assert_eq!(user.len(), 255);
        assert!(pass.is_empty());
    }
}
