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

//! Framed record layer for the RSA-AES security types.
//!
//! After the RSA-AES handshake both directions switch to length-prefixed
//! AES-EAX records: a 2-byte big-endian plaintext length, the ciphertext
//! (same length), and a 16-byte tag. The length bytes are authenticated as
//! associated data and each direction's nonce is a 128-bit counter that
//! advances by one per record. A tag mismatch is fatal to the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::AeadCipher;
use crate::error::{Result, VncError};

/// EAX tag length in bytes.
const TAG_LEN: usize = 16;

/// Largest plaintext carried in one record.
const MAX_RECORD_PAYLOAD: usize = 8192;

/// Stateful record codec wrapping an [`AeadCipher`].
pub struct RecordCodec {
    cipher: AeadCipher,
}

impl RecordCodec {
    /// Wraps the session cipher.
    #[must_use]
    pub fn new(cipher: AeadCipher) -> Self {
        Self { cipher }
    }

    /// Encrypts a payload into one or more framed records.
    ///
    /// # Errors
    ///
    /// Propagates cipher failures.
    pub fn seal(&mut self, payload: &[u8]) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(payload.len() + 64);
        for chunk in payload.chunks(MAX_RECORD_PAYLOAD) {
            let len = (chunk.len() as u16).to_be_bytes();
            let sealed = self.cipher.encrypt(&len, chunk)?;
            out.put_slice(&len);
            out.put_slice(&sealed);
        }
        Ok(out.freeze())
    }

    /// Decrypts every complete record available in `raw`, appending the
    /// plaintext to `plain`. Partial trailing records stay in `raw`.
    ///
    /// # Errors
    ///
    /// [`VncError::BadMessageAuthentication`] when a record fails to verify;
    /// the stream must be torn down.
    pub fn open(&mut self, raw: &mut BytesMut, plain: &mut BytesMut) -> Result<()> {
        loop {
            if raw.len() < 2 {
                return Ok(());
            }
            let len = usize::from(u16::from_be_bytes([raw[0], raw[1]]));
            if raw.len() < 2 + len + TAG_LEN {
                return Ok(());
            }

            let ad = [raw[0], raw[1]];
            raw.advance(2);
            let sealed = raw.split_to(len + TAG_LEN);
            let opened = self.cipher.decrypt(&ad, &sealed)?;
            if opened.len() != len {
                return Err(VncError::BadMessageAuthentication);
            }
            plain.put_slice(&opened);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AeadCipher, AeadCipherType};

    fn pair() -> (RecordCodec, RecordCodec) {
        let server_key = [1u8; 16];
        let client_key = [2u8; 16];
        let server =
            AeadCipher::new(AeadCipherType::Aes128Eax, &server_key, &client_key).unwrap();
        let client =
            AeadCipher::new(AeadCipherType::Aes128Eax, &client_key, &server_key).unwrap();
        (RecordCodec::new(server), RecordCodec::new(client))
    }

    #[test]
    fn seal_open_round_trip() {
        let (mut server, mut client) = pair();
        let sealed = server.seal(b"framebuffer update").unwrap();

        let mut raw = BytesMut::from(&sealed[..]);
        let mut plain = BytesMut::new();
        client.open(&mut raw, &mut plain).unwrap();
        assert_eq!(&plain[..], b"framebuffer update");
        assert!(raw.is_empty());
    }

    #[test]
    fn record_layout_is_len_ciphertext_tag() {
        let (mut server, _) = pair();
        let sealed = server.seal(b"abc").unwrap();
        assert_eq!(u16::from_be_bytes([sealed[0], sealed[1]]), 3);
        assert_eq!(sealed.len(), 2 + 3 + TAG_LEN);
    }

    #[test]
    fn large_payloads_split_into_records() {
        let (mut server, mut client) = pair();
        let payload = vec![0x5au8; MAX_RECORD_PAYLOAD * 2 + 100];
        let sealed = server.seal(&payload).unwrap();

        let mut raw = BytesMut::from(&sealed[..]);
        let mut plain = BytesMut::new();
        client.open(&mut raw, &mut plain).unwrap();
        assert_eq!(&plain[..], &payload[..]);
    }

    #[test]
    fn partial_record_waits_for_more() {
        let (mut server, mut client) = pair();
        let sealed = server.seal(b"hello").unwrap();

        let mut raw = BytesMut::from(&sealed[..sealed.len() - 1]);
        let mut plain = BytesMut::new();
        client.open(&mut raw, &mut plain).unwrap();
        assert!(plain.is_empty());

        raw.put_slice(&sealed[sealed.len() - 1..]);
        client.open(&mut raw, &mut plain).unwrap();
        assert_eq!(&plain[..], b"hello");
    }

    #[test]
    fn tampered_length_fails_authentication() {
        let (mut server, mut client) = pair();
        let sealed = server.seal(b"hello").unwrap();

        let mut bytes = sealed.to_vec();
        bytes[4] ^= 0x01; // flip a ciphertext bit
        let mut raw = BytesMut::from(&bytes[..]);
        let mut plain = BytesMut::new();
        assert!(matches!(
            client.open(&mut raw, &mut plain),
            Err(VncError::BadMessageAuthentication)
        ));
    }
}
