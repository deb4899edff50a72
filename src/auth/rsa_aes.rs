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

//! The RSA-AES security types (RA2 and RA2-256).
//!
//! Both peers exchange RSA public keys and RSA-encrypted random challenges,
//! derive AES session keys from hashes of the two randoms, switch the stream
//! to AES-EAX records, and bind the key exchange by exchanging hashes over
//! both public keys. Credentials then travel over the encrypted channel.
//!
//! RA2 uses 16-byte randoms, SHA-1 and AES-128; RA2-256 uses 32-byte
//! randoms, SHA-256 and AES-256.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::{hash_many, random_bytes, AeadCipherType, RsaKeyPair, RsaPeerKey};
use crate::error::{Result, VncError};
use crate::stream::Stream;

/// Per-connection RSA-AES handshake state.
pub struct RsaAesState {
    /// Negotiated cipher (from the chosen security type).
    pub cipher: AeadCipherType,
    /// The server's random challenge.
    pub challenge: Vec<u8>,
    /// The client's public key, once received.
    pub peer_key: Option<RsaPeerKey>,
}

/// Session keys and key-binding hashes derived from the challenge exchange.
pub struct SessionKeys {
    /// Key for server-to-client records.
    pub enc_key: Vec<u8>,
    /// Key for client-to-server records.
    pub dec_key: Vec<u8>,
    /// Hash the server sends to bind the key exchange.
    pub server_hash: Vec<u8>,
    /// Hash the client is expected to send back.
    pub client_hash: Vec<u8>,
}

/// Starts the handshake by sending the server's public key:
/// a 32-bit key length in bits, then modulus and exponent, each padded to
/// the key length in bytes.
pub fn begin(stream: &mut Stream, keys: &RsaKeyPair, cipher: AeadCipherType) -> RsaAesState {
    let key_len = keys.key_len();
    let mut msg = BytesMut::with_capacity(4 + key_len * 2);
    msg.put_u32((key_len * 8) as u32);
    msg.put_slice(&keys.modulus_bytes(key_len));
    msg.put_slice(&keys.exponent_bytes(key_len));
    stream.send(msg.freeze(), None);

    let mut challenge = vec![0u8; cipher.key_len()];
    random_bytes(&mut challenge);

    RsaAesState { cipher, challenge, peer_key: None }
}

/// Handles the client's public key message and sends the RSA-encrypted
/// server challenge.
///
/// Returns `Ok(None)` until the whole message has arrived.
///
/// # Errors
///
/// Fails on unusable client keys.
pub fn handle_public_key(
    buf: &mut BytesMut,
    state: &mut RsaAesState,
    stream: &mut Stream,
) -> Result<Option<()>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let bit_length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let byte_length = bit_length.div_ceil(8);
    if byte_length == 0 || byte_length > 1024 {
        return Err(VncError::Protocol(format!(
            "unreasonable RSA key length {bit_length} bits"
        )));
    }
    if buf.len() < 4 + byte_length * 2 {
        return Ok(None);
    }

    buf.advance(4);
    let modulus = buf.split_to(byte_length);
    let exponent = buf.split_to(byte_length);
    let peer = RsaPeerKey::import(&modulus, &exponent)?;

    let encrypted = peer.encrypt(&state.challenge)?;
    let mut msg = BytesMut::with_capacity(2 + encrypted.len());
    msg.put_u16(encrypted.len() as u16);
    msg.put_slice(&encrypted);
    stream.send(msg.freeze(), None);

    state.peer_key = Some(peer);
    Ok(Some(()))
}

/// Handles the client's RSA-encrypted challenge and derives session keys.
///
/// Returns `Ok(None)` until the whole message has arrived. The caller
/// upgrades the stream with the keys and sends `server_hash`.
///
/// # Errors
///
/// Fails when the challenge cannot be decrypted.
pub fn handle_challenge(
    buf: &mut BytesMut,
    state: &RsaAesState,
    server_keys: &RsaKeyPair,
) -> Result<Option<SessionKeys>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let length = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
    if buf.len() < 2 + length {
        return Ok(None);
    }

    buf.advance(2);
    let ciphertext = buf.split_to(length);
    let decrypted = server_keys.decrypt(&ciphertext)?;
    if decrypted.len() != state.challenge.len() {
        return Err(VncError::Crypto("client random has the wrong length".into()));
    }
    let client_random = decrypted;

    let hash_type = state.cipher.hash_type();
    let key_len = state.cipher.key_len();

    // ClientSessionKey = H(ServerRandom || ClientRandom), truncated;
    // ServerSessionKey = H(ClientRandom || ServerRandom), truncated.
    let mut client_session_key = vec![0u8; key_len];
    hash_many(hash_type, &[&state.challenge, &client_random], &mut client_session_key);
    let mut server_session_key = vec![0u8; key_len];
    hash_many(hash_type, &[&client_random, &state.challenge], &mut server_session_key);

    let peer = state.peer_key.as_ref().ok_or_else(|| {
        VncError::InvalidOperation("challenge before client public key".into())
    })?;

    let server_len = server_keys.key_len();
    let client_len = peer.key_len();
    let server_len_be = ((server_len * 8) as u32).to_be_bytes();
    let client_len_be = ((client_len * 8) as u32).to_be_bytes();
    let server_modulus = server_keys.modulus_bytes(server_len);
    let server_exponent = server_keys.exponent_bytes(server_len);
    let client_modulus = peer.modulus_bytes(client_len);
    let client_exponent = peer.exponent_bytes(client_len);

    let mut server_hash = vec![0u8; hash_type.len()];
    hash_many(
        hash_type,
        &[
            &server_len_be,
            &server_modulus,
            &server_exponent,
            &client_len_be,
            &client_modulus,
            &client_exponent,
        ],
        &mut server_hash,
    );

    let mut client_hash = vec![0u8; hash_type.len()];
    hash_many(
        hash_type,
        &[
            &client_len_be,
            &client_modulus,
            &client_exponent,
            &server_len_be,
            &server_modulus,
            &server_exponent,
        ],
        &mut client_hash,
    );

    Ok(Some(SessionKeys {
        enc_key: server_session_key,
        dec_key: client_session_key,
        server_hash,
        client_hash,
    }))
}

/// Verifies the client's key-binding hash.
///
/// Returns `None` until enough bytes arrived.
#[must_use]
pub fn handle_client_hash(buf: &mut BytesMut, expected: &[u8]) -> Option<bool> {
    if buf.len() < expected.len() {
        return None;
    }
    let received = buf.split_to(expected.len());
    Some(received[..] == *expected)
}

/// Sends the credential subtype request (username and password).
pub fn request_credentials(stream: &mut Stream) {
    stream.send(
        Bytes::from_static(&[crate::protocol::RSA_AES_CRED_SUBTYPE_USER_AND_PASS]),
        None,
    );
}

/// Parses the credential message: `u8 ulen, ulen bytes, u8 plen, plen bytes`.
///
/// Returns `None` until the whole message arrived.
#[must_use]
pub fn handle_credentials(buf: &mut BytesMut) -> Option<(String, String)> {
    if buf.is_empty() {
        return None;
    }
    let ulen = usize::from(buf[0]);
    if buf.len() < 1 + ulen + 1 {
        return None;
    }
    let plen = usize::from(buf[1 + ulen]);
    if buf.len() < 2 + ulen + plen {
        return None;
    }

    buf.advance(1);
    let user = buf.split_to(ulen);
    buf.advance(1);
    let pass = buf.split_to(plen);

    Some((
        String::from_utf8_lossy(&user).into_owned(),
        String::from_utf8_lossy(&pass).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_parse() {
        let mut buf = BytesMut::new();
        buf.put_u8(3);
        buf.put_slice(b"bob");
        buf.put_u8(4);
        buf.put_slice(b"pass");

        let (user, pass) = handle_credentials(&mut buf).unwrap();
        assert_eq!(user, "bob");
        assert_eq!(pass, "pass");
        assert!(buf.is_empty());
    }

    #[test]
    fn credentials_wait_for_both_fields() {
        let mut buf = BytesMut::new();
        buf.put_u8(3);
        buf.put_slice(b"bo");
        assert!(handle_credentials(&mut buf).is_none());

        buf.put_slice(b"b");
        assert!(handle_credentials(&mut buf).is_none()); // plen byte missing

        buf.put_u8(2);
        buf.put_slice(b"p");
        assert!(handle_credentials(&mut buf).is_none());

        buf.put_slice(b"w");
        assert!(handle_credentials(&mut buf).is_some());
    }

    #[test]
    fn client_hash_compares_exactly() {
        let expected = [7u8; 20];
        let mut buf = BytesMut::from(&expected[..]);
        assert_eq!(handle_client_hash(&mut buf, &expected), Some(true));

        let mut wrong = expected;
        wrong[3] ^= 1;
        let mut buf = BytesMut::from(&wrong[..]);
        assert_eq!(handle_client_hash(&mut buf, &expected), Some(false));
    }

    #[test]
    fn session_key_derivation_is_directional() {
        // Derivation must differ between directions for the same randoms.
        let server_random = [1u8; 16];
        let client_random = [2u8; 16];
        let mut a = vec![0u8; 16];
        hash_many(
            crate::crypto::HashType::Sha1,
            &[&server_random, &client_random],
            &mut a,
        );
        let mut b = vec![0u8; 16];
        hash_many(
            crate::crypto::HashType::Sha1,
            &[&client_random, &server_random],
            &mut b,
        );
        assert_ne!(a, b);
    }
}
