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

//! Apple Diffie-Hellman authentication (macOS Screen Sharing).
//!
//! The server sends its DH parameters and ephemeral public key; the client
//! answers with its own public key and a 128-byte credential block encrypted
//! with AES-128-ECB under the MD5 of the shared secret. Username and
//! password sit in two null-terminated 64-byte halves.

use bytes::{Buf, BufMut, BytesMut};

use crate::crypto::{aes128_ecb_decrypt, hash_many, DhSecret, HashType, DH_KEY_LEN};
use crate::error::Result;
use crate::stream::Stream;

/// Size of the encrypted credential block.
pub const CREDENTIAL_LEN: usize = 128;

/// Starts the handshake: sends generator, key size, modulus and the
/// server's ephemeral public key. The secret is kept for the response.
pub fn begin(stream: &mut Stream) -> DhSecret {
    let secret = DhSecret::generate();

    let mut msg = BytesMut::with_capacity(4 + DH_KEY_LEN * 2);
    msg.put_u16(secret.generator());
    msg.put_u16(DH_KEY_LEN as u16);
    msg.put_slice(&secret.modulus_bytes());
    msg.put_slice(&secret.public_key());
    stream.send(msg.freeze(), None);

    secret
}

/// Handles the client's response: public key plus encrypted credentials.
///
/// Returns `None` until the fixed-size response has fully arrived, then the
/// decrypted username and password.
///
/// # Errors
///
/// Propagates cipher failures.
pub fn handle_response(
    buf: &mut BytesMut,
    secret: &DhSecret,
) -> Result<Option<(String, String)>> {
    if buf.len() < DH_KEY_LEN + CREDENTIAL_LEN {
        return Ok(None);
    }

    let client_public = buf.split_to(DH_KEY_LEN);
    let mut credentials = [0u8; CREDENTIAL_LEN];
    credentials.copy_from_slice(&buf[..CREDENTIAL_LEN]);
    buf.advance(CREDENTIAL_LEN);

    let shared = secret.shared_secret(&client_public);

    let mut key = [0u8; 16];
    hash_many(HashType::Md5, &[&shared], &mut key);
    aes128_ecb_decrypt(&key, &mut credentials)?;

    let username = c_string(&credentials[..CREDENTIAL_LEN / 2]);
    let password = c_string(&credentials[CREDENTIAL_LEN / 2..]);
    Ok(Some((username, password)))
}

/// Extracts a null-terminated UTF-8 string from a fixed buffer.
fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::{BlockEncrypt, KeyInit};
    use aes::Aes128;
    use cipher::generic_array::GenericArray;

    fn encrypt_credentials(key: &[u8; 16], user: &str, pass: &str) -> [u8; CREDENTIAL_LEN] {
        let mut block = [0u8; CREDENTIAL_LEN];
        block[..user.len()].copy_from_slice(user.as_bytes());
        block[64..64 + pass.len()].copy_from_slice(pass.as_bytes());

        let cipher = Aes128::new_from_slice(key).unwrap();
        for chunk in block.chunks_exact_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        block
    }

    #[test]
    fn full_exchange_recovers_credentials() {
        let server = DhSecret::generate();
        let client = DhSecret::generate();

        // Client side: derive the AES key from the shared secret.
        let shared = client.shared_secret(&server.public_key());
        let mut key = [0u8; 16];
        hash_many(HashType::Md5, &[&shared], &mut key);

        let mut buf = BytesMut::new();
        buf.put_slice(&client.public_key());
        buf.put_slice(&encrypt_credentials(&key, "carol", "hunter2"));

        let (user, pass) = handle_response(&mut buf, &server).unwrap().unwrap();
        assert_eq!(user, "carol");
        assert_eq!(pass, "hunter2");
        assert!(buf.is_empty());
    }

    #[test]
    fn short_response_waits() {
        let server = DhSecret::generate();
        let mut buf = BytesMut::from(&[0u8; DH_KEY_LEN + CREDENTIAL_LEN - 1][..]);
        assert!(handle_response(&mut buf, &server).unwrap().is_none());
        assert_eq!(buf.len(), DH_KEY_LEN + CREDENTIAL_LEN - 1);
    }
}
