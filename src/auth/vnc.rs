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

//! Classic VNC authentication: DES challenge-response.

use bytes::{Bytes, BytesMut};

use crate::crypto::{random_bytes, vnc_des_response};
use crate::stream::Stream;

/// Length of the challenge and of the expected response.
pub const CHALLENGE_LEN: usize = 16;

/// Starts the handshake: sends 16 random challenge bytes, which the caller
/// stores for verification.
pub fn begin(stream: &mut Stream) -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    random_bytes(&mut challenge);
    stream.send(Bytes::copy_from_slice(&challenge), None);
    challenge
}

/// Verifies the client's 16-byte response against the server password.
///
/// Returns `None` until the full response has arrived; then whether the
/// response matches the DES encryption of the challenge under the password.
#[must_use]
pub fn handle_response(
    buf: &mut BytesMut,
    challenge: &[u8; CHALLENGE_LEN],
    password: &str,
) -> Option<bool> {
    if buf.len() < CHALLENGE_LEN {
        return None;
    }
    let response = buf.split_to(CHALLENGE_LEN);
    let expected = vnc_des_response(password, challenge);
    Some(response[..] == expected[..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_response_is_accepted() {
        let challenge: [u8; 16] =
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vnc_des_response("testtest", &challenge));
        assert_eq!(handle_response(&mut buf, &challenge, "testtest"), Some(true));
    }

    #[test]
    fn any_bit_flip_is_rejected() {
        let challenge: [u8; 16] =
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
        let good = vnc_des_response("testtest", &challenge);

        for byte in 0..16 {
            for bit in 0..8 {
                let mut bad = good;
                bad[byte] ^= 1 << bit;
                let mut buf = BytesMut::new();
                buf.extend_from_slice(&bad);
                assert_eq!(
                    handle_response(&mut buf, &challenge, "testtest"),
                    Some(false),
                    "flip at {byte}:{bit} must fail"
                );
            }
        }
    }

    #[test]
    fn partial_response_waits() {
        let challenge = [0u8; 16];
        let mut buf = BytesMut::from(&[0u8; 15][..]);
        assert_eq!(handle_response(&mut buf, &challenge, "pw"), None);
        assert_eq!(buf.len(), 15);
    }
}
