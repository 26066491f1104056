// Copyright 2025 Dustin McAfee
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

//! VNC Authentication (RFB security type 2): DES challenge-response.
//!
//! The key derivation is a VNC-specific quirk, not plain DES: the password is zero-padded or
//! truncated to 8 bytes and each byte's bit order is reversed before it is used as the DES key.
//! The 16-byte server challenge is then encrypted in place as two independent 8-byte ECB blocks.

use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rand::RngCore;

use crate::error::{Result, VncError};

/// Length of a VNC auth challenge/response, in bytes.
pub const CHALLENGE_LEN: usize = 16;

/// Generates a fresh 16-byte random challenge for one authentication attempt.
pub fn generate_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Derives the 8-byte DES key VNC auth uses from a password: zero-padded/truncated to 8 bytes,
/// then each byte's bits reversed.
fn derive_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.as_bytes().iter()) {
        *slot = *byte;
    }
    for byte in &mut key {
        *byte = byte.reverse_bits();
    }
    key
}

/// Computes the expected 16-byte DES response for `password` and `challenge`.
///
/// This is a pure function so it can be tested directly without a socket: see RFB security
/// type 2 (the `VNCAuth` challenge-response).
#[must_use]
pub fn expected_response(password: &str, challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    let key = derive_key(password);
    let cipher = Des::new_from_slice(&key).expect("DES key is always 8 bytes");

    let mut result = *challenge;
    let (block0, block1) = result.split_at_mut(8);
    cipher.encrypt_block(block0.into());
    cipher.encrypt_block(block1.into());
    result
}

/// The outcome of a successful authentication: whether the connection is read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOutcome {
    /// `true` if the client authenticated with the read-only password.
    pub read_only: bool,
}

/// Verifies a client's DES response against the server's configured password(s).
///
/// The main password (if any) is tried first; if it doesn't match and a read-only password is
/// configured, that is tried next. Returns [`VncError::AuthFailure`] if neither matches, or if
/// no password is configured at all (VNCAuth without a password can never succeed).
pub fn verify(
    challenge: &[u8; CHALLENGE_LEN],
    response: &[u8; CHALLENGE_LEN],
    password: Option<&str>,
    read_only_password: Option<&str>,
) -> Result<AuthOutcome> {
    if let Some(password) = password {
        if expected_response(password, challenge) == *response {
            return Ok(AuthOutcome { read_only: false });
        }
    }
    if let Some(read_only_password) = read_only_password {
        if expected_response(read_only_password, challenge) == *response {
            return Ok(AuthOutcome { read_only: true });
        }
    }
    Err(VncError::AuthFailure)
}
