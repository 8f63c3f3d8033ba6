//! Password encoding for the connect request.
//!
//! A client never sends its password in the clear; it sends the output of
//! a [`CredentialEncoder`]. The server runs its own copy of the password
//! through the same encoder and compares. Both sides must agree on the
//! encoder, so it is pluggable rather than fixed.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

/// Turns a plaintext password into the token carried on the wire.
pub trait CredentialEncoder: Send + Sync {
    /// Encode `password`. Must be deterministic.
    fn encode(&self, password: &str) -> String;
}

/// Default encoder: base64 of the SHA-256 digest.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Encoder;

impl CredentialEncoder for Sha256Encoder {
    fn encode(&self, password: &str) -> String {
        BASE64.encode(Sha256::digest(password.as_bytes()))
    }
}

/// Constant-time comparison of two encoded tokens.
pub(crate) fn tokens_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
