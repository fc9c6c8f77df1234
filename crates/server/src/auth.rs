//! Shared-token authentication.
//!
//! The token is distributed out-of-band and kept in memory only.
//! Verification hashes both sides before comparing so the comparison is
//! constant-time regardless of what the client sent.

use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub struct AuthToken {
    token: String,
}

impl AuthToken {
    /// Use the configured token, or generate a fresh one.
    pub fn from_config(configured: Option<String>) -> Self {
        match configured {
            Some(token) => Self { token },
            None => Self::generate(),
        }
    }

    /// 32 cryptographically random bytes, base64-encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { token: base64::engine::general_purpose::STANDARD.encode(bytes) }
    }

    /// The token itself, for display at startup.
    pub fn reveal(&self) -> &str {
        &self.token
    }

    pub fn verify(&self, provided: &str) -> bool {
        let expected = Sha256::digest(self.token.as_bytes());
        let provided = Sha256::digest(provided.as_bytes());
        expected.ct_eq(&provided).into()
    }
}
