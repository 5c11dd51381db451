//! Process-lifetime symmetric key for sealing sign-in tokens.
//!
//! One random 32-byte key is drawn from the OS CSPRNG at startup and used for
//! both sealing and opening. Nothing is persisted: tokens issued before a
//! restart stop opening after it.

use crate::error::{LoginError, LoginResult};
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;

/// Key size in bytes (XChaCha20-Poly1305).
pub const KEY_LEN: usize = 32;

/// The symmetric secret shared by [`crate::token::TokenCodec`] seal and open.
#[derive(Clone)]
pub struct KeyMaterial {
    key: [u8; KEY_LEN],
}

impl KeyMaterial {
    /// Generate a fresh random key.
    pub fn generate() -> LoginResult<Self> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| LoginError::Random)?;
        Ok(Self { key })
    }

    /// Wrap existing key bytes.
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}
