//! Sealed sign-in tokens.
//!
//! A token carries a challenge id through the identity holder's terminal and
//! back. Format: `[24-byte nonce][XChaCha20-Poly1305 ciphertext of uvarint(id)]`.
//! Tokens are hex-encoded when placed on a command line.

use crate::codec::{put_uvarint, read_uvarint};
use crate::error::{LoginError, LoginResult, TokenError};
use crate::keys::KeyMaterial;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ring::rand::{SecureRandom, SystemRandom};

/// Nonce length prepended to every token.
pub const NONCE_LEN: usize = 24;

/// Shortest acceptable token: a nonce plus at least one ciphertext byte.
pub const MIN_TOKEN_LEN: usize = NONCE_LEN + 1;

/// Seals and opens challenge ids under the process key.
pub struct TokenCodec {
    cipher: XChaCha20Poly1305,
    rng: SystemRandom,
}

impl TokenCodec {
    pub fn new(key: &KeyMaterial) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
            rng: SystemRandom::new(),
        }
    }

    /// Seal a challenge id into a token.
    ///
    /// Fails only if the system random source fails.
    pub fn seal(&self, id: u64) -> LoginResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| LoginError::Random)?;

        let plaintext = put_uvarint(id);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| LoginError::Other("token encryption failed".into()))?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        Ok(token)
    }

    /// Open a token, returning the challenge id it carries.
    pub fn open(&self, token: &[u8]) -> Result<u64, TokenError> {
        if token.len() < MIN_TOKEN_LEN {
            return Err(TokenError::InvalidLength);
        }

        let (nonce, ciphertext) = token.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| TokenError::DecryptFailed)?;

        match read_uvarint(&plaintext) {
            Some((id, n)) if n > 0 => Ok(id),
            _ => Err(TokenError::MalformedId),
        }
    }

    /// Seal and hex-encode, as placed on a command line.
    pub fn seal_hex(&self, id: u64) -> LoginResult<String> {
        self.seal(id).map(hex::encode)
    }

    /// Hex-decode and open a token taken from a command line.
    pub fn open_hex(&self, token: &str) -> Result<u64, TokenError> {
        let bytes = hex::decode(token.trim()).map_err(|_| TokenError::InvalidEncoding)?;
        self.open(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(&KeyMaterial::generate().unwrap())
    }

    #[test]
    fn seal_and_open() {
        let c = codec();
        for id in [0, 1, 127, 128, 99_999, u64::MAX] {
            let token = c.seal(id).unwrap();
            assert_eq!(c.open(&token).unwrap(), id);
        }
    }

    #[test]
    fn nonces_are_fresh() {
        let c = codec();
        let a = c.seal(7).unwrap();
        let b = c.seal(7).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn token_length() {
        // uvarint(5) is one byte, plus the 16-byte tag.
        let token = codec().seal(5).unwrap();
        assert_eq!(token.len(), NONCE_LEN + 1 + 16);
    }

    #[test]
    fn bit_flips_fail_to_decrypt() {
        let c = codec();
        let token = c.seal(42).unwrap();
        for byte in 0..token.len() {
            for bit in 0..8 {
                let mut tampered = token.clone();
                tampered[byte] ^= 1 << bit;
                assert_eq!(c.open(&tampered), Err(TokenError::DecryptFailed));
            }
        }
    }

    #[test]
    fn wrong_key() {
        let token = codec().seal(3).unwrap();
        assert_eq!(codec().open(&token), Err(TokenError::DecryptFailed));
    }

    #[test]
    fn short_tokens_are_invalid_length() {
        let c = codec();
        for len in 0..MIN_TOKEN_LEN {
            assert_eq!(c.open(&vec![0xAA; len]), Err(TokenError::InvalidLength));
        }
        let real = c.seal(1).unwrap();
        assert_eq!(c.open(&real[..NONCE_LEN]), Err(TokenError::InvalidLength));
    }

    #[test]
    fn garbage_fails_to_decrypt() {
        assert_eq!(codec().open(&[0u8; 64]), Err(TokenError::DecryptFailed));
    }

    #[test]
    fn sealed_non_varint_is_malformed() {
        let key = KeyMaterial::generate().unwrap();
        let c = TokenCodec::new(&key);
        let nonce = [9u8; NONCE_LEN];
        let ct = c
            .cipher
            .encrypt(XNonce::from_slice(&nonce), [0x80u8].as_slice())
            .unwrap();
        let mut token = nonce.to_vec();
        token.extend_from_slice(&ct);
        assert_eq!(c.open(&token), Err(TokenError::MalformedId));
    }

    #[test]
    fn hex_helpers() {
        let c = codec();
        let hex_token = c.seal_hex(11).unwrap();
        assert_eq!(c.open_hex(&hex_token).unwrap(), 11);
        assert_eq!(c.open_hex(&format!("{hex_token}\n")).unwrap(), 11);
        assert_eq!(c.open_hex("not-hex"), Err(TokenError::InvalidEncoding));
    }
}
