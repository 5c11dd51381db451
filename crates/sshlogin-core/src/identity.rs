//! Public key identity helpers.

use ssh_key::{HashAlg, PublicKey};

/// OpenSSH-style SHA-256 fingerprint (`SHA256:...`) for logs and display.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

#[cfg(test)]
pub(crate) fn test_key(seed: u8) -> PublicKey {
    use ssh_key::public::{Ed25519PublicKey, KeyData};
    PublicKey::new(KeyData::Ed25519(Ed25519PublicKey([seed; 32])), "test")
}
