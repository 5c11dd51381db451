//! Server host key: load from an OpenSSH private key file, or create one.

use anyhow::Context;
use rand::rngs::OsRng;
use russh_keys::key::KeyPair;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use std::path::Path;
use tracing::info;

/// Load the host key at `path`.
pub fn load(path: &Path) -> anyhow::Result<KeyPair> {
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("cannot load host key {}", path.display()))
}

/// Load the host key at `path`, generating an Ed25519 key there first if the
/// file does not exist.
pub fn load_or_generate(path: &Path) -> anyhow::Result<KeyPair> {
    if !path.exists() {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .context("host key generation failed")?;
        key.write_openssh_file(path, LineEnding::LF)
            .with_context(|| format!("cannot write host key {}", path.display()))?;
        restrict_permissions(path)?;
        info!(
            path = %path.display(),
            fingerprint = %sshlogin_core::fingerprint(key.public_key()),
            "generated host key"
        );
    }
    load(path)
}

/// A fresh in-memory Ed25519 host key.
pub fn generate_keypair() -> anyhow::Result<KeyPair> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("host key generation failed")?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .context("host key encoding failed")?;
    russh_keys::decode_secret_key(&pem, None).context("host key decoding failed")
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("cannot restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
