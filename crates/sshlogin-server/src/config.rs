//! Server configuration: TOML file + CLI overrides.

use anyhow::{bail, Context};
use serde::Deserialize;
use sshlogin_core::broker::{DEFAULT_SIGNIN_USER, DEFAULT_TTL, MAX_TTL};
use sshlogin_core::BrokerConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub signin: SigninSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host_key")]
    pub host_key: String,
    /// Host name placed in issued sign-in commands.
    #[serde(default = "default_public_host")]
    pub public_host: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            host_key: default_host_key(),
            public_host: default_public_host(),
        }
    }
}

/// `[signin]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SigninSection {
    #[serde(default = "default_user")]
    pub user: String,
    /// Challenge lifetime in seconds.
    #[serde(default = "default_ttl")]
    pub challenge_ttl: u64,
    /// Session (authenticated key) lifetime in seconds.
    #[serde(default = "default_ttl")]
    pub session_ttl: u64,
}

impl Default for SigninSection {
    fn default() -> Self {
        Self {
            user: default_user(),
            challenge_ttl: default_ttl(),
            session_ttl: default_ttl(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    2222
}
fn default_host_key() -> String {
    "~/.sshlogin/host_ed25519".to_string()
}
fn default_public_host() -> String {
    "localhost".to_string()
}
fn default_user() -> String {
    DEFAULT_SIGNIN_USER.to_string()
}
fn default_ttl() -> u64 {
    DEFAULT_TTL.as_secs()
}

/// CLI values that override the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub host_key: Option<String>,
    pub public_host: Option<String>,
    pub challenge_ttl: Option<u64>,
    pub session_ttl: Option<u64>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub host_key_path: PathBuf,
    pub public_host: String,
    pub broker: BrokerConfig,
}

impl ServerConfig {
    /// Load config from a TOML file (if it exists), then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> anyhow::Result<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)
                        .with_context(|| format!("cannot read {}", expanded.display()))?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::merge(file_config, overrides)
    }

    fn merge(file: ConfigFile, cli: Overrides) -> anyhow::Result<Self> {
        let bind = cli.bind.unwrap_or(file.server.bind);
        let port = cli.port.unwrap_or(file.server.port);
        let host_key = cli.host_key.unwrap_or(file.server.host_key);
        let challenge_ttl = ttl(
            "challenge_ttl",
            cli.challenge_ttl.unwrap_or(file.signin.challenge_ttl),
        )?;
        let session_ttl = ttl(
            "session_ttl",
            cli.session_ttl.unwrap_or(file.signin.session_ttl),
        )?;

        Ok(Self {
            listen: SocketAddr::new(bind, port),
            host_key_path: expand_tilde_str(&host_key),
            public_host: cli.public_host.unwrap_or(file.server.public_host),
            broker: BrokerConfig {
                challenge_ttl,
                session_ttl,
                signin_user: file.signin.user,
            },
        })
    }
}

/// A TTL in seconds, between one second and [`MAX_TTL`].
fn ttl(name: &str, secs: u64) -> anyhow::Result<Duration> {
    if secs == 0 || secs > MAX_TTL.as_secs() {
        bail!(
            "{name} must be between 1 and {} seconds, got {secs}",
            MAX_TTL.as_secs()
        );
    }
    Ok(Duration::from_secs(secs))
}

fn parse(content: &str) -> anyhow::Result<ConfigFile> {
    toml::from_str::<ConfigFile>(content).context("config parse error")
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
