//! The sign-in broker: issues challenges and owns the shared state.
//!
//! Owns the token codec (and with it the process key), the challenge and
//! session registries, and the error sink. Connection handling lives in
//! [`crate::connection`], the accept loop in [`crate::listener`].

use crate::challenge::{ChallengeRegistry, IssuedChallenge};
use crate::error::{log_errors, ErrorSink, LoginError, LoginResult};
use crate::keys::KeyMaterial;
use crate::session::SessionRegistry;
use crate::token::TokenCodec;
use ssh_key::PublicKey;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tracing::info;

/// User name that gates the sign-in command.
pub const DEFAULT_SIGNIN_USER: &str = "signin";

/// Default lifetime of challenges and sessions.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Longest lifetime the registries accept; longer TTLs are clamped to it.
pub const MAX_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub challenge_ttl: Duration,
    pub session_ttl: Duration,
    /// Only connections authenticated as this user may redeem tokens.
    pub signin_user: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            challenge_ttl: DEFAULT_TTL,
            session_ttl: DEFAULT_TTL,
            signin_user: DEFAULT_SIGNIN_USER.to_string(),
        }
    }
}

/// A command line for the identity holder to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigninCommand {
    /// `ssh signin@<host> <hex token>`
    pub command: String,
    pub challenge_id: u64,
    pub expires_at: SystemTime,
}

impl fmt::Display for SigninCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)
    }
}

/// Waits for the key that completes a sign-in.
#[derive(Debug)]
pub struct PendingSignin {
    pub challenge_id: u64,
    pub expires_at: SystemTime,
    result: oneshot::Receiver<PublicKey>,
}

impl PendingSignin {
    /// Resolves with the authenticated key, or [`LoginError::NotFound`] once
    /// the challenge expires unredeemed.
    pub async fn wait(self) -> LoginResult<PublicKey> {
        self.result.await.map_err(|_| LoginError::NotFound)
    }
}

/// Passwordless SSH sign-in broker.
pub struct SigninBroker {
    config: BrokerConfig,
    codec: TokenCodec,
    challenges: ChallengeRegistry,
    sessions: Arc<SessionRegistry>,
    errors: ErrorSink,
}

impl SigninBroker {
    /// Create a broker with a freshly generated process key.
    pub fn new(config: BrokerConfig) -> LoginResult<Self> {
        let key = KeyMaterial::generate()?;
        Ok(Self::with_key(config, &key))
    }

    /// Create a broker sealing tokens under `key`.
    pub fn with_key(config: BrokerConfig, key: &KeyMaterial) -> Self {
        let challenges = ChallengeRegistry::new(config.challenge_ttl);
        let sessions = Arc::new(SessionRegistry::new(config.session_ttl));
        Self {
            config,
            codec: TokenCodec::new(key),
            challenges,
            sessions,
            errors: log_errors(),
        }
    }

    /// Replace the default (logging) error sink.
    pub fn with_error_sink(mut self, errors: ErrorSink) -> Self {
        self.errors = errors;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn challenges(&self) -> &ChallengeRegistry {
        &self.challenges
    }

    /// Handed to the transport as its authentication callback.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Register a challenge whose result is delivered into `result`.
    pub async fn issue_challenge(&self, result: oneshot::Sender<PublicKey>) -> IssuedChallenge {
        self.challenges.issue(result).await
    }

    /// Issue a challenge and seal its id into a token.
    pub async fn challenge_token(
        &self,
        result: oneshot::Sender<PublicKey>,
    ) -> LoginResult<(Vec<u8>, IssuedChallenge)> {
        let issued = self.issue_challenge(result).await;
        match self.codec.seal(issued.id) {
            Ok(token) => Ok((token, issued)),
            Err(e) => {
                self.challenges.evict(issued.id).await;
                Err(e)
            }
        }
    }

    /// Issue a challenge and build the `ssh signin@<host> <token>` command.
    pub async fn signin_command(
        &self,
        host: &str,
        result: oneshot::Sender<PublicKey>,
    ) -> LoginResult<SigninCommand> {
        let (token, issued) = self.challenge_token(result).await?;
        let command = format!(
            "ssh {}@{} {}",
            self.config.signin_user,
            host,
            hex::encode(token)
        );
        info!(challenge_id = issued.id, "sign-in command issued");
        Ok(SigninCommand {
            command,
            challenge_id: issued.id,
            expires_at: issued.expires_at,
        })
    }

    /// Issue a sign-in command together with the handle that awaits its key.
    pub async fn begin_signin(&self, host: &str) -> LoginResult<(SigninCommand, PendingSignin)> {
        let (tx, rx) = oneshot::channel();
        let command = self.signin_command(host, tx).await?;
        let pending = PendingSignin {
            challenge_id: command.challenge_id,
            expires_at: command.expires_at,
            result: rx,
        };
        Ok((command, pending))
    }

    /// Hand an error to the configured sink.
    pub fn report(&self, error: &LoginError) {
        (self.errors)(error);
    }
}
