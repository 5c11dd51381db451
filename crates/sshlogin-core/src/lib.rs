//! sshlogin-core: passwordless sign-in over SSH.
//!
//! An initiator asks the [`SigninBroker`] for a sign-in command carrying a
//! sealed challenge token. The identity holder runs it with their SSH agent;
//! the broker checks the token, redeems the challenge and hands the
//! authenticated public key to whoever is waiting on it.
//!
//! The SSH wire protocol itself is supplied by a [`transport::Handshake`]
//! implementation.

pub mod broker;
pub mod challenge;
pub mod codec;
pub mod connection;
pub mod error;
pub mod identity;
pub mod keys;
pub mod listener;
pub mod session;
pub mod token;
pub mod transport;

// Re-export commonly used items at crate root.
pub use broker::{BrokerConfig, PendingSignin, SigninBroker, SigninCommand};
pub use challenge::{Challenge, ChallengeRegistry, IssuedChallenge};
pub use error::{log_errors, ErrorSink, LoginError, LoginResult, TokenError};
pub use identity::fingerprint;
pub use keys::KeyMaterial;
pub use listener::serve;
pub use session::{SessionId, SessionRegistry};
pub use token::TokenCodec;
pub use ssh_key::PublicKey;
