use std::sync::Arc;
use thiserror::Error;

/// Reasons a sign-in token can be rejected by the codec.
///
/// Every variant is shown to the connecting client as the same line (see
/// [`TokenError::client_message`]); the variant itself is for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("invalid token length")]
    InvalidLength,

    #[error("failed to decrypt token")]
    DecryptFailed,

    #[error("failed to parse challenge id")]
    MalformedId,

    #[error("token is not valid hex")]
    InvalidEncoding,
}

impl TokenError {
    /// The line written back to the SSH client.
    pub fn client_message(&self) -> &'static str {
        "Invalid sign-in token."
    }
}

/// Errors produced by the sign-in broker.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("challenge expired")]
    NotFound,

    #[error("session expired")]
    SessionExpired,

    #[error("sign-in request is no longer waiting")]
    Abandoned,

    #[error("invalid method '{0}'")]
    InvalidMethod(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("random source failure")]
    Random,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("accept failed: {0}")]
    Accept(std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl LoginError {
    /// Human-readable line for the connecting terminal.
    pub fn client_message(&self) -> String {
        match self {
            LoginError::Token(e) => e.client_message().to_string(),
            LoginError::NotFound => "Challenge expired.".to_string(),
            LoginError::SessionExpired => "Your session has expired. Try again.".to_string(),
            LoginError::InvalidMethod(user) => format!("Invalid method '{user}'."),
            other => other.to_string(),
        }
    }
}

pub type LoginResult<T> = Result<T, LoginError>;

/// Callback receiving every connection, channel and listener level error.
pub type ErrorSink = Arc<dyn Fn(&LoginError) + Send + Sync>;

/// The default sink: log at `warn`.
pub fn log_errors() -> ErrorSink {
    Arc::new(|e: &LoginError| {
        tracing::warn!(error = %e, "sign-in error");
    })
}
