//! Boundary between the SSH transport and the sign-in protocol.
//!
//! A transport performs the SSH handshake, records the authenticating key in
//! the [`SessionRegistry`], and then surfaces channel opens and requests as
//! values on tokio channels. Output goes back through a [`ChannelWriter`].

use crate::error::LoginResult;
use crate::session::{SessionId, SessionRegistry};
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// The only channel type the broker accepts.
pub const SESSION_CHANNEL: &str = "session";

/// The only actionable channel request.
pub const EXEC_REQUEST: &str = "exec";

/// An authenticated SSH connection, ready for channel handling.
pub struct Connection {
    /// Identifier the transport used when recording the session key.
    pub session_id: SessionId,
    /// User name the client authenticated as.
    pub user: String,
    pub remote: Option<SocketAddr>,
    /// Channel open requests, in arrival order. Closed when the connection ends.
    pub channels: mpsc::Receiver<ChannelOpen>,
    /// Out-of-band global requests.
    pub global_requests: mpsc::Receiver<Request>,
}

/// A global or channel request, with an optional reply slot.
#[derive(Debug)]
pub struct Request {
    pub kind: String,
    pub payload: Vec<u8>,
    reply: Option<oneshot::Sender<bool>>,
}

impl Request {
    /// A request that wants a reply; the transport awaits the receiver.
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kind: kind.into(),
                payload,
                reply: Some(tx),
            },
            rx,
        )
    }

    /// A request with `want_reply` unset.
    pub fn without_reply(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            reply: None,
        }
    }

    pub fn wants_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Send the reply. Only the first call has any effect.
    pub fn reply(&mut self, ok: bool) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(ok);
        }
    }
}

/// Why a channel open was refused, as an SSH `CHANNEL_OPEN_FAILURE` reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownChannelType = 3,
}

/// The broker's answer to a channel open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    Accept,
    Reject {
        reason: RejectReason,
        message: String,
    },
}

/// Write side of an accepted channel.
pub trait ChannelWriter: Send + Sync {
    /// Write all bytes to the channel's data stream.
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, LoginResult<()>>;

    /// Send EOF and close the channel.
    fn close(&mut self) -> BoxFuture<'_, LoginResult<()>>;
}

/// A pending channel open from the client.
pub struct ChannelOpen {
    pub kind: String,
    requests: mpsc::Receiver<Request>,
    writer: Box<dyn ChannelWriter>,
    decision: oneshot::Sender<OpenDecision>,
}

impl ChannelOpen {
    /// Built by the transport. The transport forwards the channel's requests
    /// into the sender paired with `requests` and awaits `decision`.
    pub fn new(
        kind: impl Into<String>,
        requests: mpsc::Receiver<Request>,
        writer: Box<dyn ChannelWriter>,
    ) -> (Self, oneshot::Receiver<OpenDecision>) {
        let (decision, rx) = oneshot::channel();
        (
            Self {
                kind: kind.into(),
                requests,
                writer,
                decision,
            },
            rx,
        )
    }

    /// Accept the channel, taking its request stream and a line terminal.
    pub fn accept(self) -> (mpsc::Receiver<Request>, Terminal) {
        let _ = self.decision.send(OpenDecision::Accept);
        (self.requests, Terminal::new(self.writer))
    }

    pub fn reject(self, reason: RejectReason, message: impl Into<String>) {
        let _ = self.decision.send(OpenDecision::Reject {
            reason,
            message: message.into(),
        });
    }
}

/// Line-oriented output on a channel. Lines end in `\r\n`.
pub struct Terminal {
    writer: Box<dyn ChannelWriter>,
    closed: bool,
}

impl Terminal {
    pub fn new(writer: Box<dyn ChannelWriter>) -> Self {
        Self {
            writer,
            closed: false,
        }
    }

    pub async fn write_line(&mut self, line: &str) -> LoginResult<()> {
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.writer.write(&data).await
    }

    /// Close the channel. Later calls are no-ops.
    pub async fn close(&mut self) -> LoginResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.close().await
    }
}

/// An SSH server transport.
///
/// `handshake` runs the key exchange and user authentication on `stream`,
/// accepting any public key and recording it in `sessions` under the
/// connection's session id, then returns the connection for channel handling.
pub trait Handshake: Send + Sync + 'static {
    fn handshake(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        sessions: Arc<SessionRegistry>,
    ) -> BoxFuture<'static, LoginResult<Connection>>;
}
