//! SSH transport using russh.
//!
//! Each accepted TCP stream gets its own russh session and [`SshHandler`].
//! The handler accepts any verified public key, records it under a fresh
//! random session id, and forwards every channel open and channel request to
//! the broker, awaiting the broker's answer before replying on the wire.
//! russh answers a refused channel open with `AdministrativelyProhibited`
//! whatever reason the broker gives.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use rand::Rng;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Pty, Sig};
use russh_keys::key;
use russh_keys::PublicKeyBase64;
use sshlogin_core::codec::exec_payload;
use sshlogin_core::transport::{
    ChannelOpen, ChannelWriter, Connection, Handshake, OpenDecision, Request, EXEC_REQUEST,
    SESSION_CHANNEL,
};
use sshlogin_core::{fingerprint, LoginError, LoginResult, PublicKey, SessionId, SessionRegistry};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Pending channel opens per connection.
const CHANNEL_QUEUE: usize = 8;
/// Pending requests per channel.
const REQUEST_QUEUE: usize = 8;
/// Length of generated session ids.
const SESSION_ID_LEN: usize = 32;

/// russh-backed [`Handshake`].
pub struct SshTransport {
    config: Arc<server::Config>,
}

impl SshTransport {
    pub fn new(host_key: key::KeyPair, inactivity_timeout: Duration) -> Self {
        let config = server::Config {
            methods: MethodSet::PUBLICKEY,
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: Some(inactivity_timeout),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

impl Handshake for SshTransport {
    fn handshake(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        sessions: Arc<SessionRegistry>,
    ) -> BoxFuture<'static, LoginResult<Connection>> {
        let config = self.config.clone();
        Box::pin(async move {
            let session_id = new_session_id();
            let (channels_tx, channels_rx) = mpsc::channel(CHANNEL_QUEUE);
            // russh answers global requests itself; nothing is forwarded.
            let (_globals_tx, globals_rx) = mpsc::channel(1);
            let (auth_tx, auth_rx) = oneshot::channel();

            let handler = SshHandler {
                session_id: session_id.clone(),
                sessions,
                authenticated: Some(auth_tx),
                channels: channels_tx,
                requests: HashMap::new(),
                remote,
            };

            let running = server::run_stream(config, stream, handler)
                .await
                .map_err(|e| LoginError::Handshake(e.to_string()))?;

            let (ended_tx, ended_rx) = oneshot::channel();
            tokio::spawn(async move {
                let result = running.await.map_err(|e| e.to_string());
                if let Err(ref e) = result {
                    debug!(remote = %remote, error = %e, "ssh session ended with error");
                }
                let _ = ended_tx.send(result);
            });

            let user = match auth_rx.await {
                Ok(user) => user,
                Err(_) => {
                    let reason = match ended_rx.await {
                        Ok(Err(e)) => e,
                        _ => "connection closed before authentication".to_string(),
                    };
                    return Err(LoginError::Handshake(reason));
                }
            };

            debug!(remote = %remote, session = %session_id.short(), user = %user, "ssh handshake complete");
            Ok(Connection {
                session_id,
                user,
                remote: Some(remote),
                channels: channels_rx,
                global_requests: globals_rx,
            })
        })
    }
}

/// Per-connection russh handler.
struct SshHandler {
    session_id: SessionId,
    sessions: Arc<SessionRegistry>,
    /// Fired with the user name on the first successful authentication.
    authenticated: Option<oneshot::Sender<String>>,
    channels: mpsc::Sender<ChannelOpen>,
    /// Request queues of accepted channels.
    requests: HashMap<ChannelId, mpsc::Sender<Request>>,
    remote: SocketAddr,
}

impl SshHandler {
    /// Hand a channel request to the broker and wait for its verdict.
    async fn forward(&mut self, channel: ChannelId, kind: &str, payload: Vec<u8>) -> bool {
        let Some(tx) = self.requests.get(&channel) else {
            return false;
        };
        let (req, reply) = Request::new(kind, payload);
        if tx.send(req).await.is_err() {
            self.requests.remove(&channel);
            return false;
        }
        reply.await.unwrap_or(false)
    }

    /// Offer a new channel to the broker and wait for its decision.
    async fn open_channel(
        &mut self,
        kind: &str,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> bool {
        let id = channel.id();
        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE);
        let writer = HandleWriter {
            handle: session.handle(),
            channel: id,
        };
        let (open, decision) = ChannelOpen::new(kind, req_rx, Box::new(writer));
        if self.channels.send(open).await.is_err() {
            return false;
        }

        match decision.await {
            Ok(OpenDecision::Accept) => {
                self.requests.insert(id, req_tx);
                true
            }
            Ok(OpenDecision::Reject { reason, message }) => {
                debug!(remote = %self.remote, kind, ?reason, message = %message, "channel rejected");
                false
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let Some(tx) = self.authenticated.take() else {
            return Ok(Auth::Accept);
        };

        let key = match to_ssh_key(public_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(remote = %self.remote, error = %e, "unsupported public key");
                self.authenticated = Some(tx);
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };

        debug!(remote = %self.remote, user = %user, fingerprint = %fingerprint(&key), "public key accepted");
        self.sessions.record(self.session_id.clone(), key).await;
        let _ = tx.send(user.to_string());
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open_channel(SESSION_CHANNEL, channel, session).await)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open_channel("x11", channel, session).await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open_channel("direct-tcpip", channel, session).await)
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open_channel("forwarded-tcpip", channel, session).await)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ok = self.forward(channel, EXEC_REQUEST, exec_payload(data)).await;
        reply(session, channel, ok);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ok = self.forward(channel, "shell", Vec::new()).await;
        reply(session, channel, ok);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ok = self
            .forward(channel, "subsystem", exec_payload(name.as_bytes()))
            .await;
        reply(session, channel, ok);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ok = self
            .forward(channel, "pty-req", exec_payload(term.as_bytes()))
            .await;
        reply(session, channel, ok);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ok = self.forward(channel, "x11-req", Vec::new()).await;
        reply(session, channel, ok);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ok = self
            .forward(channel, "env", exec_payload(variable_name.as_bytes()))
            .await;
        reply(session, channel, ok);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ok = self.forward(channel, "window-change", Vec::new()).await;
        reply(session, channel, ok);
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        _signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ok = self.forward(channel, "signal", Vec::new()).await;
        reply(session, channel, ok);
        Ok(())
    }

    /// russh sends the answer itself, as a global request reply.
    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .forward(channel, "auth-agent-req@openssh.com", Vec::new())
            .await)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.requests.remove(&channel);
        Ok(())
    }
}

fn reply(session: &mut Session, channel: ChannelId, ok: bool) {
    if ok {
        session.channel_success(channel);
    } else {
        session.channel_failure(channel);
    }
}

/// Writes channel output through the session handle.
struct HandleWriter {
    handle: server::Handle,
    channel: ChannelId,
}

impl ChannelWriter for HandleWriter {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, LoginResult<()>> {
        Box::pin(async move {
            self.handle
                .data(self.channel, CryptoVec::from_slice(data))
                .await
                .map_err(|_| LoginError::Transport("channel write failed".into()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, LoginResult<()>> {
        Box::pin(async move {
            let _ = self.handle.eof(self.channel).await;
            self.handle
                .close(self.channel)
                .await
                .map_err(|_| LoginError::Transport("channel close failed".into()))
        })
    }
}

/// Convert a russh key into the broker's key type via its SSH wire encoding.
fn to_ssh_key(key: &key::PublicKey) -> Result<PublicKey, ssh_key::Error> {
    PublicKey::from_bytes(&key.public_key_bytes())
}

fn new_session_id() -> SessionId {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..SESSION_ID_LEN).map(|_| rng.gen()).collect();
    SessionId::new(bytes)
}
