//! Per-connection protocol handling.
//!
//! After the transport's handshake, a connection moves through:
//! 1. Channel opens: only `session` channels are accepted; others are
//!    rejected and the connection keeps waiting.
//! 2. Session lookup: the key recorded at authentication must still be live,
//!    otherwise the client is told the session expired and handling stops.
//! 3. Request loop (one task per channel): `exec` redeems the token carried
//!    in its command; every other request is refused.

use crate::broker::SigninBroker;
use crate::codec::exec_command;
use crate::error::{LoginError, LoginResult, TokenError};
use crate::identity::fingerprint;
use crate::session::SessionId;
use crate::transport::{
    Connection, RejectReason, Request, Terminal, EXEC_REQUEST, SESSION_CHANNEL,
};
use ssh_key::PublicKey;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything a channel's request loop needs to know about its connection.
struct ChannelContext {
    session_id: SessionId,
    user: Arc<str>,
    key: PublicKey,
    remote: Option<SocketAddr>,
}

impl SigninBroker {
    /// Drive an authenticated connection until its channel stream ends.
    ///
    /// Channel request loops run on their own tasks and report their errors
    /// to the sink; the returned error covers the connection itself.
    pub async fn handle_connection(self: Arc<Self>, conn: Connection) -> LoginResult<()> {
        let Connection {
            session_id,
            user,
            remote,
            mut channels,
            global_requests,
        } = conn;

        debug!(session = %session_id.short(), user = %user, "connection ready");
        tokio::spawn(discard_requests(global_requests));

        let user: Arc<str> = user.into();

        while let Some(open) = channels.recv().await {
            if open.kind != SESSION_CHANNEL {
                debug!(kind = %open.kind, "rejecting channel");
                open.reject(RejectReason::UnknownChannelType, "unknown channel type");
                continue;
            }

            let (requests, mut term) = open.accept();

            let Some(key) = self.sessions().lookup(&session_id).await else {
                let err = LoginError::SessionExpired;
                if let Err(e) = term.write_line(&err.client_message()).await {
                    self.report(&e);
                }
                if let Err(e) = term.close().await {
                    self.report(&e);
                }
                return Err(err);
            };

            let ctx = ChannelContext {
                session_id: session_id.clone(),
                user: user.clone(),
                key,
                remote,
            };
            tokio::spawn(self.clone().run_channel(ctx, requests, term));
        }

        debug!(session = %session_id.short(), "connection closed");
        Ok(())
    }

    async fn run_channel(
        self: Arc<Self>,
        ctx: ChannelContext,
        mut requests: mpsc::Receiver<Request>,
        mut term: Terminal,
    ) {
        while let Some(mut req) = requests.recv().await {
            debug!(session = %ctx.session_id.short(), kind = %req.kind, "channel request");
            if req.kind != EXEC_REQUEST {
                req.reply(false);
                continue;
            }

            // The request is acknowledged before the user is checked; failures
            // are reported as text on the channel.
            req.reply(true);

            let line = match self.redeem_signin(&ctx, &req.payload).await {
                Ok(()) => "Success!".to_string(),
                Err(e) => {
                    self.report(&e);
                    e.client_message()
                }
            };
            if let Err(e) = term.write_line(&line).await {
                self.report(&e);
            }
            if let Err(e) = term.close().await {
                self.report(&e);
            }
            return;
        }
    }

    /// The `signin` exec command: open the token, redeem its challenge and
    /// hand over the session's key.
    async fn redeem_signin(&self, ctx: &ChannelContext, payload: &[u8]) -> LoginResult<()> {
        if ctx.user.as_ref() != self.config().signin_user {
            return Err(LoginError::InvalidMethod(ctx.user.to_string()));
        }

        let command = exec_command(payload)?;
        let command = std::str::from_utf8(command).map_err(|_| TokenError::InvalidEncoding)?;
        let id = self.codec().open_hex(command).map_err(|e| {
            warn!(remote = ?ctx.remote, error = %e, "rejected sign-in token");
            e
        })?;

        let challenge = self.challenges().redeem(id).await?;
        challenge.deliver(ctx.key.clone())?;
        self.sessions().evict(&ctx.session_id).await;

        info!(
            challenge_id = id,
            fingerprint = %fingerprint(&ctx.key),
            remote = ?ctx.remote,
            "sign-in succeeded"
        );
        Ok(())
    }
}

/// Consume global requests without acting on them.
async fn discard_requests(mut requests: mpsc::Receiver<Request>) {
    while let Some(mut req) = requests.recv().await {
        debug!(kind = %req.kind, "discarding global request");
        req.reply(false);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::codec::exec_payload;
    use crate::identity::test_key;
    use crate::transport::{ChannelOpen, ChannelWriter, OpenDecision};
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Channel output captured by the in-memory transport.
    #[derive(Debug, PartialEq, Eq)]
    pub(crate) enum Output {
        Data(String),
        Closed,
    }

    pub(crate) struct TestWriter(pub mpsc::UnboundedSender<Output>);

    impl ChannelWriter for TestWriter {
        fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, LoginResult<()>> {
            let _ = self.0.send(Output::Data(String::from_utf8_lossy(data).into_owned()));
            Box::pin(async { Ok(()) })
        }

        fn close(&mut self) -> BoxFuture<'_, LoginResult<()>> {
            let _ = self.0.send(Output::Closed);
            Box::pin(async { Ok(()) })
        }
    }

    /// Client side of an in-memory connection.
    pub(crate) struct TestClient {
        pub channels: mpsc::Sender<ChannelOpen>,
        pub globals: mpsc::Sender<Request>,
    }

    /// Client side of one channel.
    pub(crate) struct TestChannel {
        pub decision: OpenDecision,
        pub requests: mpsc::Sender<Request>,
        pub output: mpsc::UnboundedReceiver<Output>,
    }

    impl TestClient {
        pub(crate) async fn open(&self, kind: &str) -> TestChannel {
            let (req_tx, req_rx) = mpsc::channel(8);
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (open, decision) = ChannelOpen::new(kind, req_rx, Box::new(TestWriter(out_tx)));
            self.channels.send(open).await.unwrap();
            TestChannel {
                decision: decision.await.unwrap(),
                requests: req_tx,
                output: out_rx,
            }
        }
    }

    impl TestChannel {
        pub(crate) async fn request(&self, kind: &str, payload: Vec<u8>) -> bool {
            let (req, reply) = Request::new(kind, payload);
            self.requests.send(req).await.unwrap();
            reply.await.unwrap()
        }

        pub(crate) async fn exec(&self, command: &str) -> bool {
            self.request(EXEC_REQUEST, exec_payload(command.as_bytes())).await
        }

        /// Collect output until the channel is closed.
        pub(crate) async fn transcript(&mut self) -> Vec<Output> {
            let mut out = Vec::new();
            while let Some(o) = self.output.recv().await {
                let done = o == Output::Closed;
                out.push(o);
                if done {
                    break;
                }
            }
            out
        }
    }

    pub(crate) fn connection(session_id: SessionId, user: &str) -> (Connection, TestClient) {
        let (chan_tx, chan_rx) = mpsc::channel(8);
        let (glob_tx, glob_rx) = mpsc::channel(8);
        (
            Connection {
                session_id,
                user: user.to_string(),
                remote: None,
                channels: chan_rx,
                global_requests: glob_rx,
            },
            TestClient {
                channels: chan_tx,
                globals: glob_tx,
            },
        )
    }

    fn broker() -> Arc<SigninBroker> {
        Arc::new(
            SigninBroker::new(BrokerConfig {
                challenge_ttl: Duration::from_secs(60),
                session_ttl: Duration::from_secs(60),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    async fn authenticated(
        broker: &Arc<SigninBroker>,
        user: &str,
        seed: u8,
    ) -> TestClient {
        let sid = SessionId::new(vec![seed; 32]);
        broker.sessions().record(sid.clone(), test_key(seed)).await;
        let (conn, client) = connection(sid, user);
        tokio::spawn(broker.clone().handle_connection(conn));
        client
    }

    async fn token(broker: &SigninBroker) -> (String, oneshot::Receiver<PublicKey>) {
        let (tx, rx) = oneshot::channel();
        let (token, _) = broker.challenge_token(tx).await.unwrap();
        (hex::encode(token), rx)
    }

    #[tokio::test]
    async fn signin_delivers_key() {
        let b = broker();
        let (tok, rx) = token(&b).await;
        let client = authenticated(&b, "signin", 1).await;

        let mut ch = client.open("session").await;
        assert_eq!(ch.decision, OpenDecision::Accept);
        assert!(ch.exec(&tok).await);
        assert_eq!(
            ch.transcript().await,
            vec![Output::Data("Success!\r\n".into()), Output::Closed]
        );
        assert_eq!(rx.await.unwrap(), test_key(1));
        assert!(b.challenges().is_empty().await);
    }

    #[tokio::test]
    async fn second_redemption_fails() {
        let b = broker();
        let (tok, _rx) = token(&b).await;

        let first = authenticated(&b, "signin", 1).await;
        let mut ch = first.open("session").await;
        ch.exec(&tok).await;
        ch.transcript().await;

        let second = authenticated(&b, "signin", 2).await;
        let mut ch = second.open("session").await;
        assert!(ch.exec(&tok).await);
        assert_eq!(
            ch.transcript().await,
            vec![Output::Data("Challenge expired.\r\n".into()), Output::Closed]
        );
    }

    #[tokio::test]
    async fn wrong_user_is_invalid_method() {
        let b = broker();
        let (tok, mut rx) = token(&b).await;
        let client = authenticated(&b, "root", 3).await;

        let mut ch = client.open("session").await;
        assert!(ch.exec(&tok).await);
        assert_eq!(
            ch.transcript().await,
            vec![Output::Data("Invalid method 'root'.\r\n".into()), Output::Closed]
        );

        assert_eq!(b.challenges().len().await, 1);
        assert!(rx.try_recv().is_err());
        assert!(b.sessions().lookup(&SessionId::new(vec![3; 32])).await.is_some());
    }

    #[tokio::test]
    async fn bad_tokens_get_uniform_line() {
        let b = broker();
        let client = authenticated(&b, "signin", 4).await;
        let foreign = SigninBroker::new(BrokerConfig::default()).unwrap();
        let (foreign_tok, _rx) = token(&foreign).await;

        for bad in ["zz", "00ff", foreign_tok.as_str()] {
            let mut ch = client.open("session").await;
            assert!(ch.exec(bad).await);
            assert_eq!(
                ch.transcript().await,
                vec![Output::Data("Invalid sign-in token.\r\n".into()), Output::Closed]
            );
        }
    }

    #[tokio::test]
    async fn errors_reach_the_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let b = Arc::new(
            SigninBroker::new(BrokerConfig::default())
                .unwrap()
                .with_error_sink(Arc::new(move |e: &LoginError| {
                    sink_seen.lock().unwrap().push(e.to_string());
                })),
        );
        let client = authenticated(&b, "signin", 5).await;
        let mut ch = client.open("session").await;
        ch.exec("00").await;
        ch.transcript().await;
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["token error: invalid token length"]
        );
    }

    #[tokio::test]
    async fn unknown_channel_rejected_connection_survives() {
        let b = broker();
        let (tok, rx) = token(&b).await;
        let client = authenticated(&b, "signin", 6).await;

        let ch = client.open("direct-tcpip").await;
        assert_eq!(
            ch.decision,
            OpenDecision::Reject {
                reason: RejectReason::UnknownChannelType,
                message: "unknown channel type".into(),
            }
        );

        let ch = client.open("session").await;
        ch.exec(&tok).await;
        assert_eq!(rx.await.unwrap(), test_key(6));
    }

    #[tokio::test]
    async fn non_exec_requests_refused() {
        let b = broker();
        let (tok, rx) = token(&b).await;
        let client = authenticated(&b, "signin", 7).await;

        let mut ch = client.open("session").await;
        assert!(!ch.request("pty-req", vec![]).await);
        assert!(!ch.request("shell", vec![]).await);
        assert!(ch.output.try_recv().is_err());
        assert!(ch.exec(&tok).await);
        assert_eq!(rx.await.unwrap(), test_key(7));
    }

    #[tokio::test]
    async fn missing_session_ends_connection() {
        let b = broker();
        let (conn, client) = connection(SessionId::new(vec![8; 32]), "signin");
        let handle = tokio::spawn(b.clone().handle_connection(conn));

        let mut ch = client.open("session").await;
        assert_eq!(
            ch.transcript().await,
            vec![
                Output::Data("Your session has expired. Try again.\r\n".into()),
                Output::Closed
            ]
        );
        assert!(matches!(handle.await.unwrap(), Err(LoginError::SessionExpired)));
    }

    #[tokio::test]
    async fn global_requests_are_discarded() {
        let b = broker();
        let client = authenticated(&b, "signin", 9).await;
        let (req, reply) = Request::new("tcpip-forward", vec![]);
        client.globals.send(req).await.unwrap();
        assert!(!reply.await.unwrap());

        client.globals.send(Request::without_reply("keepalive@openssh.com", vec![])).await.unwrap();
        let ch = client.open("session").await;
        assert_eq!(ch.decision, OpenDecision::Accept);
    }

    #[tokio::test]
    async fn concurrent_redemptions_single_winner() {
        let b = broker();
        let (tok, rx) = token(&b).await;
        let a = authenticated(&b, "signin", 10).await;
        let c = authenticated(&b, "signin", 11).await;

        let mut ch_a = a.open("session").await;
        let mut ch_c = c.open("session").await;
        let (ra, rc) = tokio::join!(ch_a.exec(&tok), ch_c.exec(&tok));
        assert!(ra && rc);

        let (ta, tc) = tokio::join!(ch_a.transcript(), ch_c.transcript());
        let successes = [ta, tc]
            .iter()
            .filter(|t| t[0] == Output::Data("Success!\r\n".into()))
            .count();
        assert_eq!(successes, 1);

        let key = rx.await.unwrap();
        assert!(key == test_key(10) || key == test_key(11));
    }
}
