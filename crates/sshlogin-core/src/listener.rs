//! Accept loop: one task per connection until cancelled.

use crate::broker::SigninBroker;
use crate::error::{LoginError, LoginResult};
use crate::transport::Handshake;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Accept connections on `listener` until `shutdown` fires.
///
/// Each connection is handshaken by `transport` and handled on its own task;
/// its failure is reported to the broker's sink and never stops the loop.
/// An accept error is fatal: it is reported and returned.
pub async fn serve<H: Handshake>(
    broker: Arc<SigninBroker>,
    listener: TcpListener,
    transport: Arc<H>,
    shutdown: CancellationToken,
) -> LoginResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "sign-in listener started");
    }

    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("sign-in listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    let err = LoginError::Accept(e);
                    broker.report(&err);
                    return Err(err);
                }
            },
        };

        debug!(remote = %remote, "connection accepted");
        let broker = broker.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let sessions = broker.sessions().clone();
            let result = match transport.handshake(stream, remote, sessions).await {
                Ok(conn) => broker.clone().handle_connection(conn).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                broker.report(&e);
            }
        });
    }
}
