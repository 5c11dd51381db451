//! Operator console: each line read from the input issues a sign-in command
//! and prints it; completed or expired sign-ins are reported as they happen.

use sshlogin_core::{fingerprint, LoginResult, PublicKey, SigninBroker};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PROMPT: &str = "Press Enter to get a sign-in command.\n";

struct Outcome {
    challenge_id: u64,
    result: LoginResult<PublicKey>,
}

/// Run the console until the input ends or `shutdown` fires.
pub async fn run<R, W>(
    broker: Arc<SigninBroker>,
    host: String,
    input: R,
    mut output: W,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Outcome>();

    output.write_all(PROMPT.as_bytes()).await?;
    output.flush().await?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => {
                if line?.is_none() {
                    return Ok(());
                }
                let (command, pending) = match broker.begin_signin(&host).await {
                    Ok(issued) => issued,
                    Err(e) => {
                        warn!(error = %e, "could not issue sign-in command");
                        output.write_all(format!("Error: {e}\n").as_bytes()).await?;
                        output.flush().await?;
                        continue;
                    }
                };
                output.write_all(format!("Run:\n  {command}\n").as_bytes()).await?;
                output.flush().await?;

                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let challenge_id = pending.challenge_id;
                    let result = pending.wait().await;
                    let _ = done_tx.send(Outcome { challenge_id, result });
                });
            }
            Some(outcome) = done_rx.recv() => {
                let line = match outcome.result {
                    Ok(key) => {
                        let fp = fingerprint(&key);
                        info!(challenge_id = outcome.challenge_id, fingerprint = %fp, "signed in");
                        format!("Sign-in {} complete: {fp}\n", outcome.challenge_id)
                    }
                    Err(e) => {
                        info!(challenge_id = outcome.challenge_id, error = %e, "sign-in not completed");
                        format!("Sign-in {} failed: {e}\n", outcome.challenge_id)
                    }
                };
                output.write_all(line.as_bytes()).await?;
                output.flush().await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use sshlogin_core::BrokerConfig;
    use ssh_key::{Algorithm, PrivateKey};
    use tokio::io::{AsyncWriteExt, BufReader};

    fn broker() -> Arc<SigninBroker> {
        Arc::new(SigninBroker::new(BrokerConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn prints_one_command_per_line() {
        let broker = broker();
        let mut out = Vec::new();
        run(
            broker.clone(),
            "login.example.com".into(),
            &b"\n\n"[..],
            &mut out,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        let commands: Vec<&str> = text
            .lines()
            .filter_map(|l| l.trim().strip_prefix("ssh signin@login.example.com "))
            .collect();
        assert_eq!(commands.len(), 2);
        assert_ne!(commands[0], commands[1]);
        assert_eq!(broker.challenges().len().await, 2);
    }

    #[tokio::test]
    async fn reports_completed_signin() {
        let broker = broker();
        let (mut stdin, input) = tokio::io::duplex(256);
        let (output, stdout) = tokio::io::duplex(1024);
        let shutdown = CancellationToken::new();
        let console = tokio::spawn(run(
            broker.clone(),
            "localhost".into(),
            BufReader::new(input),
            output,
            shutdown.clone(),
        ));

        let mut stdout = BufReader::new(stdout).lines();
        assert_eq!(stdout.next_line().await.unwrap().unwrap(), PROMPT.trim_end());
        stdin.write_all(b"\n").await.unwrap();
        assert_eq!(stdout.next_line().await.unwrap().unwrap(), "Run:");
        let command = stdout.next_line().await.unwrap().unwrap();
        let token = command.rsplit(' ').next().unwrap();

        let id = broker.codec().open_hex(token).unwrap();
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone();
        broker
            .challenges()
            .redeem(id)
            .await
            .unwrap()
            .deliver(key.clone())
            .unwrap();

        assert_eq!(
            stdout.next_line().await.unwrap().unwrap(),
            format!("Sign-in {id} complete: {}", fingerprint(&key))
        );

        shutdown.cancel();
        assert!(console.await.unwrap().is_ok());
    }
}
