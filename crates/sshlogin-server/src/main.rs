//! sshlogin-server: passwordless sign-in over SSH.
//!
//! Prints `ssh signin@<host> <token>` commands on request and completes the
//! sign-in when the command is run by someone holding an SSH key.

mod config;
mod console;
mod hostkey;
mod transport;

use clap::Parser;
use config::{Overrides, ServerConfig};
use sshlogin_core::SigninBroker;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use transport::SshTransport;

/// sshlogin-server: SSH sign-in broker
#[derive(Parser, Debug)]
#[command(name = "sshlogin-server", version, about = "Passwordless sign-in over SSH")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// SSH host key (OpenSSH private key file)
    #[arg(long)]
    host_key: Option<String>,

    /// Create an Ed25519 host key if the host key file is missing
    #[arg(long)]
    generate_host_key: bool,

    /// Host name printed in sign-in commands
    #[arg(long)]
    public_host: Option<String>,

    /// Challenge lifetime in seconds
    #[arg(long)]
    challenge_ttl: Option<u64>,

    /// Session lifetime in seconds
    #[arg(long)]
    session_ttl: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "~/.sshlogin/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting sshlogin-server");

    if let Err(e) = run(cli).await {
        error!(error = format!("{e:#}"), "sshlogin-server failed");
        std::process::exit(1);
    }

    info!("sshlogin-server stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = Overrides {
        bind: cli.bind,
        port: cli.port,
        host_key: cli.host_key,
        public_host: cli.public_host,
        challenge_ttl: cli.challenge_ttl,
        session_ttl: cli.session_ttl,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = ServerConfig::load(Some(&config_path), overrides)?;

    let host_key = if cli.generate_host_key {
        hostkey::load_or_generate(&server_config.host_key_path)?
    } else {
        hostkey::load(&server_config.host_key_path)?
    };

    let inactivity = server_config.broker.session_ttl;
    let broker = Arc::new(SigninBroker::new(server_config.broker.clone())?);
    let listener = TcpListener::bind(server_config.listen).await?;
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let broker = broker.clone();
        let host = server_config.public_host.clone();
        let shutdown = shutdown.clone();
        async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = console::run(broker, host, stdin, tokio::io::stdout(), shutdown).await {
                warn!(error = %e, "console stopped");
            }
        }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    let transport = Arc::new(SshTransport::new(host_key, inactivity));
    sshlogin_core::serve(broker, listener, transport, shutdown).await?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
