//! accepter-echo
//!
//! Echo server on top of the accepter lifecycle controller. Every byte a
//! client sends is written back until the client disconnects or the server
//! shuts down.
//!
//! ```text
//! SIGINT/SIGTERM ──▶ graceful shutdown (drain_timeout_secs)
//! second signal  ──▶ close every connection immediately
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use accepter::config::{self, AccepterConfig, CertificateConfig, ConfigError};
use accepter::lifecycle::signals::termination_signal;
use accepter::observability::logging::init_logging;
use accepter::{handler_fn, Accepter, Connection, Deadline};

const ECHO_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Parser, Debug)]
#[command(name = "accepter-echo")]
#[command(about = "Echo server with graceful shutdown", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network kind: tcp, tcp4, tcp6 or unix
    #[arg(long)]
    network: Option<String>,

    /// Address to listen on
    #[arg(short, long)]
    address: Option<String>,

    /// PEM certificate chain; enables TLS
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Seconds to wait for connections to drain on shutdown
    #[arg(long)]
    drain_timeout_secs: Option<u64>,
}

impl Cli {
    /// Load the config file (or defaults) and apply command-line overrides.
    fn into_config(self) -> Result<AccepterConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => config::load_config(path)?,
            None => AccepterConfig::default(),
        };

        if let Some(network) = self.network {
            config.listener.network = network;
        }
        if let Some(address) = self.address {
            config.listener.address = address;
        }
        if let (Some(cert_path), Some(key_path)) = (self.cert, self.key) {
            config.listener.tls = Some(CertificateConfig {
                cert_path,
                key_path,
            });
        }
        if let Some(secs) = self.drain_timeout_secs {
            config.shutdown.drain_timeout_secs = secs;
        }

        config::validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

async fn echo(cancel: CancellationToken, mut conn: Connection) {
    let mut buf = vec![0u8; ECHO_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            res = conn.read(&mut buf) => match res {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        if conn.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    tracing::debug!(connection_id = %conn.id(), peer_addr = %conn.peer_addr(), "Echo finished");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;
    init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        network = %config.listener.network,
        address = %config.listener.address,
        tls = config.listener.tls.is_some(),
        drain_timeout_secs = config.shutdown.drain_timeout_secs,
        "accepter-echo starting"
    );

    let accepter = Accepter::new(handler_fn(echo));

    let mut serving = tokio::spawn({
        let accepter = accepter.clone();
        let listener = config.listener.clone();
        async move {
            match &listener.tls {
                Some(tls) => {
                    accepter
                        .listen_and_serve_tls(
                            &listener.network,
                            &listener.address,
                            &tls.cert_path,
                            &tls.key_path,
                        )
                        .await
                }
                None => {
                    accepter
                        .listen_and_serve(&listener.network, &listener.address)
                        .await
                }
            }
        }
    });

    tokio::select! {
        res = &mut serving => {
            // Serving ended without a shutdown: bind, certificate or accept failure.
            res??;
            return Ok(());
        }
        signal = termination_signal() => {
            let signal = signal?;
            tracing::info!(%signal, "Shutting down gracefully");
        }
    }

    let deadline = Deadline::after(config.shutdown.drain_timeout());
    tokio::select! {
        res = accepter.shutdown(deadline) => {
            if let Err(e) = res {
                tracing::warn!(error = %e, "Shutdown did not drain cleanly");
            }
        }
        signal = termination_signal() => {
            let signal = signal?;
            tracing::warn!(%signal, "Second signal, closing all connections");
            accepter.close().await?;
        }
    }

    serving.await??;
    tracing::info!("Shutdown complete");
    Ok(())
}
