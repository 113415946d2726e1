mod cli;
mod identity;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use bastion_core::{KeyProvider, TrustStore};
use bastion_ssh::{keys::load_host_keys, Server};

use crate::cli::Cli;
use crate::identity::{IdentityProvider, StaticIdentityProvider};

/// Binds the listener and runs the accept loop until shutdown.
///
/// Load config, build the protocol server, accept in a loop racing
/// `ctrl_c`. This crate has exactly one protocol server (no HTTP/MySQL/admin
/// surface), so there's a single accept loop rather than a multi-protocol
/// fan-out.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    bastion_common::logging::init_logging("info").context("failed to initialize logging")?;

    let config = bastion_common::config::load_config(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    let listen_addr = cli.listen.unwrap_or(config.listen);

    let host_keys = load_host_keys(&config.host_keys);
    if host_keys.is_empty() {
        anyhow::bail!("no usable host keys were loaded from {:?}", config.host_keys);
    }

    let key_provider = KeyProvider::new(config.keys.clone());
    let trust_store = Arc::new(TrustStore::new(config.known_hosts_file.clone()));
    let server = Arc::new(Server::new(host_keys, key_provider, trust_store, config.log_root.clone()));

    let identity_provider: Arc<dyn IdentityProvider> =
        Arc::new(StaticIdentityProvider::new(cli.user.clone(), cli.target.clone(), cli.groups.clone()));

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;

    info!(%listen_addr, target = %cli.target, "bastion is now accepting SSH connections");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down on ctrl-c");
                break;
            }
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(error) => {
                        warn!(%error, "failed to accept connection");
                        continue;
                    }
                };

                let server = server.clone();
                let identity_provider = identity_provider.clone();

                tokio::spawn(async move {
                    let identity = match identity_provider.identify(remote_addr).await {
                        Ok(identity) => identity,
                        Err(error) => {
                            warn!(%remote_addr, %error, "identity resolution failed, dropping connection");
                            return;
                        }
                    };

                    if let Err(error) = server
                        .handle_connection(
                            stream,
                            remote_addr,
                            identity.user_name,
                            identity.target_address,
                            identity.group_ids,
                        )
                        .await
                    {
                        error!(%remote_addr, %error, "session ended with an error");
                    }
                });
            }
        }
    }

    Ok(())
}
