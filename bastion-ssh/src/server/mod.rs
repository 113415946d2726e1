pub mod handler;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bastion_core::{KeyProvider, TrustStore};
use russh::keys::PrivateKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::unbounded_channel;
use tracing::error;

pub use handler::{ServerEvent, ServerHandler};

use crate::session_relay::SessionRelay;

/// Per-connection entry point of the bastion's SSH protocol surface. Holds
/// the configuration needed to run any number of downstream connections
/// concurrently; stateless beyond that.
///
/// The listener accept loop itself lives in the `bastion` binary crate (its
/// `IdentityProvider` decides `user_name`/`target_address`/`group_ids` per
/// connection before this is called), so only the per-connection handshake
/// and relay wiring are kept here.
pub struct Server {
    config: Arc<russh::server::Config>,
    key_provider: KeyProvider,
    trust_store: Arc<TrustStore>,
    log_root: PathBuf,
}

impl Server {
    pub fn new(host_keys: Vec<PrivateKey>, key_provider: KeyProvider, trust_store: Arc<TrustStore>, log_root: PathBuf) -> Self {
        let config = russh::server::Config {
            keys: host_keys,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            key_provider,
            trust_store,
            log_root,
        }
    }

    /// Runs the SSH handshake over `transport`, then hands the connection
    /// off to a [`SessionRelay`] until it completes.
    ///
    /// `remote_addr` is the downstream peer address, needed for the audit
    /// log lines the relay and this function emit; the caller (the
    /// `bastion` binary's accept loop, which already holds the accepted
    /// `TcpStream`) supplies it alongside the pre-authenticated identity.
    pub async fn handle_connection<T>(
        &self,
        transport: T,
        remote_addr: SocketAddr,
        user_name: String,
        target_address: String,
        group_ids: Vec<String>,
    ) -> anyhow::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (event_tx, event_rx) = unbounded_channel();
        let handler = ServerHandler { event_tx };

        let relay = SessionRelay::new(
            user_name.clone(),
            target_address,
            remote_addr,
            group_ids,
            self.key_provider.clone(),
            self.trust_store.clone(),
            self.log_root.clone(),
        );

        let config = self.config.clone();
        let protocol = tokio::spawn(async move {
            let session = russh::server::run_stream(config, transport, handler).await?;
            session.await
        });

        let relay_result = relay.run(event_rx).await;

        if relay_result.is_err() {
            protocol.abort();
        }
        if let Err(join_error) = protocol.await {
            if !join_error.is_cancelled() {
                error!(%join_error, "ssh protocol task panicked");
            }
        }

        tracing::info!("Connection closed by {remote_addr} (User: {user_name}).");

        relay_result
    }
}
