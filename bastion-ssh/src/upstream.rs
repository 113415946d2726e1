use std::net::ToSocketAddrs;
use std::sync::Arc;

use bastion_common::error::BastionError;
use bastion_core::TrustStore;
use russh::client::{Handle, Msg};
use russh::keys::PrivateKey;
use russh::{Channel, Disconnect};
use tracing::warn;

/// Delegates host-key verification to the shared [`TrustStore`], the only
/// thing this relay's upstream client cares about beyond plumbing. Auto-
/// accepts first contact instead of asking a human, with no session-sharing
/// event bus.
pub struct ClientHandler {
    pub hostname: String,
    pub trust_store: Arc<TrustStore>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientHandlerError {
    #[error("host key verification failed: {0}")]
    Trust(#[from] BastionError),

    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

impl russh::client::Handler for ClientHandler {
    type Error = ClientHandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let remote_addr = self
            .hostname
            .to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .unwrap_or_else(|| "0.0.0.0:0".parse().expect("valid fallback address"));

        match self
            .trust_store
            .verify(&self.hostname, remote_addr, server_public_key)
            .await
        {
            Ok(_) => Ok(true),
            Err(error) => {
                warn!(host = %self.hostname, %error, "upstream host key rejected");
                Err(error.into())
            }
        }
    }
}

/// Establishes an authenticated SSH connection to the target. Constructed
/// fresh per session; holds no state of its own beyond what's needed to dial
/// once.
///
/// Forwards the downstream username verbatim, tries each configured signer
/// via public-key auth in turn, and delegates host-key checks to
/// [`ClientHandler`].
pub struct UpstreamDialer {
    trust_store: Arc<TrustStore>,
}

impl UpstreamDialer {
    pub fn new(trust_store: Arc<TrustStore>) -> Self {
        Self { trust_store }
    }

    /// Dials `target_addr` ("host:port"), authenticating as `ssh_user` by
    /// trying each of `signers` in order until one succeeds.
    pub async fn dial(
        &self,
        target_addr: &str,
        ssh_user: &str,
        signers: Vec<PrivateKey>,
    ) -> Result<Handle<ClientHandler>, BastionError> {
        let address = target_addr
            .to_socket_addrs()
            .map_err(|source| BastionError::Io {
                path: target_addr.into(),
                source,
            })?
            .next()
            .ok_or_else(|| BastionError::UpstreamDialFailed(format!("could not resolve {target_addr}")))?;

        let config = Arc::new(russh::client::Config::default());
        let handler = ClientHandler {
            hostname: target_addr.to_owned(),
            trust_store: self.trust_store.clone(),
        };

        let mut session = russh::client::connect(config, address, handler)
            .await
            .map_err(|error| BastionError::UpstreamDialFailed(error.to_string()))?;

        let mut authenticated = false;
        for signer in signers {
            match session
                .authenticate_publickey(ssh_user.to_owned(), Arc::new(signer))
                .await
            {
                Ok(true) => {
                    authenticated = true;
                    break;
                }
                Ok(false) => continue,
                Err(error) => {
                    warn!(%error, "public-key auth attempt failed");
                    continue;
                }
            }
        }

        if !authenticated {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "")
                .await;
            return Err(BastionError::UpstreamDialFailed(
                "no offered key was accepted".to_owned(),
            ));
        }

        Ok(session)
    }
}

/// Opens the upstream `session` channel once authentication succeeds.
pub async fn open_session_channel(
    handle: &Handle<ClientHandler>,
) -> Result<Channel<Msg>, BastionError> {
    handle
        .channel_open_session()
        .await
        .map_err(|error| BastionError::UpstreamSessionFailed(error.to_string()))
}
