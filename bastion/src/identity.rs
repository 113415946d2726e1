use std::net::SocketAddr;

use async_trait::async_trait;

/// The pre-authenticated identity a front-end hands the core for one
/// downstream connection.
///
/// `user_name` is the human identity asserted by whatever authenticated the
/// client (LDAP bind, SPNEGO/Kerberos — both out of scope here);
/// `target_address` and `group_ids` are whatever routing/authorization
/// metadata that front-end resolved for this user. None of the three are
/// re-derived from the SSH protocol handshake itself.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    pub user_name: String,
    pub target_address: String,
    pub group_ids: Vec<String>,
}

/// Narrow seam standing in for an LDAP/SPNEGO authentication front-end.
/// Implementations are expected to terminate whatever identity protocol
/// (HTTP CONNECT + Kerberos, LDAP bind, a TLS client-cert lookup, ...) fronts
/// this bastion and resolve it to a [`ConnectionIdentity`] before the
/// transport is ever handed to [`bastion_ssh::Server::handle_connection`].
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identify(&self, peer: SocketAddr) -> anyhow::Result<ConnectionIdentity>;
}

/// Stand-in identity front-end, configured once from CLI flags at startup.
/// Useful for exercising the bastion core end-to-end against one fixed
/// target without standing up a real LDAP or Kerberos deployment.
pub struct StaticIdentityProvider {
    identity: ConnectionIdentity,
}

impl StaticIdentityProvider {
    pub fn new(user_name: String, target_address: String, group_ids: Vec<String>) -> Self {
        Self {
            identity: ConnectionIdentity {
                user_name,
                target_address,
                group_ids,
            },
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn identify(&self, _peer: SocketAddr) -> anyhow::Result<ConnectionIdentity> {
        Ok(self.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_the_configured_identity_regardless_of_peer() {
        let provider = StaticIdentityProvider::new(
            "alice".to_owned(),
            "10.0.0.5:22".to_owned(),
            vec!["ops".to_owned(), "dba".to_owned()],
        );

        let a = provider.identify("127.0.0.1:4000".parse().unwrap()).await.unwrap();
        let b = provider.identify("127.0.0.1:4001".parse().unwrap()).await.unwrap();

        assert_eq!(a.user_name, "alice");
        assert_eq!(a.target_address, "10.0.0.5:22");
        assert_eq!(a.group_ids, vec!["ops".to_owned(), "dba".to_owned()]);
        assert_eq!(a.user_name, b.user_name);
    }
}
