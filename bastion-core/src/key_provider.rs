use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use russh::keys::PrivateKey;
use tracing::warn;

/// Resolves a user's group memberships to the ordered list of private keys
/// they may use to authenticate to upstream hosts.
///
/// Reads and parses key files over `russh::keys`, generalized from a fixed
/// host-key pair to a per-group lookup: unknown groups are silently skipped,
/// unreadable or unparsable key files are logged and skipped without
/// aborting the rest of the lookup.
#[derive(Clone)]
pub struct KeyProvider {
    group_to_key_paths: Arc<HashMap<String, Vec<PathBuf>>>,
}

impl KeyProvider {
    pub fn new(group_to_key_paths: HashMap<String, Vec<PathBuf>>) -> Self {
        Self {
            group_to_key_paths: Arc::new(group_to_key_paths),
        }
    }

    /// Returns the concatenation, in `group_ids` order, of every signer
    /// reachable from the groups a user belongs to. Duplicates are
    /// preserved: upstream authentication tries keys in order, and a user in
    /// two groups sharing a key should offer it twice rather than have the
    /// lookup silently dedupe it.
    pub async fn keys_for(&self, group_ids: &[String]) -> Vec<PrivateKey> {
        let mut signers = Vec::new();

        for group_id in group_ids {
            let Some(paths) = self.group_to_key_paths.get(group_id) else {
                continue;
            };

            for path in paths {
                let path = path.clone();
                match tokio::task::spawn_blocking({
                    let path = path.clone();
                    move || russh::keys::load_secret_key(&path, None)
                })
                .await
                {
                    Ok(Ok(signer)) => signers.push(signer),
                    Ok(Err(error)) => {
                        warn!(path = %path.display(), %error, "could not load/parse private key, skipping");
                    }
                    Err(join_error) => {
                        warn!(path = %path.display(), %join_error, "key-loading task panicked, skipping");
                    }
                }
            }
        }

        signers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_group_is_skipped_without_error() {
        let provider = KeyProvider::new(HashMap::new());
        let signers = provider.keys_for(&["nonexistent".to_owned()]).await;
        assert!(signers.is_empty());
    }

    #[tokio::test]
    async fn unreadable_key_file_is_skipped_not_fatal() {
        let mut map = HashMap::new();
        map.insert(
            "ops".to_owned(),
            vec![PathBuf::from("/nonexistent/key/path")],
        );
        let provider = KeyProvider::new(map);
        let signers = provider.keys_for(&["ops".to_owned()]).await;
        assert!(signers.is_empty());
    }

    #[tokio::test]
    async fn duplicate_group_membership_preserves_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_ed25519");
        let key = russh::keys::PrivateKey::random(
            &mut rand::rngs::OsRng,
            russh::keys::Algorithm::Ed25519,
        )
        .unwrap();
        std::fs::write(&key_path, key.to_openssh(Default::default()).unwrap()).unwrap();

        let mut map = HashMap::new();
        map.insert("ops".to_owned(), vec![key_path.clone()]);
        map.insert("dba".to_owned(), vec![key_path]);

        let provider = KeyProvider::new(map);
        let signers = provider
            .keys_for(&["ops".to_owned(), "dba".to_owned()])
            .await;
        assert_eq!(signers.len(), 2);
    }
}
