use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::{PublicKey, PublicKeyBase64};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use bastion_common::error::BastionError;
use bastion_common::fs::secure_secret_file;

/// Outcome of checking a presented host key against the known-hosts file.
#[derive(Debug)]
pub enum Verdict {
    /// Matched an existing entry.
    Known,
    /// No entry for this host existed; it has just been appended.
    Trusted,
}

/// Trust-on-first-use policy for upstream host keys.
///
/// Splits verification and persistence the way OpenSSH `known_hosts`
/// checking conventionally does, onto a flat OpenSSH known_hosts file rather
/// than a database table. Appends are serialized behind an in-process mutex
/// rather than a `flock`, per the Open Question resolution in DESIGN.md.
pub struct TrustStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

struct Entry {
    host: String,
    key_type: String,
    key_base64: String,
}

fn parse_line(line: &str) -> Option<Entry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.splitn(3, char::is_whitespace);
    let host = parts.next()?.to_owned();
    let key_type = parts.next()?.to_owned();
    let key_base64 = parts.next()?.trim().to_owned();
    Some(Entry {
        host,
        key_type,
        key_base64,
    })
}

impl TrustStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn read_entries(&self) -> Result<Vec<Entry>, BastionError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(BastionError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Ok(data.lines().filter_map(parse_line).collect())
    }

    /// Verifies `presented_key` for `hostname`, appending a first-contact
    /// entry when the host is entirely unknown.
    ///
    /// - Matching entry found -> `Ok(Verdict::Known)`.
    /// - Entries exist for `hostname` but none match -> `Err(HostKeyMismatch)`,
    ///   file unchanged.
    /// - No entry for `hostname` -> append `<host> <type> <base64>\n` and
    ///   return `Ok(Verdict::Trusted)`.
    pub async fn verify(
        &self,
        hostname: &str,
        _remote_addr: SocketAddr,
        presented_key: &PublicKey,
    ) -> Result<Verdict, BastionError> {
        let _guard = self.write_lock.lock().await;

        let entries = self.read_entries().await?;
        let presented_type = presented_key.algorithm().as_str().to_owned();
        let presented_base64 = presented_key.public_key_base64();

        let for_host: Vec<&Entry> = entries.iter().filter(|e| e.host == hostname).collect();

        if let Some(matched) = for_host
            .iter()
            .find(|e| e.key_type == presented_type && e.key_base64 == presented_base64)
        {
            let _ = matched;
            return Ok(Verdict::Known);
        }

        if let Some(first) = for_host.first() {
            return Err(BastionError::HostKeyMismatch {
                host: hostname.to_owned(),
                known_key_type: first.key_type.clone(),
                presented_key_type: presented_type,
            });
        }

        self.append(hostname, &presented_type, &presented_base64)
            .await?;
        info!(host = hostname, key_type = %presented_type, "trusted new host key on first contact");
        Ok(Verdict::Trusted)
    }

    async fn append(&self, host: &str, key_type: &str, key_base64: &str) -> Result<(), BastionError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|source| BastionError::Io {
                    path: parent.to_owned(),
                    source,
                })?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| BastionError::Io {
                path: self.path.clone(),
                source,
            })?;

        let line = format!("{host} {key_type} {key_base64}\n");
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| BastionError::Io {
                path: self.path.clone(),
                source,
            })?;

        if let Err(e) = secure_secret_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to set known_hosts permissions");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::{Algorithm, PrivateKey};

    fn fake_key(_seed: u8) -> PublicKey {
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
        key.public_key().clone()
    }

    #[tokio::test]
    async fn first_contact_trusts_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let store = TrustStore::new(&path);
        let key = fake_key(1);
        let addr: SocketAddr = "127.0.0.1:22".parse().unwrap();

        let verdict = store.verify("host-a", addr, &key).await.unwrap();
        assert!(matches!(verdict, Verdict::Trusted));

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.starts_with("host-a "));
    }

    #[tokio::test]
    async fn second_contact_with_same_key_succeeds_without_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let store = TrustStore::new(&path);
        let key = fake_key(2);
        let addr: SocketAddr = "127.0.0.1:22".parse().unwrap();

        store.verify("host-b", addr, &key).await.unwrap();
        store.verify("host-b", addr, &key).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn mismatched_key_is_rejected_and_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let store = TrustStore::new(&path);
        let addr: SocketAddr = "127.0.0.1:22".parse().unwrap();

        store.verify("host-c", addr, &fake_key(3)).await.unwrap();
        let before = tokio::fs::read_to_string(&path).await.unwrap();

        let err = store.verify("host-c", addr, &fake_key(4)).await.unwrap_err();
        assert!(matches!(err, BastionError::HostKeyMismatch { .. }));

        let after = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(before, after);
    }
}
