use std::path::Path;

use russh::keys::PrivateKey;
use tracing::warn;

/// Loads the configured host keys, skipping (with a warning) any file that
/// cannot be read or parsed rather than failing the whole server.
///
/// Generalized to an arbitrary list of key files rather than a fixed
/// Ed25519/RSA pair. Host key generation is out of scope: the operator is
/// expected to provision host keys out of band.
pub fn load_host_keys(paths: &[impl AsRef<Path>]) -> Vec<PrivateKey> {
    let mut keys = Vec::new();
    for path in paths {
        let path = path.as_ref();
        match russh::keys::load_secret_key(path, None) {
            Ok(key) => keys.push(key),
            Err(error) => {
                warn!(path = %path.display(), %error, "could not load host key, skipping");
            }
        }
    }
    keys
}
