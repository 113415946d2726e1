use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use ::config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::BastionError;

/// The full configuration surface consumed by the core.
///
/// Deliberately flat and YAML-shaped rather than a `Union`/`Object` schema
/// tree — this crate has one protocol and no admin API, so there's nothing
/// for a schema registry to describe.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Address the SSH listener binds to.
    pub listen: SocketAddr,

    /// Root directory recordings are written under.
    pub log_root: PathBuf,

    /// Paths to this bastion's own SSH host keys.
    pub host_keys: Vec<PathBuf>,

    /// OpenSSH-format known_hosts file used for upstream TOFU.
    pub known_hosts_file: PathBuf,

    /// Group id -> ordered list of private key files authorized for that
    /// group. A user's key list is the concatenation, in group-iteration
    /// order, of every group they belong to.
    #[serde(default)]
    pub keys: HashMap<String, Vec<PathBuf>>,
}

/// Loads and validates configuration from a YAML file, with `BASTION_`
/// prefixed environment variable overrides layered on top.
///
/// Uses the `config` crate over a `File` source plus an `Environment`
/// source, `try_deserialize`'d directly into the target struct.
pub fn load_config(path: &Path) -> Result<Config, BastionError> {
    let config: Config = ConfigBuilder::builder()
        .add_source(File::from(path))
        .add_source(Environment::with_prefix("BASTION").separator("__"))
        .build()
        .map_err(|e| BastionError::ConfigRead {
            path: path.to_owned(),
            source: Box::new(e),
        })?
        .try_deserialize()
        .map_err(|e| BastionError::ConfigRead {
            path: path.to_owned(),
            source: Box::new(e),
        })?;

    info!(
        groups = config.keys.len(),
        host_keys = config.host_keys.len(),
        "loaded configuration from {}",
        path.display()
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config() {
        let mut f = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            f,
            r#"
listen: "0.0.0.0:2222"
log_root: /tmp/bastion-logs
host_keys:
  - /tmp/host_key
known_hosts_file: /tmp/known_hosts
keys:
  ops:
    - /tmp/ops_key
"#
        )
        .unwrap();

        let config = load_config(f.path()).unwrap();
        assert_eq!(config.listen.port(), 2222);
        assert_eq!(config.keys["ops"], vec![PathBuf::from("/tmp/ops_key")]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config(Path::new("/nonexistent/bastion.yaml")).is_err());
    }
}
