use std::path::PathBuf;

/// Central error type for the bastion core.
///
/// A flat `thiserror` enum mixing `#[error(transparent)]` wraps of foreign
/// errors with a handful of variants specific to this crate's failure modes.
#[derive(thiserror::Error, Debug)]
pub enum BastionError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("host key mismatch for {host}: known key is {known_key_type}, presented key is {presented_key_type}")]
    HostKeyMismatch {
        host: String,
        known_key_type: String,
        presented_key_type: String,
    },

    #[error("failed to initialize recording: {0}")]
    RecordingInitFailed(#[source] std::io::Error),

    #[error("{0}")]
    UpstreamDialFailed(String),

    #[error("{0}")]
    UpstreamSessionFailed(String),

    #[error("unknown channel type: {0}")]
    UnknownChannelType(String),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Keys(#[from] russh::keys::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
