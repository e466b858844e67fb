use thiserror::Error;

use crate::patch::PatchError;

#[derive(Debug, Clone, Error)]
pub enum FoldError {
    #[error("invalid address \"{0}\"")]
    InvalidAddress(String),
    #[error("{0}: peer unreachable")]
    PeerUnreachable(String),
    #[error("connection lost")]
    TransportLost,
    #[error(transparent)]
    MalformedPatch(#[from] PatchError),
    #[error("state mirror desynchronized; a fresh snapshot is required")]
    Desynchronized,
    #[error("group \"{0}\" does not exist")]
    GroupNotFound(String),
    #[error("ambiguous group: {0}")]
    AmbiguousGroup(String),
    #[error("command send failed: {0}")]
    CommandSendFailed(String),
    #[error("timed out waiting for {0}")]
    ConvergenceTimeout(String),
    #[error("config key \"{0}\" cannot be set")]
    InvalidConfigKey(String),
    #[error("invalid value for \"{key}\": {reason}")]
    InvalidConfigValue { key: String, reason: String },
    #[error("{0}; use --force to override")]
    ForceRequired(String),
    #[error("{peer} runs client {version}; {required} required")]
    UnsupportedPeer {
        peer: String,
        version: String,
        required: String,
    },
}

/// One peer's terminal error under a multi-peer command. Sibling peers keep
/// their own results.
#[derive(Debug, Clone)]
pub struct PeerFailure {
    pub peer: String,
    pub error: FoldError,
}
