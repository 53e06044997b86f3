use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unsupported storage.engine '{engine}'; currently only 'sled' is supported")]
    UnsupportedEngine { engine: String },
    #[error("invalid storage.sled.mode '{mode}'; allowed values: low_space, high_throughput")]
    InvalidSledMode { mode: String },
    #[error("cannot resolve storage path because HOME is not set")]
    HomeDirectoryUnavailable,
    #[error("failed to create storage data directory '{}': {source}", path.display())]
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize job record for storage: {0}")]
    SerializeJob(serde_json::Error),
    #[error("failed to deserialize job record from storage: {0}")]
    DeserializeJob(serde_json::Error),
    #[error("corrupted peer heartbeat entry ({len} bytes)")]
    CorruptedPeerEntry { len: usize },
    #[error("sled storage error: {0}")]
    Sled(#[from] sled::Error),
}
