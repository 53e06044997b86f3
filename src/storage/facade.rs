use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::AppConfig;

use super::{SledMode, SledStorage, StorageBackend, StorageError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageEngine {
    Sled,
}

impl StorageEngine {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sled" => Some(Self::Sled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sled => "sled",
        }
    }
}

pub struct StorageFacade {
    engine: StorageEngine,
    data_path: PathBuf,
    backend: Box<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig) -> Result<Self, StorageError> {
        let storage = &app_config.storage;
        let Some(engine) = StorageEngine::parse(&storage.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: storage.engine.clone(),
            });
        };
        let data_path = expand_home_path(&storage.path)?;

        tracing::info!(
            target: "storage::init",
            engine = engine.as_str(),
            configured_path = %storage.path,
            resolved_path = %data_path.display(),
            cache_capacity = ?storage.sled.cache_capacity,
            mode = ?storage.sled.mode,
            "initializing storage facade"
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let backend: Box<dyn StorageBackend> = match engine {
            StorageEngine::Sled => {
                let mode = storage
                    .sled
                    .mode
                    .as_deref()
                    .map(|raw| {
                        SledMode::parse(raw).ok_or_else(|| StorageError::InvalidSledMode {
                            mode: raw.to_owned(),
                        })
                    })
                    .transpose()?;

                Box::new(SledStorage::open(&data_path, storage.sled.cache_capacity, mode)?)
            }
        };

        Ok(Self {
            engine,
            data_path,
            backend,
        })
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    pub fn upsert_job_record(&self, job_uuid: Uuid, record: &serde_json::Value) -> Result<(), StorageError> {
        self.backend.upsert_job_record(job_uuid, record)
    }

    pub fn get_job_record(&self, job_uuid: Uuid) -> Result<Option<serde_json::Value>, StorageError> {
        self.backend.get_job_record(job_uuid)
    }

    pub fn remove_job_record(&self, job_uuid: Uuid) -> Result<bool, StorageError> {
        self.backend.remove_job_record(job_uuid)
    }

    pub fn list_job_records(&self) -> Result<Vec<serde_json::Value>, StorageError> {
        self.backend.list_job_records()
    }

    pub fn put_peer_heartbeat(&self, management_server_id: u64, at_ms: i64) -> Result<(), StorageError> {
        self.backend.put_peer_heartbeat(management_server_id, at_ms)
    }

    pub fn get_peer_heartbeat(&self, management_server_id: u64) -> Result<Option<i64>, StorageError> {
        self.backend.get_peer_heartbeat(management_server_id)
    }

    pub fn list_peer_heartbeats(&self) -> Result<Vec<(u64, i64)>, StorageError> {
        self.backend.list_peer_heartbeats()
    }
}

pub(crate) fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    let home = || std::env::var("HOME").map_err(|_| StorageError::HomeDirectoryUnavailable);

    if let Some(rest) = raw_path.strip_prefix("~/") {
        return Ok(PathBuf::from(home()?).join(rest));
    }
    if let Some(rest) = raw_path.strip_prefix("$HOME") {
        if rest.is_empty() || rest.starts_with('/') {
            return Ok(PathBuf::from(format!("{}{rest}", home()?)));
        }
    }

    Ok(PathBuf::from(raw_path))
}
