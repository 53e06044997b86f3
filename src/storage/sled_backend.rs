use std::path::Path;

use uuid::Uuid;

use super::{StorageBackend, StorageError};

const JOBS_TREE: &str = "jobs";
const PEERS_TREE: &str = "peers";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SledMode {
    LowSpace,
    HighThroughput,
}

impl SledMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low_space" => Some(Self::LowSpace),
            "high_throughput" => Some(Self::HighThroughput),
            _ => None,
        }
    }
}

pub struct SledStorage {
    db: sled::Db,
    jobs: sled::Tree,
    peers: sled::Tree,
}

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(match mode {
                SledMode::LowSpace => sled::Mode::LowSpace,
                SledMode::HighThroughput => sled::Mode::HighThroughput,
            });
        }

        let db = config.open()?;
        let jobs = db.open_tree(JOBS_TREE)?;
        let peers = db.open_tree(PEERS_TREE)?;
        Ok(Self { db, jobs, peers })
    }
}

fn decode_peer_entry(key: &[u8], value: &[u8]) -> Result<(u64, i64), StorageError> {
    let id: [u8; 8] = key
        .try_into()
        .map_err(|_| StorageError::CorruptedPeerEntry { len: key.len() })?;
    let at: [u8; 8] = value
        .try_into()
        .map_err(|_| StorageError::CorruptedPeerEntry { len: value.len() })?;
    Ok((u64::from_be_bytes(id), i64::from_be_bytes(at)))
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn upsert_job_record(&self, job_uuid: Uuid, record: &serde_json::Value) -> Result<(), StorageError> {
        let value = serde_json::to_vec(record).map_err(StorageError::SerializeJob)?;
        self.jobs.insert(job_uuid.as_bytes(), value)?;
        self.jobs.flush()?;
        Ok(())
    }

    fn get_job_record(&self, job_uuid: Uuid) -> Result<Option<serde_json::Value>, StorageError> {
        self.jobs
            .get(job_uuid.as_bytes())?
            .map(|raw| serde_json::from_slice(raw.as_ref()).map_err(StorageError::DeserializeJob))
            .transpose()
    }

    fn remove_job_record(&self, job_uuid: Uuid) -> Result<bool, StorageError> {
        let removed = self.jobs.remove(job_uuid.as_bytes())?.is_some();
        if removed {
            self.jobs.flush()?;
        }
        Ok(removed)
    }

    fn list_job_records(&self) -> Result<Vec<serde_json::Value>, StorageError> {
        let mut records = Vec::new();
        for entry in self.jobs.iter() {
            let (_, raw) = entry?;
            records.push(serde_json::from_slice(raw.as_ref()).map_err(StorageError::DeserializeJob)?);
        }
        Ok(records)
    }

    fn put_peer_heartbeat(&self, management_server_id: u64, at_ms: i64) -> Result<(), StorageError> {
        self.peers
            .insert(management_server_id.to_be_bytes(), at_ms.to_be_bytes().to_vec())?;
        Ok(())
    }

    fn get_peer_heartbeat(&self, management_server_id: u64) -> Result<Option<i64>, StorageError> {
        let Some(raw) = self.peers.get(management_server_id.to_be_bytes())? else {
            return Ok(None);
        };
        decode_peer_entry(&management_server_id.to_be_bytes(), raw.as_ref()).map(|(_, at)| Some(at))
    }

    fn list_peer_heartbeats(&self) -> Result<Vec<(u64, i64)>, StorageError> {
        let mut peers = Vec::new();
        for entry in self.peers.iter() {
            let (key, value) = entry?;
            peers.push(decode_peer_entry(key.as_ref(), value.as_ref())?);
        }
        Ok(peers)
    }
}
