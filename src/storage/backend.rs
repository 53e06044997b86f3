use uuid::Uuid;

use super::StorageError;

/// Raw persistence used by the job store and the peer directory. Job records
/// are opaque JSON documents keyed by UUID; peers map a management-server id
/// to its last heartbeat in epoch millis.
pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;

    fn upsert_job_record(&self, job_uuid: Uuid, record: &serde_json::Value) -> Result<(), StorageError>;
    fn get_job_record(&self, job_uuid: Uuid) -> Result<Option<serde_json::Value>, StorageError>;
    fn remove_job_record(&self, job_uuid: Uuid) -> Result<bool, StorageError>;
    fn list_job_records(&self) -> Result<Vec<serde_json::Value>, StorageError>;

    fn put_peer_heartbeat(&self, management_server_id: u64, at_ms: i64) -> Result<(), StorageError>;
    fn get_peer_heartbeat(&self, management_server_id: u64) -> Result<Option<i64>, StorageError>;
    fn list_peer_heartbeats(&self) -> Result<Vec<(u64, i64)>, StorageError>;
}
