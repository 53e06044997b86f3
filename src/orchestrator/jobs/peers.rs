use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::storage::{StorageError, StorageFacade};

/// Answers whether another management server is still running, so recovery
/// leaves its jobs alone.
pub trait PeerDirectory: Send + Sync {
    fn is_alive(&self, management_server_id: u64) -> bool;
}

#[derive(Debug, Default)]
pub struct StaticPeerDirectory {
    alive: HashSet<u64>,
}

impl StaticPeerDirectory {
    pub fn new(alive: impl IntoIterator<Item = u64>) -> Self {
        Self {
            alive: alive.into_iter().collect(),
        }
    }
}

impl PeerDirectory for StaticPeerDirectory {
    fn is_alive(&self, management_server_id: u64) -> bool {
        self.alive.contains(&management_server_id)
    }
}

/// Liveness from heartbeats written to the sled `peers` tree. A peer is
/// alive while its last heartbeat is younger than `ttl`.
pub struct StoragePeerDirectory {
    storage: Arc<StorageFacade>,
    ttl: Duration,
}

impl StoragePeerDirectory {
    pub fn new(storage: Arc<StorageFacade>, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    pub fn record_heartbeat(&self, management_server_id: u64, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.storage
            .put_peer_heartbeat(management_server_id, at.timestamp_millis())
    }

    pub fn last_seen(&self, management_server_id: u64) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self
            .storage
            .get_peer_heartbeat(management_server_id)?
            .and_then(|at_ms| Utc.timestamp_millis_opt(at_ms).single()))
    }

    pub fn is_alive_at(&self, management_server_id: u64, now: DateTime<Utc>) -> Result<bool, StorageError> {
        Ok(self
            .last_seen(management_server_id)?
            .is_some_and(|seen| now - seen < self.ttl))
    }

    /// Every server with a fresh heartbeat at `now`, sorted by id.
    pub fn live_peers_at(&self, now: DateTime<Utc>) -> Result<Vec<u64>, StorageError> {
        let mut live = self
            .storage
            .list_peer_heartbeats()?
            .into_iter()
            .filter(|(_, at_ms)| {
                Utc.timestamp_millis_opt(*at_ms)
                    .single()
                    .is_some_and(|seen| now - seen < self.ttl)
            })
            .map(|(management_server_id, _)| management_server_id)
            .collect::<Vec<_>>();
        live.sort_unstable();
        Ok(live)
    }
}

impl PeerDirectory for StoragePeerDirectory {
    fn is_alive(&self, management_server_id: u64) -> bool {
        match self.is_alive_at(management_server_id, Utc::now()) {
            Ok(alive) => alive,
            Err(error) => {
                // Unknown liveness: leave the peer's jobs alone.
                tracing::warn!(target: "jobs::peers", management_server_id, %error, "peer liveness lookup failed");
                true
            }
        }
    }
}
