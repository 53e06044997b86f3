use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::transport::Link;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("anonymous connection {connection_id} not found")]
    AnonymousConnectionNotFound { connection_id: u64 },
    #[error("agent {agent_id} not found")]
    AgentNotFound { agent_id: u64 },
    #[error("connection {connection_id} is already registered")]
    DuplicateConnection { connection_id: u64 },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct AnonymousConnectionRecord {
    pub connection_id: u64,
    pub link: Arc<dyn Link>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentMetadata {
    pub host_name: String,
    pub agent_version: String,
}

#[derive(Clone)]
pub struct AgentRecord {
    pub agent_id: u64,
    pub connection_id: u64,
    pub link: Arc<dyn Link>,
    pub promoted_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub metadata: AgentMetadata,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentSnapshot {
    pub agent_id: u64,
    pub connection_id: u64,
    pub promoted_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub metadata: AgentMetadata,
}

#[derive(Default)]
pub struct AnonymousConnectionsPool {
    records: Mutex<HashMap<u64, AnonymousConnectionRecord>>,
}

impl AnonymousConnectionsPool {
    pub fn register(&self, link: Arc<dyn Link>) -> Result<u64, PoolError> {
        let connection_id = link.id();
        let mut records = lock(&self.records);
        if records.contains_key(&connection_id) {
            return Err(PoolError::DuplicateConnection { connection_id });
        }
        records.insert(
            connection_id,
            AnonymousConnectionRecord {
                connection_id,
                link,
                connected_at: Utc::now(),
            },
        );
        Ok(connection_id)
    }

    pub fn contains(&self, connection_id: u64) -> bool {
        lock(&self.records).contains_key(&connection_id)
    }

    pub fn count(&self) -> usize {
        lock(&self.records).len()
    }

    fn take(&self, connection_id: u64) -> Result<AnonymousConnectionRecord, PoolError> {
        lock(&self.records)
            .remove(&connection_id)
            .ok_or(PoolError::AnonymousConnectionNotFound { connection_id })
    }

    /// Connections that have not announced themselves within `timeout`.
    pub fn expired(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<u64> {
        lock(&self.records)
            .values()
            .filter(|record| now - record.connected_at > timeout)
            .map(|record| record.connection_id)
            .collect()
    }
}

#[derive(Default)]
pub struct AgentsPool {
    records: Mutex<HashMap<u64, AgentRecord>>,
}

impl AgentsPool {
    fn insert(&self, record: AgentRecord) -> Option<AgentRecord> {
        lock(&self.records).insert(record.agent_id, record)
    }

    pub fn connection_for(&self, agent_id: u64) -> Option<u64> {
        lock(&self.records)
            .get(&agent_id)
            .map(|record| record.connection_id)
    }

    pub fn agent_for_connection(&self, connection_id: u64) -> Option<u64> {
        lock(&self.records)
            .values()
            .find(|record| record.connection_id == connection_id)
            .map(|record| record.agent_id)
    }

    pub fn touch_now(&self, agent_id: u64) -> Result<(), PoolError> {
        let mut records = lock(&self.records);
        let record = records
            .get_mut(&agent_id)
            .ok_or(PoolError::AgentNotFound { agent_id })?;
        record.last_seen_at = Utc::now();
        Ok(())
    }

    pub fn snapshot(&self, agent_id: u64) -> Option<AgentSnapshot> {
        lock(&self.records).get(&agent_id).map(|record| AgentSnapshot {
            agent_id: record.agent_id,
            connection_id: record.connection_id,
            promoted_at: record.promoted_at,
            last_seen_at: record.last_seen_at,
            metadata: record.metadata.clone(),
        })
    }

    pub fn count(&self) -> usize {
        lock(&self.records).len()
    }

    fn remove_connection(&self, connection_id: u64) -> Option<u64> {
        let mut records = lock(&self.records);
        let agent_id = records
            .values()
            .find(|record| record.connection_id == connection_id)
            .map(|record| record.agent_id)?;
        records.remove(&agent_id);
        Some(agent_id)
    }
}

/// Registry of every live connection: anonymous until the startup handshake,
/// then keyed by agent id.
#[derive(Default)]
pub struct ConnectionPools {
    pub anonymous: AnonymousConnectionsPool,
    pub agents: AgentsPool,
}

impl ConnectionPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_anonymous(&self, link: Arc<dyn Link>) -> Result<u64, PoolError> {
        self.anonymous.register(link)
    }

    /// Registers a connection whose agent identity is already known.
    pub fn register_agent(
        &self,
        agent_id: u64,
        link: Arc<dyn Link>,
        metadata: AgentMetadata,
    ) -> Option<u64> {
        let now = Utc::now();
        let connection_id = link.id();
        self.agents
            .insert(AgentRecord {
                agent_id,
                connection_id,
                link,
                promoted_at: now,
                last_seen_at: now,
                metadata,
            })
            .map(|replaced| replaced.connection_id)
            .filter(|replaced| *replaced != connection_id)
    }

    /// Moves an anonymous connection into the agent registry. A reconnecting
    /// agent supersedes its previous connection, whose id is returned so the
    /// caller can tear it down.
    pub fn promote_anonymous_to_agent(
        &self,
        connection_id: u64,
        agent_id: u64,
        metadata: AgentMetadata,
    ) -> Result<Option<u64>, PoolError> {
        let record = self.anonymous.take(connection_id)?;
        Ok(self.register_agent(agent_id, record.link, metadata))
    }

    /// Forgets a connection in whichever pool holds it. Returns the agent id
    /// when the connection belonged to an identified agent.
    pub fn remove_connection(&self, connection_id: u64) -> Option<u64> {
        if self.anonymous.take(connection_id).is_ok() {
            return None;
        }
        self.agents.remove_connection(connection_id)
    }
}
