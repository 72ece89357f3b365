// Replica Communication
//
// Outbound commands to storage nodes. Implementations must be idempotent
// per (partition, version, replica) and per (table, schema version,
// replica): the kernel delivers at least once.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::ids::{PartitionId, ReplicaId, TableId};
use crate::schema::SchemaMutation;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("{0} timed out")]
    Timeout(ReplicaId),

    #[error("{0} unavailable: {1}")]
    Unavailable(ReplicaId, String),

    /// The replica refuses the command and will keep refusing it.
    #[error("{0} rejected command: {1}")]
    Rejected(ReplicaId, String),
}

impl ReplicaError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(..))
    }
}

#[async_trait]
pub trait ReplicaClient: Send + Sync {
    /// Make `version` of `partition` visible on `replica`.
    async fn publish_partition(
        &self,
        partition: PartitionId,
        version: u64,
        replica: ReplicaId,
    ) -> Result<(), ReplicaError>;

    /// Apply a schema mutation to every tablet of `table` on `replica`.
    async fn apply_schema_mutation(
        &self,
        table: TableId,
        replica: ReplicaId,
        mutation: &SchemaMutation,
    ) -> Result<(), ReplicaError>;
}

#[derive(Debug, Default)]
struct ReplicaState {
    down: HashSet<ReplicaId>,
    rejecting: HashMap<ReplicaId, String>,
    published: HashMap<(PartitionId, ReplicaId), Vec<u64>>,
    mutated: HashMap<(TableId, ReplicaId), Vec<u64>>,
}

/// Scriptable in-process replica fleet. Records every command it accepts.
#[derive(Debug, Default)]
pub struct InMemoryReplicas {
    state: Mutex<ReplicaState>,
}

impl InMemoryReplicas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `replica` fail every command with `Unavailable` until brought back.
    pub fn set_down(&self, replica: ReplicaId, down: bool) {
        let mut state = self.state.lock();
        if down {
            state.down.insert(replica);
        } else {
            state.down.remove(&replica);
        }
    }

    /// Make `replica` permanently reject schema mutations.
    pub fn reject_schema_changes(&self, replica: ReplicaId, reason: &str) {
        self.state.lock().rejecting.insert(replica, reason.into());
    }

    /// How many publish commands `replica` accepted for `partition`.
    pub fn publish_count(&self, partition: PartitionId, replica: ReplicaId) -> usize {
        self.state
            .lock()
            .published
            .get(&(partition, replica))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn mutation_count(&self, table: TableId, replica: ReplicaId) -> usize {
        self.state
            .lock()
            .mutated
            .get(&(table, replica))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ReplicaClient for InMemoryReplicas {
    async fn publish_partition(
        &self,
        partition: PartitionId,
        version: u64,
        replica: ReplicaId,
    ) -> Result<(), ReplicaError> {
        let mut state = self.state.lock();
        if state.down.contains(&replica) {
            return Err(ReplicaError::Unavailable(replica, "node down".into()));
        }
        state
            .published
            .entry((partition, replica))
            .or_default()
            .push(version);
        Ok(())
    }

    async fn apply_schema_mutation(
        &self,
        table: TableId,
        replica: ReplicaId,
        mutation: &SchemaMutation,
    ) -> Result<(), ReplicaError> {
        let mut state = self.state.lock();
        if state.down.contains(&replica) {
            return Err(ReplicaError::Unavailable(replica, "node down".into()));
        }
        if let Some(reason) = state.rejecting.get(&replica) {
            return Err(ReplicaError::Rejected(replica, reason.clone()));
        }
        state
            .mutated
            .entry((table, replica))
            .or_default()
            .push(mutation.schema_version);
        Ok(())
    }
}
