// Load Transactions
//
// A transaction record and the reducer that moves it through its
// lifecycle. The reducer is pure and shared by the live manager and by
// log replay, so both derive identical state from identical events.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::QuorumPolicy;
use crate::ids::{DbId, JobId, PartitionId, ReplicaId, TableId, TxnId};
use crate::invariants::InvariantViolation;
use crate::log::{LogError, StateEvent};
use crate::state::{StateError, TxnState};

pub mod manager;
pub mod publish;

pub use manager::TransactionManager;
pub use publish::PublishProgress;

/// One partition of a commit request: which replicas must accept the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCommit {
    pub table: TableId,
    pub partition: PartitionId,
    pub replicas: BTreeSet<ReplicaId>,
}

/// Publish progress of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPublish {
    pub table: TableId,
    pub partition: PartitionId,
    pub replicas: Vec<ReplicaId>,
    /// Ack bitmap, parallel to `replicas`.
    pub acked: Vec<bool>,
    /// Set once, when the quorum is first met.
    pub visible: bool,
}

impl PartitionPublish {
    fn from_commit(commit: &PartitionCommit) -> Self {
        let replicas: Vec<_> = commit.replicas.iter().copied().collect();
        Self {
            table: commit.table,
            partition: commit.partition,
            acked: vec![false; replicas.len()],
            replicas,
            visible: false,
        }
    }

    pub fn acked_count(&self) -> usize {
        self.acked.iter().filter(|a| **a).count()
    }

    pub fn is_acked(&self, replica: ReplicaId) -> bool {
        self.replicas
            .iter()
            .position(|r| *r == replica)
            .is_some_and(|i| self.acked[i])
    }

    pub fn quorum_met(&self, policy: QuorumPolicy) -> bool {
        self.acked_count() >= policy.required(self.replicas.len())
    }

    /// Replicas that still need the publish command.
    pub fn pending_replicas(&self) -> Vec<ReplicaId> {
        self.replicas
            .iter()
            .zip(&self.acked)
            .filter(|(_, acked)| !**acked)
            .map(|(replica, _)| *replica)
            .collect()
    }
}

/// Per-partition replica sets plus their ack state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishManifest {
    pub partitions: Vec<PartitionPublish>,
}

impl PublishManifest {
    pub fn partition(&self, id: PartitionId) -> Option<&PartitionPublish> {
        self.partitions.iter().find(|p| p.partition == id)
    }

    fn partition_mut(&mut self, id: PartitionId) -> Option<&mut PartitionPublish> {
        self.partitions.iter_mut().find(|p| p.partition == id)
    }

    pub fn all_visible(&self) -> bool {
        self.partitions.iter().all(|p| p.visible)
    }

    pub fn any_acked(&self) -> bool {
        self.partitions.iter().any(|p| p.acked_count() > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub db: DbId,
    pub label: String,
    pub tables: BTreeSet<TableId>,
    pub schema_versions: BTreeMap<TableId, u64>,
    pub estimated_bytes: u64,
    pub state: TxnState,
    pub created_at_ms: u64,
    pub committed_at_ms: Option<u64>,
    /// Assigned when publish starts; from then on abort is refused.
    pub publish_version: Option<u64>,
    pub visible_at_ms: Option<u64>,
    pub aborted_at_ms: Option<u64>,
    pub abort_reason: Option<String>,
    pub manifest: PublishManifest,
}

impl Transaction {
    /// Build the record described by a `TxnBegun` event.
    pub fn from_event(event: &StateEvent) -> Result<Self, StateError> {
        match event {
            StateEvent::TxnBegun {
                txn_id,
                db,
                label,
                tables,
                schema_versions,
                estimated_bytes,
                created_at_ms,
            } => Ok(Self {
                id: *txn_id,
                db: *db,
                label: label.clone(),
                tables: tables.clone(),
                schema_versions: schema_versions.clone(),
                estimated_bytes: *estimated_bytes,
                state: TxnState::Created,
                created_at_ms: *created_at_ms,
                committed_at_ms: None,
                publish_version: None,
                visible_at_ms: None,
                aborted_at_ms: None,
                abort_reason: None,
                manifest: PublishManifest::default(),
            }),
            other => Err(StateError::IllegalTransition(format!(
                "{other:?} does not create a transaction"
            ))),
        }
    }

    pub fn publish_started(&self) -> bool {
        self.publish_version.is_some()
    }

    /// Time the record reached VISIBLE or ABORTED.
    pub fn finished_at_ms(&self) -> Option<u64> {
        self.visible_at_ms.or(self.aborted_at_ms)
    }

    /// Apply a single log event to this record.
    pub fn apply(&mut self, event: &StateEvent) -> Result<(), StateError> {
        use StateEvent::*;
        use TxnState::*;

        let (id, state) = (self.id, self.state);
        match (state, event) {
            (
                Created,
                TxnCommitted {
                    manifest,
                    committed_at_ms,
                    ..
                },
            ) => {
                self.manifest = PublishManifest {
                    partitions: manifest.iter().map(PartitionPublish::from_commit).collect(),
                };
                self.committed_at_ms = Some(*committed_at_ms);
                self.state = Committed;
            }

            (Committed, PublishStarted { version, .. }) if !self.publish_started() => {
                self.publish_version = Some(*version);
            }

            (
                Committed,
                ReplicaAcked {
                    partition, replica, ..
                },
            ) if self.publish_started() => {
                let entry = self
                    .manifest
                    .partition_mut(*partition)
                    .ok_or_else(|| illegal(id, state, event))?;
                let index = entry
                    .replicas
                    .iter()
                    .position(|r| r == replica)
                    .ok_or_else(|| illegal(id, state, event))?;
                entry.acked[index] = true;
            }

            (Committed, PartitionVisible { partition, .. }) => {
                let entry = self
                    .manifest
                    .partition_mut(*partition)
                    .filter(|p| !p.visible)
                    .ok_or_else(|| illegal(id, state, event))?;
                entry.visible = true;
            }

            (Committed, TxnVisible { visible_at_ms, .. }) => {
                self.visible_at_ms = Some(*visible_at_ms);
                self.state = Visible;
            }

            (
                Created | Committed,
                TxnAborted {
                    reason,
                    forced,
                    aborted_at_ms,
                    ..
                },
            ) if !self.publish_started() || (*forced && !self.manifest.any_acked()) => {
                self.abort_reason = Some(reason.clone());
                self.aborted_at_ms = Some(*aborted_at_ms);
                self.state = Aborted;
            }

            _ => return Err(illegal(id, state, event)),
        }
        Ok(())
    }
}

fn illegal(id: TxnId, state: TxnState, event: &StateEvent) -> StateError {
    StateError::IllegalTransition(format!("cannot apply {event:?} to {id} while {state}"))
}

#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    #[error("transaction {0} not found")]
    NotFound(TxnId),

    #[error("cannot {operation} {txn} while {state}")]
    InvalidState {
        txn: TxnId,
        state: TxnState,
        operation: &'static str,
    },

    #[error("partition mismatch for {txn}: {reason}")]
    PartitionMismatch { txn: TxnId, reason: String },

    #[error("transaction {0} has started publishing and can no longer be aborted")]
    AlreadyVisible(TxnId),

    #[error("quota exceeded on {db}: requested {requested} bytes, {available} available")]
    QuotaExceeded {
        db: DbId,
        requested: u64,
        available: u64,
    },

    #[error("label `{label}` already used by {existing} with different content")]
    LabelConflict { label: String, existing: TxnId },

    #[error("database {0} does not exist")]
    UnknownDatabase(DbId),

    #[error("table {table} does not exist in {db}")]
    UnknownTable { db: DbId, table: TableId },

    #[error("schema change {job} in progress on {table}")]
    SchemaChangeInProgress { table: TableId, job: JobId },

    #[error("persistence failure: {0}")]
    Persistence(#[from] LogError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}
