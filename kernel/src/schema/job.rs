use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{ColumnMutation, SchemaMutation};
use crate::catalog::Column;
use crate::ids::{DbId, JobId, ReplicaId, TableId, TxnId};
use crate::log::StateEvent;
use crate::state::{JobState, StateError};

/// A schema-change job and its progress across replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaJob {
    pub id: JobId,
    pub db: DbId,
    pub table: TableId,
    pub rollup: Option<String>,
    pub mutations: Vec<ColumnMutation>,
    pub target_columns: Vec<Column>,
    /// Schema version the mutations were planned against.
    pub base_version: u64,
    pub properties: BTreeMap<String, String>,
    pub state: JobState,
    /// Highest transaction admitted on the table before the job.
    pub fence: Option<TxnId>,
    pub replicas: BTreeSet<ReplicaId>,
    pub applied: BTreeSet<ReplicaId>,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub cancelled_at_ms: Option<u64>,
    pub schema_version: Option<u64>,
    pub cancel_reason: Option<String>,
}

impl SchemaJob {
    /// The command sent to each replica.
    pub fn mutation(&self) -> SchemaMutation {
        SchemaMutation {
            rollup: self.rollup.clone(),
            mutations: self.mutations.clone(),
            target_columns: self.target_columns.clone(),
            schema_version: self.target_version(),
        }
    }

    pub fn target_version(&self) -> u64 {
        self.base_version + 1
    }

    pub fn pending_replicas(&self) -> Vec<ReplicaId> {
        self.replicas.difference(&self.applied).copied().collect()
    }

    pub fn ended_at_ms(&self) -> Option<u64> {
        self.finished_at_ms.or(self.cancelled_at_ms)
    }

    pub fn to_sql(&self) -> String {
        self.mutations
            .iter()
            .map(|m| m.to_sql(self.rollup.as_deref()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn apply(&mut self, event: &StateEvent) -> Result<(), StateError> {
        use JobState::*;
        use StateEvent::*;

        match (self.state, event) {
            (
                Pending,
                JobFenced {
                    fence,
                    target_columns,
                    base_version,
                    ..
                },
            ) => {
                self.fence = Some(*fence);
                self.target_columns = target_columns.clone();
                self.base_version = *base_version;
                self.state = WaitingFence;
            }

            (WaitingFence, JobRunning { started_at_ms, .. }) => {
                self.started_at_ms = Some(*started_at_ms);
                self.state = Running;
            }

            (Running, JobReplicaApplied { replica, .. }) if self.replicas.contains(replica) => {
                self.applied.insert(*replica);
            }

            (
                Running,
                JobFinished {
                    schema_version,
                    finished_at_ms,
                    ..
                },
            ) if self.pending_replicas().is_empty() => {
                self.schema_version = Some(*schema_version);
                self.finished_at_ms = Some(*finished_at_ms);
                self.state = Finished;
            }

            (
                Pending | WaitingFence | Running,
                JobCancelled {
                    reason,
                    cancelled_at_ms,
                    ..
                },
            ) => {
                self.cancel_reason = Some(reason.clone());
                self.cancelled_at_ms = Some(*cancelled_at_ms);
                self.state = Cancelled;
            }

            (state, event) => {
                return Err(StateError::IllegalTransition(format!(
                    "cannot apply {event:?} to {} while {state}",
                    self.id
                )))
            }
        }
        Ok(())
    }
}
