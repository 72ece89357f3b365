// Deterministic Replay Engine
//
// Rebuilds transactions, schema jobs, installed schemas and quota overrides
// from the latest
// checkpoint plus the records after it. Every transaction transition is
// re-checked against the invariants, so a log that could not have been
// produced by a correct manager is refused instead of silently loaded.
//
// This is the only way state is derived after a restart.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::catalog::{IndexSchema, TableSchema};
use crate::ids::{DbId, JobId, TxnId};
use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::log::{Checkpoint, LogError, LogRecord, Seq, SharedLog, StateEvent, StoredState};
use crate::schema::SchemaJob;
use crate::state::{JobState, StateError, TxnState};
use crate::txn::Transaction;

/// Errors that can occur during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("state machine error at seq {seq}: {source}")]
    State { seq: Seq, source: StateError },

    #[error("invariant violation at seq {seq}: {source}")]
    Invariant {
        seq: Seq,
        source: InvariantViolation,
    },

    #[error("log error: {0}")]
    Log(#[from] LogError),
}

/// Everything recovered from the log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveredState {
    pub last_seq: Seq,
    pub last_txn_id: u64,
    pub last_job_id: u64,
    pub last_publish_version: u64,
    pub transactions: BTreeMap<TxnId, Transaction>,
    pub jobs: BTreeMap<JobId, SchemaJob>,
    /// Quotas set administratively; they win over catalog defaults.
    pub quotas: BTreeMap<DbId, u64>,
    /// Latest schema installed on each index by a finished job.
    pub schemas: Vec<IndexSchema>,
}

impl RecoveredState {
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            last_seq: checkpoint.last_seq,
            last_txn_id: checkpoint.last_txn_id,
            last_job_id: checkpoint.last_job_id,
            last_publish_version: checkpoint.last_publish_version,
            transactions: checkpoint
                .transactions
                .into_iter()
                .map(|t| (t.id, t))
                .collect(),
            jobs: checkpoint.jobs.into_iter().map(|j| (j.id, j)).collect(),
            quotas: checkpoint.quotas,
            schemas: checkpoint.schemas,
        }
    }

    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            last_seq: self.last_seq,
            last_txn_id: self.last_txn_id,
            last_job_id: self.last_job_id,
            last_publish_version: self.last_publish_version,
            transactions: self.transactions.values().cloned().collect(),
            jobs: self.jobs.values().cloned().collect(),
            quotas: self.quotas.clone(),
            schemas: self.schemas.clone(),
        }
    }

    fn record_schema(&mut self, installed: IndexSchema) {
        match self
            .schemas
            .iter_mut()
            .find(|s| s.table == installed.table && s.rollup == installed.rollup)
        {
            Some(existing) if existing.schema.version < installed.schema.version => {
                *existing = installed;
            }
            Some(_) => {}
            None => self.schemas.push(installed),
        }
    }

    /// Transactions that were committed but never became visible.
    pub fn unpublished(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions
            .values()
            .filter(|t| t.state == TxnState::Committed)
    }

    pub fn live_jobs(&self) -> impl Iterator<Item = &SchemaJob> {
        self.jobs.values().filter(|j| !j.state.is_terminal())
    }

    /// Apply one record.
    pub fn apply(
        &mut self,
        record: &LogRecord,
        invariants: &InvariantEngine,
    ) -> Result<(), ReplayError> {
        let seq = record.seq;
        if seq <= self.last_seq {
            return Err(LogError::VersionConflict {
                expected: self.last_seq + 1,
                actual: seq,
            }
            .into());
        }
        let state_err = |source: StateError| ReplayError::State { seq, source };
        let unknown = |what: String| state_err(StateError::IllegalTransition(what));

        match &record.event {
            event @ StateEvent::TxnBegun { txn_id, .. } => {
                if self.transactions.contains_key(txn_id) {
                    return Err(unknown(format!("{txn_id} begun twice")));
                }
                let txn = Transaction::from_event(event).map_err(state_err)?;
                self.last_txn_id = self.last_txn_id.max(txn_id.0);
                self.transactions.insert(*txn_id, txn);
            }

            StateEvent::TxnRetired { txn_id } => {
                match self.transactions.get(txn_id) {
                    Some(txn) if txn.state.is_terminal() => {}
                    _ => return Err(unknown(format!("cannot retire {txn_id}"))),
                }
                self.transactions.remove(txn_id);
            }

            event @ (StateEvent::TxnCommitted { txn_id, .. }
            | StateEvent::PublishStarted { txn_id, .. }
            | StateEvent::ReplicaAcked { txn_id, .. }
            | StateEvent::PartitionVisible { txn_id, .. }
            | StateEvent::TxnVisible { txn_id, .. }
            | StateEvent::TxnAborted { txn_id, .. }) => {
                let current = self
                    .transactions
                    .get_mut(txn_id)
                    .ok_or_else(|| unknown(format!("{txn_id} does not exist")))?;
                let mut next = current.clone();
                next.apply(event).map_err(state_err)?;
                invariants
                    .evaluate(current, event, &next)
                    .map_err(|source| ReplayError::Invariant { seq, source })?;
                if let StateEvent::PublishStarted { version, .. } = event {
                    self.last_publish_version = self.last_publish_version.max(*version);
                }
                *current = next;
            }

            StateEvent::JobSubmitted { job } => {
                if self.jobs.contains_key(&job.id) {
                    return Err(unknown(format!("{} submitted twice", job.id)));
                }
                self.last_job_id = self.last_job_id.max(job.id.0);
                self.jobs.insert(job.id, job.clone());
            }

            StateEvent::JobRetired { job_id } => {
                match self.jobs.get(job_id) {
                    Some(job) if job.state.is_terminal() => {}
                    _ => return Err(unknown(format!("cannot retire {job_id}"))),
                }
                self.jobs.remove(job_id);
            }

            event @ (StateEvent::JobFenced { job_id, .. }
            | StateEvent::JobRunning { job_id, .. }
            | StateEvent::JobReplicaApplied { job_id, .. }
            | StateEvent::JobFinished { job_id, .. }
            | StateEvent::JobCancelled { job_id, .. }) => {
                let job = self
                    .jobs
                    .get_mut(job_id)
                    .ok_or_else(|| unknown(format!("{job_id} does not exist")))?;
                job.apply(event).map_err(state_err)?;
                if let StateEvent::JobFinished { schema_version, .. } = event {
                    let installed = IndexSchema {
                        table: job.table,
                        rollup: job.rollup.clone(),
                        schema: TableSchema {
                            version: *schema_version,
                            columns: job.target_columns.clone(),
                        },
                    };
                    self.record_schema(installed);
                }
            }

            StateEvent::QuotaAdjusted { db, quota_bytes } => {
                self.quotas.insert(*db, *quota_bytes);
            }
        }

        self.last_seq = seq;
        Ok(())
    }
}

/// Rebuild state from a checkpoint and the records after it.
pub fn replay_state(
    stored: StoredState,
    invariants: &InvariantEngine,
) -> Result<RecoveredState, ReplayError> {
    let mut state = stored
        .checkpoint
        .map(RecoveredState::from_checkpoint)
        .unwrap_or_default();
    for record in &stored.records {
        state.apply(record, invariants)?;
    }

    let by_state = |s: TxnState| state.transactions.values().filter(|t| t.state == s).count();
    tracing::debug!(
        last_seq = state.last_seq,
        created = by_state(TxnState::Created),
        committed = by_state(TxnState::Committed),
        jobs_running = state.jobs.values().filter(|j| j.state == JobState::Running).count(),
        "replayed state log"
    );
    Ok(state)
}

/// Fold every record into a new checkpoint. Returns how many records the
/// checkpoint absorbed.
///
/// Runs under the log lock, so no transition can slip in between reading
/// the records and installing the checkpoint.
pub fn compact(log: &SharedLog, invariants: &InvariantEngine) -> Result<u64, ReplayError> {
    let mut log = log.lock();
    let absorbed = log.records_since_checkpoint();
    if absorbed == 0 {
        return Ok(0);
    }
    let state = replay_state(log.load()?, invariants)?;
    log.install_checkpoint(&state.to_checkpoint())?;
    tracing::info!(
        last_seq = state.last_seq,
        absorbed,
        transactions = state.transactions.len(),
        jobs = state.jobs.len(),
        "state log compacted"
    );
    Ok(absorbed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuorumPolicy;
    use crate::ids::{PartitionId, ReplicaId, TableId};
    use crate::log::{InMemoryLogStore, StateLog};
    use crate::txn::PartitionCommit;

    fn engine() -> InvariantEngine {
        InvariantEngine::with_defaults(QuorumPolicy::All)
    }

    fn begun(id: u64) -> StateEvent {
        StateEvent::TxnBegun {
            txn_id: TxnId(id),
            db: DbId(1),
            label: format!("l{id}"),
            tables: [TableId(10)].into(),
            schema_versions: Default::default(),
            estimated_bytes: 5,
            created_at_ms: 0,
        }
    }

    fn committed(id: u64) -> StateEvent {
        StateEvent::TxnCommitted {
            txn_id: TxnId(id),
            manifest: vec![PartitionCommit {
                table: TableId(10),
                partition: PartitionId(100),
                replicas: [ReplicaId(1)].into(),
            }],
            committed_at_ms: 1,
        }
    }

    fn stored(events: Vec<StateEvent>) -> StoredState {
        StoredState {
            checkpoint: None,
            records: events
                .into_iter()
                .enumerate()
                .map(|(i, event)| LogRecord {
                    seq: i as u64 + 1,
                    event,
                })
                .collect(),
        }
    }

    #[test]
    fn replay_rebuilds_transactions_and_counters() {
        let state = replay_state(
            stored(vec![
                begun(1),
                begun(2),
                committed(1),
                StateEvent::PublishStarted {
                    txn_id: TxnId(1),
                    version: 7,
                },
                StateEvent::QuotaAdjusted {
                    db: DbId(1),
                    quota_bytes: 500,
                },
            ]),
            &engine(),
        )
        .unwrap();

        assert_eq!(state.last_seq, 5);
        assert_eq!(state.last_txn_id, 2);
        assert_eq!(state.last_publish_version, 7);
        assert_eq!(state.quotas[&DbId(1)], 500);
        assert_eq!(state.unpublished().count(), 1);
        assert_eq!(state.transactions[&TxnId(2)].state, TxnState::Created);
    }

    #[test]
    fn replay_fails_on_invalid_transition() {
        let err = replay_state(stored(vec![committed(1)]), &engine()).unwrap_err();
        assert!(matches!(err, ReplayError::State { seq: 1, .. }));
    }

    #[test]
    fn replay_enforces_invariants() {
        let err = replay_state(
            stored(vec![
                begun(1),
                committed(1),
                StateEvent::PartitionVisible {
                    txn_id: TxnId(1),
                    partition: PartitionId(100),
                },
            ]),
            &engine(),
        )
        .unwrap_err();
        assert!(matches!(err, ReplayError::Invariant { seq: 3, .. }));
    }

    #[test]
    fn retired_transactions_are_dropped() {
        let state = replay_state(
            stored(vec![
                begun(1),
                StateEvent::TxnAborted {
                    txn_id: TxnId(1),
                    reason: "x".into(),
                    forced: false,
                    aborted_at_ms: 3,
                },
                StateEvent::TxnRetired { txn_id: TxnId(1) },
            ]),
            &engine(),
        )
        .unwrap();
        assert!(state.transactions.is_empty());
        assert_eq!(state.last_txn_id, 1);
    }

    #[test]
    fn compaction_preserves_recovered_state() {
        let store = InMemoryLogStore::default();
        let log = StateLog::open(Box::new(store.clone())).unwrap().shared();
        for event in [begun(1), committed(1), begun(2)] {
            log.lock().append(event).unwrap();
        }
        let before = replay_state(log.lock().load().unwrap(), &engine()).unwrap();

        assert_eq!(compact(&log, &engine()).unwrap(), 3);
        assert_eq!(compact(&log, &engine()).unwrap(), 0);
        log.lock().append(begun(3)).unwrap();

        let reopened = StateLog::open(Box::new(store)).unwrap();
        let stored = reopened.load().unwrap();
        assert_eq!(stored.records.len(), 1);
        let after = replay_state(stored, &engine()).unwrap();
        assert_eq!(after.transactions.len(), 3);
        assert_eq!(
            after.transactions[&TxnId(1)],
            before.transactions[&TxnId(1)]
        );
    }

    #[test]
    fn finished_schema_outlives_its_job() {
        use crate::catalog::Column;
        use crate::schema::ColumnMutation;

        let columns = vec![Column::key("id", "BIGINT"), Column::value("note", "INT")];
        let job = SchemaJob {
            id: JobId(1),
            db: DbId(1),
            table: TableId(10),
            rollup: None,
            mutations: vec![ColumnMutation::add(Column::value("note", "INT"))],
            target_columns: columns.clone(),
            base_version: 1,
            properties: Default::default(),
            state: JobState::Pending,
            fence: None,
            replicas: [ReplicaId(1)].into(),
            applied: Default::default(),
            created_at_ms: 0,
            started_at_ms: None,
            finished_at_ms: None,
            cancelled_at_ms: None,
            schema_version: None,
            cancel_reason: None,
        };
        let state = replay_state(
            stored(vec![
                StateEvent::JobSubmitted { job },
                StateEvent::JobFenced {
                    job_id: JobId(1),
                    fence: TxnId(0),
                    target_columns: columns.clone(),
                    base_version: 1,
                },
                StateEvent::JobRunning {
                    job_id: JobId(1),
                    started_at_ms: 1,
                },
                StateEvent::JobReplicaApplied {
                    job_id: JobId(1),
                    replica: ReplicaId(1),
                },
                StateEvent::JobFinished {
                    job_id: JobId(1),
                    schema_version: 2,
                    finished_at_ms: 2,
                },
                StateEvent::JobRetired { job_id: JobId(1) },
            ]),
            &engine(),
        )
        .unwrap();

        assert!(state.jobs.is_empty());
        assert_eq!(
            state.schemas,
            vec![IndexSchema {
                table: TableId(10),
                rollup: None,
                schema: TableSchema {
                    version: 2,
                    columns,
                },
            }]
        );
        let restored = RecoveredState::from_checkpoint(state.to_checkpoint());
        assert_eq!(restored.schemas, state.schemas);
    }
}
