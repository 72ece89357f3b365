// Durable State Log
//
// Append-only record of every transaction, schema-job and quota transition.
// A record is appended before the transition is applied in memory or
// acknowledged to a caller; on restart the log (plus the latest checkpoint)
// is replayed to rebuild every non-terminal record.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::catalog::{Column, IndexSchema};
use crate::ids::{DbId, JobId, PartitionId, ReplicaId, TableId, TxnId};
use crate::schema::job::SchemaJob;
use crate::txn::{PartitionCommit, Transaction};

pub mod file;
pub mod store;

pub use file::FileLogStore;
pub use store::{InMemoryLogStore, StateLogStore, StoredState};

/// Position of a record in the log. The first record is 1.
pub type Seq = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    TxnBegun {
        txn_id: TxnId,
        db: DbId,
        label: String,
        tables: BTreeSet<TableId>,
        /// Schema version of each table the load was admitted against.
        schema_versions: BTreeMap<TableId, u64>,
        estimated_bytes: u64,
        created_at_ms: u64,
    },
    TxnCommitted {
        txn_id: TxnId,
        manifest: Vec<PartitionCommit>,
        committed_at_ms: u64,
    },
    PublishStarted {
        txn_id: TxnId,
        version: u64,
    },
    ReplicaAcked {
        txn_id: TxnId,
        partition: PartitionId,
        replica: ReplicaId,
    },
    PartitionVisible {
        txn_id: TxnId,
        partition: PartitionId,
    },
    TxnVisible {
        txn_id: TxnId,
        visible_at_ms: u64,
    },
    TxnAborted {
        txn_id: TxnId,
        reason: String,
        /// Administrative cancel of a stuck publish.
        #[serde(default)]
        forced: bool,
        aborted_at_ms: u64,
    },
    TxnRetired {
        txn_id: TxnId,
    },
    JobSubmitted {
        job: SchemaJob,
    },
    /// The plan is redone once the fence is held, so it reflects every
    /// schema change that finished before it.
    JobFenced {
        job_id: JobId,
        fence: TxnId,
        target_columns: Vec<Column>,
        base_version: u64,
    },
    JobRunning {
        job_id: JobId,
        started_at_ms: u64,
    },
    JobReplicaApplied {
        job_id: JobId,
        replica: ReplicaId,
    },
    JobFinished {
        job_id: JobId,
        schema_version: u64,
        finished_at_ms: u64,
    },
    JobCancelled {
        job_id: JobId,
        reason: String,
        cancelled_at_ms: u64,
    },
    JobRetired {
        job_id: JobId,
    },
    QuotaAdjusted {
        db: DbId,
        quota_bytes: u64,
    },
}

impl StateEvent {
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            Self::TxnBegun { txn_id, .. }
            | Self::TxnCommitted { txn_id, .. }
            | Self::PublishStarted { txn_id, .. }
            | Self::ReplicaAcked { txn_id, .. }
            | Self::PartitionVisible { txn_id, .. }
            | Self::TxnVisible { txn_id, .. }
            | Self::TxnAborted { txn_id, .. }
            | Self::TxnRetired { txn_id } => Some(*txn_id),
            _ => None,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobSubmitted { job } => Some(job.id),
            Self::JobFenced { job_id, .. }
            | Self::JobRunning { job_id, .. }
            | Self::JobReplicaApplied { job_id, .. }
            | Self::JobFinished { job_id, .. }
            | Self::JobCancelled { job_id, .. }
            | Self::JobRetired { job_id } => Some(*job_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: Seq,
    pub event: StateEvent,
}

/// Compaction snapshot: the full live state as of `last_seq`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_seq: Seq,
    pub last_txn_id: u64,
    pub last_job_id: u64,
    pub last_publish_version: u64,
    pub transactions: Vec<Transaction>,
    pub jobs: Vec<SchemaJob>,
    pub quotas: BTreeMap<DbId, u64>,
    /// Schemas installed by finished jobs, including retired ones.
    #[serde(default)]
    pub schemas: Vec<IndexSchema>,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("sequence conflict: expected {expected}, got {actual}")]
    VersionConflict { expected: Seq, actual: Seq },

    #[error("log io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("corrupt log frame at offset {offset}")]
    Corrupt { offset: u64 },

    #[error("log store unavailable: {0}")]
    Unavailable(String),
}

/// Sequenced front of a [`StateLogStore`].
#[derive(Debug)]
pub struct StateLog {
    store: Box<dyn StateLogStore>,
    last_seq: Seq,
    checkpoint_seq: Seq,
}

/// The log is the single serialization point for persistence; every
/// component holds the same handle.
pub type SharedLog = Arc<Mutex<StateLog>>;

impl StateLog {
    /// Open a store, positioning the sequence after its last record.
    pub fn open(store: Box<dyn StateLogStore>) -> Result<Self, LogError> {
        let stored = store.load()?;
        let checkpoint_seq = stored.checkpoint.as_ref().map(|c| c.last_seq).unwrap_or(0);
        let last_seq = stored
            .records
            .last()
            .map(|r| r.seq)
            .unwrap_or(checkpoint_seq);
        Ok(Self {
            store,
            last_seq,
            checkpoint_seq,
        })
    }

    pub fn shared(self) -> SharedLog {
        Arc::new(Mutex::new(self))
    }

    /// Persist one event. Nothing may be applied if this fails.
    pub fn append(&mut self, event: StateEvent) -> Result<Seq, LogError> {
        let record = LogRecord {
            seq: self.last_seq + 1,
            event,
        };
        self.store.append(&record)?;
        self.last_seq = record.seq;
        Ok(record.seq)
    }

    pub fn load(&self) -> Result<StoredState, LogError> {
        self.store.load()
    }

    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    pub fn records_since_checkpoint(&self) -> u64 {
        self.last_seq - self.checkpoint_seq
    }

    /// Install a checkpoint and drop every record it covers.
    pub fn install_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), LogError> {
        if checkpoint.last_seq > self.last_seq {
            return Err(LogError::VersionConflict {
                expected: self.last_seq,
                actual: checkpoint.last_seq,
            });
        }
        self.store.install_checkpoint(checkpoint)?;
        self.checkpoint_seq = checkpoint.last_seq;
        Ok(())
    }
}
