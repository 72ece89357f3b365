use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{DaemonTask, TaskError, TaskId};
use crate::adapters::UsageSource;
use crate::catalog::Catalog;
use crate::invariants::InvariantEngine;
use crate::log::SharedLog;
use crate::replay;
use crate::schema::SchemaChangeCoordinator;
use crate::txn::TransactionManager;

/// Replaces each database's used bytes with a fresh measurement.
pub struct QuotaReconcileTask {
    catalog: Arc<Catalog>,
    usage: Arc<dyn UsageSource>,
    txns: Arc<TransactionManager>,
    interval: Duration,
}

impl QuotaReconcileTask {
    pub fn new(
        catalog: Arc<Catalog>,
        usage: Arc<dyn UsageSource>,
        txns: Arc<TransactionManager>,
        interval: Duration,
    ) -> Self {
        Self {
            catalog,
            usage,
            txns,
            interval,
        }
    }
}

#[async_trait]
impl DaemonTask for QuotaReconcileTask {
    fn id(&self) -> TaskId {
        TaskId::QuotaReconcile
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize, TaskError> {
        let mut reconciled = 0;
        for db in self.catalog.database_ids() {
            let Some(database) = self.catalog.database(db) else {
                tracing::warn!(%db, "database dropped during quota reconciliation, skipping");
                continue;
            };
            if database.system {
                continue;
            }
            match self.usage.used_bytes(db) {
                Ok(used) => {
                    self.txns.reconcile_quota(db, used);
                    reconciled += 1;
                }
                Err(e) => {
                    tracing::warn!(%db, error = %e, "failed to measure database usage");
                }
            }
        }
        Ok(reconciled)
    }
}

/// Resumes publish of every COMMITTED transaction whose retry is due.
pub struct PublishRetryTask {
    txns: Arc<TransactionManager>,
    interval: Duration,
}

impl PublishRetryTask {
    pub fn new(txns: Arc<TransactionManager>, interval: Duration) -> Self {
        Self { txns, interval }
    }
}

#[async_trait]
impl DaemonTask for PublishRetryTask {
    fn id(&self) -> TaskId {
        TaskId::PublishRetry
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn wakeup(&self) -> Option<Arc<Notify>> {
        Some(self.txns.publish_wakeup())
    }

    async fn run(&self) -> Result<usize, TaskError> {
        Ok(self.txns.publish_pending().await)
    }
}

/// Aborts expired transactions and retires old terminal records.
pub struct TxnCleanupTask {
    txns: Arc<TransactionManager>,
    schema: Arc<SchemaChangeCoordinator>,
    interval: Duration,
}

impl TxnCleanupTask {
    pub fn new(
        txns: Arc<TransactionManager>,
        schema: Arc<SchemaChangeCoordinator>,
        interval: Duration,
    ) -> Self {
        Self {
            txns,
            schema,
            interval,
        }
    }
}

#[async_trait]
impl DaemonTask for TxnCleanupTask {
    fn id(&self) -> TaskId {
        TaskId::TxnCleanup
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize, TaskError> {
        let aborted = self.txns.abort_expired();
        let retired = self.txns.retire_finished()?;
        let jobs = self.schema.retire_finished()?;
        Ok(aborted + retired + jobs)
    }
}

/// Steps every live schema-change job.
pub struct SchemaJobTask {
    schema: Arc<SchemaChangeCoordinator>,
    interval: Duration,
}

impl SchemaJobTask {
    pub fn new(schema: Arc<SchemaChangeCoordinator>, interval: Duration) -> Self {
        Self { schema, interval }
    }
}

#[async_trait]
impl DaemonTask for SchemaJobTask {
    fn id(&self) -> TaskId {
        TaskId::SchemaJobs
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize, TaskError> {
        Ok(self.schema.run_pending().await)
    }
}

/// Folds the log into a checkpoint once enough records accumulate.
pub struct CompactionTask {
    log: SharedLog,
    invariants: InvariantEngine,
    min_records: u64,
    interval: Duration,
}

impl CompactionTask {
    pub fn new(
        log: SharedLog,
        invariants: InvariantEngine,
        min_records: u64,
        interval: Duration,
    ) -> Self {
        Self {
            log,
            invariants,
            min_records,
            interval,
        }
    }
}

#[async_trait]
impl DaemonTask for CompactionTask {
    fn id(&self) -> TaskId {
        TaskId::LogCompaction
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize, TaskError> {
        if self.log.lock().records_since_checkpoint() < self.min_records {
            return Ok(0);
        }
        Ok(replay::compact(&self.log, &self.invariants)? as usize)
    }
}
