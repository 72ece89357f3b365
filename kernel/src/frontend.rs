// Frontend
//
// Wiring for an embedding process: open the state log, replay it, build
// every service with its collaborators injected, and hand back one object
// exposing the load, DDL and management calls.

use std::sync::Arc;
use std::time::Duration;

use crate::adapters::{ReplicaClient, UsageSource};
use crate::catalog::{Catalog, CatalogError};
use crate::clock::TimeSource;
use crate::config::{ConfigError, KernelConfig};
use crate::daemon::{
    CompactionTask, DaemonHandle, DaemonScheduler, Leadership, PublishRetryTask,
    QuotaReconcileTask, SchemaJobTask, TxnCleanupTask,
};
use crate::ids::{DbId, JobId, TableId, TxnId};
use crate::invariants::InvariantEngine;
use crate::log::{LogError, SharedLog, StateEvent, StateLog, StateLogStore};
use crate::quota::{QuotaLedger, QuotaSnapshot};
use crate::replay::{self, replay_state, ReplayError};
use crate::schema::{SchemaChangeCoordinator, SchemaChangeIntent, SchemaError};
use crate::state::TxnState;
use crate::txn::{PartitionCommit, TransactionManager, TxnError};

#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("state log: {0}")]
    Log(#[from] LogError),

    #[error("recovery failed: {0}")]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// External collaborators.
pub struct FrontendParts {
    pub catalog: Arc<Catalog>,
    pub replicas: Arc<dyn ReplicaClient>,
    pub usage: Arc<dyn UsageSource>,
    pub leadership: Arc<dyn Leadership>,
    pub time: Arc<dyn TimeSource>,
}

pub struct Frontend {
    config: Arc<KernelConfig>,
    catalog: Arc<Catalog>,
    quota: Arc<QuotaLedger>,
    log: SharedLog,
    txns: Arc<TransactionManager>,
    schema: Arc<SchemaChangeCoordinator>,
    scheduler: Arc<DaemonScheduler>,
}

impl std::fmt::Debug for Frontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frontend")
            .field("txns", &self.txns)
            .field("schema", &self.schema)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Frontend {
    /// Recover from `store` and assemble the services. Committed
    /// transactions resume publish and fenced jobs resume waiting as soon
    /// as the daemons run.
    pub fn open(
        config: KernelConfig,
        store: Box<dyn StateLogStore>,
        parts: FrontendParts,
    ) -> Result<Self, FrontendError> {
        config.validate()?;
        let config = Arc::new(config);
        let FrontendParts {
            catalog,
            replicas,
            usage,
            leadership,
            time,
        } = parts;

        let log = StateLog::open(store)?;
        let recovered = replay_state(
            log.load()?,
            &InvariantEngine::with_defaults(config.publish_quorum),
        )?;
        let log = log.shared();

        let quota = Arc::new(QuotaLedger::new(config.default_db_quota_bytes));
        for db in catalog.database_ids() {
            let Some(database) = catalog.database(db) else {
                continue;
            };
            let limit = match recovered.quotas.get(&db) {
                Some(bytes) => {
                    catalog.set_quota(db, *bytes)?;
                    *bytes
                }
                None => database.quota_bytes,
            };
            quota.register(db, limit);
        }

        for installed in &recovered.schemas {
            match catalog.install_schema(installed) {
                Ok(true) => tracing::info!(
                    table = %installed.table,
                    rollup = ?installed.rollup,
                    version = installed.schema.version,
                    "restored table schema"
                ),
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    table = %installed.table,
                    error = %e,
                    "recovered schema has no index to install on"
                ),
            }
        }

        let txns = Arc::new(TransactionManager::new(
            Arc::clone(&config),
            Arc::clone(&catalog),
            Arc::clone(&quota),
            log.clone(),
            Arc::clone(&replicas),
            Arc::clone(&time),
        ));
        let schema = Arc::new(SchemaChangeCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&catalog),
            Arc::clone(&txns),
            log.clone(),
            replicas,
            time,
        ));

        let last_seq = recovered.last_seq;
        txns.restore(
            recovered.transactions.into_values(),
            recovered.last_txn_id,
            recovered.last_publish_version,
        );
        schema.restore(recovered.jobs.into_values(), recovered.last_job_id);

        let mut scheduler = DaemonScheduler::new(leadership);
        scheduler.register(QuotaReconcileTask::new(
            Arc::clone(&catalog),
            usage,
            Arc::clone(&txns),
            Duration::from_secs(config.quota_reconcile_interval_secs),
        ));
        scheduler.register(PublishRetryTask::new(
            Arc::clone(&txns),
            Duration::from_millis(config.publish_retry_interval_ms),
        ));
        scheduler.register(TxnCleanupTask::new(
            Arc::clone(&txns),
            Arc::clone(&schema),
            Duration::from_secs(config.txn_cleanup_interval_secs),
        ));
        scheduler.register(SchemaJobTask::new(
            Arc::clone(&schema),
            Duration::from_millis(config.schema_job_interval_ms),
        ));
        scheduler.register(CompactionTask::new(
            log.clone(),
            InvariantEngine::with_defaults(config.publish_quorum),
            config.compaction_min_records,
            Duration::from_secs(config.compaction_interval_secs),
        ));

        tracing::info!(
            last_seq,
            last_txn_id = %txns.last_txn_id(),
            pending_publish = txns.pending_publish().len(),
            "frontend recovered"
        );
        Ok(Self {
            config,
            catalog,
            quota,
            log,
            txns,
            schema,
            scheduler: Arc::new(scheduler),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    pub fn schema_changes(&self) -> &Arc<SchemaChangeCoordinator> {
        &self.schema
    }

    pub fn scheduler(&self) -> &Arc<DaemonScheduler> {
        &self.scheduler
    }

    /// Start the daemon loops. They stop when the handle is shut down or
    /// dropped.
    pub fn start(&self) -> DaemonHandle {
        Arc::clone(&self.scheduler).spawn()
    }

    pub fn begin(
        &self,
        db: DbId,
        label: Option<&str>,
        tables: impl IntoIterator<Item = TableId>,
        estimated_bytes: u64,
    ) -> Result<TxnId, TxnError> {
        self.txns.begin(db, label, tables, estimated_bytes)
    }

    pub fn commit(&self, txn: TxnId, manifest: Vec<PartitionCommit>) -> Result<(), TxnError> {
        self.txns.commit(txn, manifest)
    }

    pub fn abort(&self, txn: TxnId, reason: &str) -> Result<(), TxnError> {
        self.txns.abort(txn, reason)
    }

    pub fn get_state(&self, txn: TxnId) -> Result<TxnState, TxnError> {
        self.txns.get_state(txn)
    }

    pub fn cancel_publish(&self, txn: TxnId, reason: &str) -> Result<(), TxnError> {
        self.txns.cancel_publish(txn, reason)
    }

    pub fn submit_schema_change(&self, intent: SchemaChangeIntent) -> Result<JobId, SchemaError> {
        self.schema.submit(intent)
    }

    pub fn cancel_schema_change(&self, job: JobId, reason: &str) -> Result<(), SchemaError> {
        self.schema.cancel(job, reason)
    }

    pub fn quota(&self, db: DbId) -> Option<QuotaSnapshot> {
        self.quota.snapshot(db)
    }

    /// Change a database's hard limit. Persisted, so it survives restart.
    pub fn set_quota(&self, db: DbId, quota_bytes: u64) -> Result<(), FrontendError> {
        if self.catalog.database(db).is_none() {
            return Err(CatalogError::UnknownDatabase(db).into());
        }
        self.log
            .lock()
            .append(StateEvent::QuotaAdjusted { db, quota_bytes })?;
        self.catalog.set_quota(db, quota_bytes)?;
        self.quota.set_quota(db, quota_bytes);
        Ok(())
    }

    /// Fold the log into a checkpoint now.
    pub fn compact(&self) -> Result<u64, ReplayError> {
        replay::compact(
            &self.log,
            &InvariantEngine::with_defaults(self.config.publish_quorum),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryReplicas, InMemoryUsage};
    use crate::catalog::{Column, Database, Table};
    use crate::clock::ManualTime;
    use crate::daemon::{LeaderFlag, RunOutcome, TaskId};
    use crate::ids::{PartitionId, ReplicaId};
    use crate::log::{FileLogStore, InMemoryLogStore};
    use crate::schema::ColumnMutation;
    use crate::state::JobState;
    use crate::txn::PublishProgress;

    const DB: DbId = DbId(1);
    const ORDERS: TableId = TableId(10);
    const P1: PartitionId = PartitionId(100);
    const P2: PartitionId = PartitionId(200);

    struct Cluster {
        catalog: Arc<Catalog>,
        replicas: Arc<InMemoryReplicas>,
        usage: Arc<InMemoryUsage>,
        leader: Arc<LeaderFlag>,
        time: Arc<ManualTime>,
    }

    impl Cluster {
        fn new() -> Self {
            let catalog = Arc::new(Catalog::new());
            catalog.add_database(Database::new(DB, "sales", 1_000));
            catalog
                .add_table(
                    Table::new(ORDERS, DB, "orders", vec![Column::key("id", "BIGINT")])
                        .with_partition(P1, [ReplicaId(1), ReplicaId(2)])
                        .with_partition(P2, [ReplicaId(2), ReplicaId(3)]),
                )
                .unwrap();
            Self {
                catalog,
                replicas: Arc::new(InMemoryReplicas::new()),
                usage: Arc::new(InMemoryUsage::new()),
                leader: Arc::new(LeaderFlag::new(true)),
                time: Arc::new(ManualTime::new(1_000)),
            }
        }

        fn parts(&self) -> FrontendParts {
            FrontendParts {
                catalog: self.catalog.clone(),
                replicas: self.replicas.clone(),
                usage: self.usage.clone(),
                leadership: self.leader.clone(),
                time: self.time.clone(),
            }
        }

        fn open(&self, store: &InMemoryLogStore) -> Frontend {
            Frontend::open(KernelConfig::default(), Box::new(store.clone()), self.parts()).unwrap()
        }
    }

    fn manifest() -> Vec<PartitionCommit> {
        vec![
            PartitionCommit {
                table: ORDERS,
                partition: P1,
                replicas: [ReplicaId(1), ReplicaId(2)].into(),
            },
            PartitionCommit {
                table: ORDERS,
                partition: P2,
                replicas: [ReplicaId(2), ReplicaId(3)].into(),
            },
        ]
    }

    #[test]
    fn quota_admission_scenario() {
        let cluster = Cluster::new();
        let frontend = cluster.open(&InMemoryLogStore::default());

        let a = frontend.begin(DB, Some("A"), [ORDERS], 600).unwrap();
        assert!(matches!(
            frontend.begin(DB, Some("B"), [ORDERS], 500),
            Err(TxnError::QuotaExceeded { .. })
        ));
        frontend.abort(a, "client cancelled").unwrap();
        frontend.begin(DB, Some("B"), [ORDERS], 500).unwrap();
        assert_eq!(frontend.quota(DB).unwrap().pending_bytes, 500);
    }

    #[tokio::test]
    async fn publish_resumes_after_restart_without_duplicate_application() {
        let cluster = Cluster::new();
        let store = InMemoryLogStore::default();
        let txn = {
            let frontend = cluster.open(&store);
            let txn = frontend.begin(DB, Some("load"), [ORDERS], 100).unwrap();
            frontend.commit(txn, manifest()).unwrap();

            cluster.replicas.set_down(ReplicaId(3), true);
            assert_eq!(
                frontend.transactions().publish_once(txn).await.unwrap(),
                PublishProgress::Pending { remaining: 1 }
            );
            assert_eq!(frontend.get_state(txn).unwrap(), TxnState::Committed);
            txn
        };

        // Restart with the same durable log.
        cluster.replicas.set_down(ReplicaId(3), false);
        let frontend = cluster.open(&store);
        assert_eq!(frontend.get_state(txn).unwrap(), TxnState::Committed);
        assert_eq!(frontend.quota(DB).unwrap().pending_bytes, 100);
        assert_eq!(frontend.transactions().pending_publish(), vec![txn]);
        assert!(matches!(
            frontend.abort(txn, "too late"),
            Err(TxnError::AlreadyVisible(_))
        ));

        assert_eq!(
            frontend.scheduler().run_if_leader(TaskId::PublishRetry).await.unwrap(),
            RunOutcome::Ran(1)
        );
        assert_eq!(frontend.get_state(txn).unwrap(), TxnState::Visible);
        assert_eq!(frontend.quota(DB).unwrap().pending_bytes, 0);

        assert_eq!(cluster.replicas.publish_count(P1, ReplicaId(1)), 1);
        assert_eq!(cluster.replicas.publish_count(P1, ReplicaId(2)), 1);
        assert_eq!(cluster.replicas.publish_count(P2, ReplicaId(2)), 1);
        assert_eq!(cluster.replicas.publish_count(P2, ReplicaId(3)), 1);
    }

    #[tokio::test]
    async fn label_survives_restart() {
        let cluster = Cluster::new();
        let store = InMemoryLogStore::default();
        let txn = cluster
            .open(&store)
            .begin(DB, Some("nightly"), [ORDERS], 10)
            .unwrap();

        let frontend = cluster.open(&store);
        assert_eq!(frontend.begin(DB, Some("nightly"), [ORDERS], 10).unwrap(), txn);
        assert!(matches!(
            frontend.begin(DB, Some("nightly"), [ORDERS], 20),
            Err(TxnError::LabelConflict { .. })
        ));
        let next = frontend.begin(DB, None, [ORDERS], 10).unwrap();
        assert!(next > txn);
    }

    #[tokio::test]
    async fn fence_is_restored_after_restart() {
        let cluster = Cluster::new();
        let store = InMemoryLogStore::default();
        let (writer, job) = {
            let frontend = cluster.open(&store);
            let writer = frontend.begin(DB, Some("w"), [ORDERS], 10).unwrap();
            let job = frontend
                .submit_schema_change(SchemaChangeIntent::new(
                    ORDERS,
                    vec![ColumnMutation::add(Column::value("note", "VARCHAR(16)"))],
                ))
                .unwrap();
            (writer, job)
        };

        let frontend = cluster.open(&store);
        assert!(matches!(
            frontend.begin(DB, None, [ORDERS], 1),
            Err(TxnError::SchemaChangeInProgress { .. })
        ));

        frontend
            .scheduler()
            .run_if_leader(TaskId::SchemaJobs)
            .await
            .unwrap();
        let job_state = |f: &Frontend| f.schema_changes().job(job).unwrap().state;
        assert_eq!(job_state(&frontend), JobState::WaitingFence);

        frontend.abort(writer, "make way").unwrap();
        frontend
            .scheduler()
            .run_if_leader(TaskId::SchemaJobs)
            .await
            .unwrap();
        assert_eq!(job_state(&frontend), JobState::Finished);
        assert_eq!(cluster.catalog.table(ORDERS).unwrap().base.version, 2);

        let after = frontend.begin(DB, None, [ORDERS], 1).unwrap();
        assert_eq!(
            frontend.transactions().transaction(after).unwrap().schema_versions[&ORDERS],
            2
        );
    }

    #[tokio::test]
    async fn finished_schema_survives_retirement_and_compaction() {
        let store = InMemoryLogStore::default();
        {
            let cluster = Cluster::new();
            let frontend = cluster.open(&store);
            let job = frontend
                .submit_schema_change(SchemaChangeIntent::new(
                    ORDERS,
                    vec![ColumnMutation::add(Column::value("note", "VARCHAR(16)"))],
                ))
                .unwrap();
            assert_eq!(
                frontend.schema_changes().run_to_completion(job).await.unwrap(),
                JobState::Finished
            );
            cluster.time.advance(frontend.config().terminal_retention());
            assert_eq!(frontend.schema_changes().retire_finished().unwrap(), 1);
        }

        let assert_note = |cluster: &Cluster| {
            let table = cluster.catalog.table(ORDERS).unwrap();
            assert_eq!(table.base.version, 2);
            assert!(table.base.column("note").is_some());
        };

        let cluster = Cluster::new();
        let frontend = cluster.open(&store);
        assert!(frontend.schema_changes().jobs().is_empty());
        assert_note(&cluster);
        assert!(frontend.compact().unwrap() > 0);
        drop(frontend);

        let cluster = Cluster::new();
        let frontend = cluster.open(&store);
        assert_note(&cluster);
        let txn = frontend.begin(DB, None, [ORDERS], 1).unwrap();
        assert_eq!(
            frontend.transactions().transaction(txn).unwrap().schema_versions[&ORDERS],
            2
        );
    }

    #[test]
    fn quota_override_survives_restart_and_compaction() {
        let cluster = Cluster::new();
        let store = InMemoryLogStore::default();
        {
            let frontend = cluster.open(&store);
            frontend.set_quota(DB, 5_000).unwrap();
            frontend.begin(DB, Some("x"), [ORDERS], 10).unwrap();
            assert_eq!(frontend.compact().unwrap(), 2);
            assert!(matches!(
                frontend.set_quota(DbId(99), 1),
                Err(FrontendError::Catalog(_))
            ));
        }

        let fresh = Cluster::new();
        let frontend = fresh.open(&store);
        assert_eq!(frontend.quota(DB).unwrap().quota_bytes, 5_000);
        assert_eq!(frontend.quota(DB).unwrap().pending_bytes, 10);
    }

    #[test]
    fn persistence_failure_is_surfaced() {
        let cluster = Cluster::new();
        let store = InMemoryLogStore::default();
        let frontend = cluster.open(&store);
        store.fail_appends(true);

        assert!(matches!(
            frontend.begin(DB, Some("x"), [ORDERS], 10),
            Err(TxnError::Persistence(_))
        ));
        assert!(matches!(
            frontend.set_quota(DB, 10),
            Err(FrontendError::Log(_))
        ));
        assert_eq!(frontend.quota(DB).unwrap().quota_bytes, 1_000);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cluster = Cluster::new();
        let config = KernelConfig {
            txn_timeout_secs: 0,
            ..KernelConfig::default()
        };
        let err = Frontend::open(config, Box::new(InMemoryLogStore::default()), cluster.parts())
            .unwrap_err();
        assert!(matches!(err, FrontendError::Config(_)));
    }

    #[tokio::test]
    async fn file_backed_log_recovers_visible_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::new();
        let open = || {
            Frontend::open(
                KernelConfig::default(),
                Box::new(FileLogStore::open(dir.path()).unwrap()),
                cluster.parts(),
            )
            .unwrap()
        };

        let txn = {
            let frontend = open();
            let txn = frontend.begin(DB, Some("file"), [ORDERS], 10).unwrap();
            frontend.commit(txn, manifest()).unwrap();
            frontend.transactions().publish(txn).await.unwrap();
            txn
        };

        let frontend = open();
        assert_eq!(frontend.get_state(txn).unwrap(), TxnState::Visible);
        assert!(frontend.transactions().pending_publish().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn daemons_publish_committed_transactions() {
        let cluster = Cluster::new();
        let frontend = cluster.open(&InMemoryLogStore::default());
        let handle = frontend.start();

        let txn = frontend.begin(DB, None, [ORDERS], 10).unwrap();
        frontend.commit(txn, manifest()).unwrap();
        for _ in 0..50 {
            if frontend.get_state(txn).unwrap() == TxnState::Visible {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(frontend.get_state(txn).unwrap(), TxnState::Visible);

        cluster.leader.set(false);
        handle.shutdown().await;
    }
}
