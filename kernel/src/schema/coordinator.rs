// Schema-Change Coordinator
//
// Runs a job through PENDING → WAITING_FENCE → RUNNING → FINISHED. The fence
// is the highest transaction admitted on the table at submit time; the job
// only starts mutating replicas once every transaction up to the fence has
// finished, and no new transaction is admitted on the table meanwhile.
//
// The column plan is made while the fence is held, so no other job can
// swap the index underneath it. Replica acknowledgements are persisted one
// by one. The catalog schema is swapped only after FINISHED is durable, so
// a cancelled job leaves the table exactly as it was.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};

use super::{plan_columns, ColumnMutation, SchemaChangeIntent, SchemaError, SchemaJob};
use crate::adapters::{ReplicaClient, ReplicaError};
use crate::catalog::{Catalog, Column};
use crate::clock::{InFlight, LogicalClock, TimeSource};
use crate::config::KernelConfig;
use crate::ids::{JobId, ReplicaId, TableId};
use crate::log::{SharedLog, StateEvent};
use crate::state::JobState;
use crate::txn::{TransactionManager, TxnError};

pub struct SchemaChangeCoordinator {
    config: Arc<KernelConfig>,
    catalog: Arc<Catalog>,
    txns: Arc<TransactionManager>,
    log: SharedLog,
    replicas: Arc<dyn ReplicaClient>,
    time: Arc<dyn TimeSource>,
    job_ids: LogicalClock,
    jobs: RwLock<BTreeMap<JobId, Arc<Mutex<SchemaJob>>>>,
    in_flight: Mutex<HashSet<JobId>>,
}

impl std::fmt::Debug for SchemaChangeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaChangeCoordinator")
            .field("last_job_id", &self.job_ids.current())
            .field("jobs", &self.jobs.read().len())
            .finish()
    }
}

impl SchemaChangeCoordinator {
    pub fn new(
        config: Arc<KernelConfig>,
        catalog: Arc<Catalog>,
        txns: Arc<TransactionManager>,
        log: SharedLog,
        replicas: Arc<dyn ReplicaClient>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            config,
            catalog,
            txns,
            log,
            replicas,
            time,
            job_ids: LogicalClock::new(),
            jobs: RwLock::new(BTreeMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Reinstall recovered jobs and put back the fences of live ones.
    /// Schemas of finished jobs are restored from the state log separately.
    pub(crate) fn restore(&self, jobs: impl IntoIterator<Item = SchemaJob>, last_job_id: u64) {
        self.job_ids.observe(last_job_id);
        for job in jobs {
            self.job_ids.observe(job.id.0);
            match (job.state, job.fence) {
                (JobState::WaitingFence | JobState::Running, Some(fence)) => {
                    self.txns.restore_fence(job.db, job.table, job.id, fence);
                }
                _ => {}
            }
            self.jobs.write().insert(job.id, Arc::new(Mutex::new(job)));
        }
    }

    fn record(&self, job_id: JobId) -> Result<Arc<Mutex<SchemaJob>>, SchemaError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(SchemaError::NotFound(job_id))
    }

    fn transition(&self, job: &mut SchemaJob, event: StateEvent) -> Result<(), SchemaError> {
        let mut next = job.clone();
        next.apply(&event)?;
        if let Err(e) = self.log.lock().append(event) {
            tracing::error!(job = %job.id, error = %e, "failed to persist schema job transition");
            return Err(e.into());
        }
        *job = next;
        Ok(())
    }

    /// Plan `mutations` against the current schema of the index. Returns the
    /// resulting columns and the version they were planned against.
    fn plan(
        &self,
        table: TableId,
        rollup: Option<&str>,
        mutations: &[ColumnMutation],
    ) -> Result<(Vec<Column>, u64), SchemaError> {
        let conflict = |reason: String| SchemaError::Conflict { table, reason };
        let current = self
            .catalog
            .table(table)
            .ok_or_else(|| conflict("table does not exist".into()))?;
        let schema = current
            .schema(rollup)
            .ok_or_else(|| conflict(format!("index `{}` does not exist", rollup.unwrap_or(""))))?;
        Ok((plan_columns(table, schema, mutations)?, schema.version))
    }

    /// Accept a validated intent.
    ///
    /// The table is fenced, the intent is re-checked against the current
    /// schema, and the job is persisted before its id is returned.
    pub fn submit(&self, intent: SchemaChangeIntent) -> Result<JobId, SchemaError> {
        let table = self.catalog.table(intent.table).ok_or(SchemaError::Conflict {
            table: intent.table,
            reason: "table does not exist".into(),
        })?;
        let rollup = intent.rollup().map(str::to_string);

        let job_id = JobId(self.job_ids.tick());
        let fence = self.txns.install_fence(table.db, table.id, job_id)?;
        let (target_columns, base_version) =
            match self.plan(table.id, rollup.as_deref(), &intent.mutations) {
                Ok(plan) => plan,
                Err(e) => {
                    self.txns.release_fence(table.db, table.id, job_id);
                    return Err(e);
                }
            };

        let mut job = SchemaJob {
            id: job_id,
            db: table.db,
            table: table.id,
            rollup,
            mutations: intent.mutations,
            target_columns,
            base_version,
            properties: intent.properties,
            state: JobState::Pending,
            fence: None,
            replicas: table.replicas(),
            applied: Default::default(),
            created_at_ms: self.time.now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
            cancelled_at_ms: None,
            schema_version: None,
            cancel_reason: None,
        };
        if let Err(e) = self.log.lock().append(StateEvent::JobSubmitted { job: job.clone() }) {
            self.txns.release_fence(table.db, table.id, job_id);
            tracing::error!(table = %table.id, error = %e, "failed to persist schema change job");
            return Err(e.into());
        }
        tracing::info!(
            job = %job_id,
            table = %table.id,
            sql = %job.to_sql(),
            "schema change submitted"
        );

        let fenced = StateEvent::JobFenced {
            job_id,
            fence,
            target_columns: job.target_columns.clone(),
            base_version,
        };
        if let Err(e) = self.transition(&mut job, fenced) {
            // Accepted but unfenced: the job stays PENDING and the next
            // pass fences and plans it again.
            self.txns.release_fence(job.db, job.table, job_id);
            tracing::warn!(job = %job_id, error = %e, "job left pending");
        } else {
            tracing::info!(job = %job_id, %fence, "waiting for transactions up to fence");
        }
        self.jobs.write().insert(job_id, Arc::new(Mutex::new(job)));
        Ok(job_id)
    }

    /// Cancel a job that has not finished. The table schema is untouched.
    pub fn cancel(&self, job_id: JobId, reason: &str) -> Result<(), SchemaError> {
        let record = self.record(job_id)?;
        let mut job = record.lock();
        if job.state.is_terminal() {
            return Err(SchemaError::InvalidState {
                job: job_id,
                state: job.state,
                operation: "cancel",
            });
        }
        self.cancel_locked(&mut job, reason)
    }

    fn cancel_locked(&self, job: &mut SchemaJob, reason: &str) -> Result<(), SchemaError> {
        let fenced = job.fence.is_some();
        self.transition(
            job,
            StateEvent::JobCancelled {
                job_id: job.id,
                reason: reason.into(),
                cancelled_at_ms: self.time.now_ms(),
            },
        )?;
        if fenced {
            self.txns.release_fence(job.db, job.table, job.id);
        }
        tracing::info!(job = %job.id, table = %job.table, reason, "schema change cancelled");
        Ok(())
    }

    pub fn job(&self, job_id: JobId) -> Option<SchemaJob> {
        self.record(job_id).ok().map(|r| r.lock().clone())
    }

    pub fn jobs(&self) -> Vec<SchemaJob> {
        let records: Vec<_> = self.jobs.read().values().cloned().collect();
        records.iter().map(|r| r.lock().clone()).collect()
    }

    pub fn last_job_id(&self) -> JobId {
        JobId(self.job_ids.current())
    }

    /// Advance one job as far as it can go without waiting. Returns the
    /// state it ends up in.
    pub async fn step(&self, job_id: JobId) -> Result<JobState, SchemaError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight, job_id) else {
            return Ok(self.record(job_id)?.lock().state);
        };

        let mutation = {
            let record = self.record(job_id)?;
            let mut job = record.lock();
            if job.state == JobState::Pending {
                self.fence(&mut job)?;
            }
            if job.state == JobState::WaitingFence {
                self.start_if_cleared(&mut job)?;
            }
            if job.state != JobState::Running {
                return Ok(job.state);
            }
            if job.pending_replicas().is_empty() {
                self.finish(&mut job)?;
                return Ok(job.state);
            }
            (job.mutation(), job.table, job.pending_replicas())
        };

        let (mutation, table, pending) = mutation;
        let timeout = self.config.replica_rpc_timeout();
        let results = join_all(pending.into_iter().map(|replica| {
            let mutation = &mutation;
            async move {
                let outcome = match tokio::time::timeout(
                    timeout,
                    self.replicas.apply_schema_mutation(table, replica, mutation),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ReplicaError::Timeout(replica)),
                };
                (replica, outcome)
            }
        }))
        .await;

        let record = self.record(job_id)?;
        let mut job = record.lock();
        if job.state != JobState::Running {
            return Ok(job.state);
        }
        let mut rejected: Option<(ReplicaId, String)> = None;
        for (replica, outcome) in results {
            match outcome {
                Ok(()) => {
                    if !job.applied.contains(&replica) {
                        self.transition(&mut job, StateEvent::JobReplicaApplied { job_id, replica })?;
                    }
                }
                Err(ReplicaError::Rejected(_, reason)) => {
                    rejected.get_or_insert((replica, reason));
                }
                Err(e) => {
                    tracing::debug!(
                        job = %job_id,
                        %replica,
                        error = %e,
                        "schema mutation attempt failed, will retry"
                    );
                }
            }
        }

        if let Some((replica, reason)) = rejected {
            tracing::warn!(job = %job_id, %replica, %reason, "replica rejected schema change");
            self.cancel_locked(&mut job, &format!("{replica} rejected mutation: {reason}"))?;
        } else if job.pending_replicas().is_empty() {
            self.finish(&mut job)?;
        }
        Ok(job.state)
    }

    fn fence(&self, job: &mut SchemaJob) -> Result<(), SchemaError> {
        let fence = match self.txns.install_fence(job.db, job.table, job.id) {
            Ok(fence) => fence,
            Err(TxnError::SchemaChangeInProgress { job: holder, .. }) if holder != job.id => {
                tracing::debug!(job = %job.id, %holder, "table still fenced by another job");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let job_id = job.id;

        // Jobs that finished while this one waited may have moved the schema.
        let (target_columns, base_version) =
            match self.plan(job.table, job.rollup.as_deref(), &job.mutations) {
                Ok(plan) => plan,
                Err(SchemaError::Conflict { reason, .. }) => {
                    self.txns.release_fence(job.db, job.table, job_id);
                    tracing::warn!(job = %job_id, %reason, "schema moved under pending job");
                    return self.cancel_locked(job, &format!("schema conflict: {reason}"));
                }
                Err(e) => {
                    self.txns.release_fence(job.db, job.table, job_id);
                    return Err(e);
                }
            };
        if base_version != job.base_version {
            tracing::info!(
                job = %job_id,
                from = job.base_version,
                to = base_version,
                "re-planned schema change against newer schema"
            );
        }

        let fenced = StateEvent::JobFenced {
            job_id,
            fence,
            target_columns,
            base_version,
        };
        if let Err(e) = self.transition(job, fenced) {
            self.txns.release_fence(job.db, job.table, job_id);
            return Err(e);
        }
        Ok(())
    }

    fn start_if_cleared(&self, job: &mut SchemaJob) -> Result<(), SchemaError> {
        let Some(fence) = job.fence else {
            return Ok(());
        };
        if !self.txns.fence_cleared(job.table, fence) {
            return Ok(());
        }
        let job_id = job.id;
        self.transition(
            job,
            StateEvent::JobRunning {
                job_id,
                started_at_ms: self.time.now_ms(),
            },
        )?;
        tracing::info!(
            job = %job_id,
            table = %job.table,
            %fence,
            "fence cleared, applying schema change"
        );
        Ok(())
    }

    fn finish(&self, job: &mut SchemaJob) -> Result<(), SchemaError> {
        let job_id = job.id;
        let stored = self
            .catalog
            .table(job.table)
            .and_then(|t| t.schema(job.rollup.as_deref()).map(|s| s.version));
        if stored != Some(job.base_version) {
            let reason = format!(
                "schema version is {stored:?}, job was planned against {}",
                job.base_version
            );
            return self.cancel_locked(job, &reason);
        }

        let schema_version = job.target_version();
        self.transition(
            job,
            StateEvent::JobFinished {
                job_id,
                schema_version,
                finished_at_ms: self.time.now_ms(),
            },
        )?;
        let swapped = self.catalog.swap_schema(
            job.table,
            job.rollup.as_deref(),
            job.target_columns.clone(),
            job.base_version,
        );
        self.txns.release_fence(job.db, job.table, job_id);
        swapped?;
        tracing::info!(job = %job_id, table = %job.table, schema_version, "schema change finished");
        Ok(())
    }

    /// One pass over every live job. Returns how many reached a terminal state.
    pub async fn run_pending(&self) -> usize {
        let live: Vec<JobId> = self
            .jobs()
            .into_iter()
            .filter(|j| !j.state.is_terminal())
            .map(|j| j.id)
            .collect();

        let outcomes = join_all(
            live.into_iter()
                .map(|job_id| async move { (job_id, self.step(job_id).await) }),
        )
        .await;

        let mut ended = 0;
        for (job_id, outcome) in outcomes {
            match outcome {
                Ok(state) if state.is_terminal() => ended += 1,
                Ok(_) => {}
                Err(e) => tracing::error!(job = %job_id, error = %e, "schema job step failed"),
            }
        }
        ended
    }

    /// Step `job_id` until it finishes or is cancelled.
    pub async fn run_to_completion(&self, job_id: JobId) -> Result<JobState, SchemaError> {
        let interval = Duration::from_millis(self.config.schema_job_interval_ms);
        loop {
            let state = self.step(job_id).await?;
            if state.is_terminal() {
                return Ok(state);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Drop finished and cancelled jobs past the retention period.
    pub fn retire_finished(&self) -> Result<usize, SchemaError> {
        let now = self.time.now_ms();
        let retention = self.config.terminal_retention().as_millis() as u64;
        let expired: Vec<JobId> = self
            .jobs()
            .into_iter()
            .filter(|j| j.state.is_terminal())
            .filter(|j| j.ended_at_ms().is_some_and(|at| now.saturating_sub(at) >= retention))
            .map(|j| j.id)
            .collect();

        for job_id in &expired {
            self.log.lock().append(StateEvent::JobRetired { job_id: *job_id })?;
            self.jobs.write().remove(job_id);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryReplicas;
    use crate::catalog::{AggregateType, Column, Database, Table};
    use crate::clock::ManualTime;
    use crate::ids::{DbId, PartitionId, TableId};
    use crate::log::{InMemoryLogStore, StateLog};
    use crate::quota::QuotaLedger;
    use crate::schema::{ColumnMutation, ColumnPosition};
    use crate::state::TxnState;
    use crate::txn::PartitionCommit;

    const DB: DbId = DbId(1);
    const ORDERS: TableId = TableId(10);
    const P1: PartitionId = PartitionId(100);

    struct Fixture {
        catalog: Arc<Catalog>,
        txns: Arc<TransactionManager>,
        replicas: Arc<InMemoryReplicas>,
        store: InMemoryLogStore,
        time: Arc<ManualTime>,
        coordinator: SchemaChangeCoordinator,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(Catalog::new());
        catalog.add_database(Database::new(DB, "sales", u64::MAX));
        catalog
            .add_table(
                Table::new(
                    ORDERS,
                    DB,
                    "orders",
                    vec![
                        Column::key("id", "BIGINT"),
                        Column::value("amount", "BIGINT").with_aggregate(AggregateType::Sum),
                    ],
                )
                .with_partition(P1, [ReplicaId(1), ReplicaId(2)])
                .with_rollup("by_id", vec![Column::key("id", "BIGINT")]),
            )
            .unwrap();
        let store = InMemoryLogStore::default();
        let log = StateLog::open(Box::new(store.clone())).unwrap().shared();
        let replicas = Arc::new(InMemoryReplicas::new());
        let time = Arc::new(ManualTime::new(0));
        let config = Arc::new(KernelConfig::default());
        let txns = Arc::new(TransactionManager::new(
            Arc::clone(&config),
            Arc::clone(&catalog),
            Arc::new(QuotaLedger::new(u64::MAX)),
            log.clone(),
            replicas.clone(),
            time.clone(),
        ));
        let coordinator = SchemaChangeCoordinator::new(
            config,
            Arc::clone(&catalog),
            Arc::clone(&txns),
            log,
            replicas.clone(),
            time.clone(),
        );
        Fixture {
            catalog,
            txns,
            replicas,
            store,
            time,
            coordinator,
        }
    }

    fn add_note() -> SchemaChangeIntent {
        SchemaChangeIntent::new(
            ORDERS,
            vec![ColumnMutation::add(Column::value("note", "VARCHAR(64)"))],
        )
    }

    fn add_column(name: &str) -> SchemaChangeIntent {
        SchemaChangeIntent::new(ORDERS, vec![ColumnMutation::add(Column::value(name, "INT"))])
    }

    #[tokio::test]
    async fn job_waits_for_transactions_below_fence() {
        let f = fixture();
        let before = f.txns.begin(DB, Some("before"), [ORDERS], 1).unwrap();

        let job_id = f.coordinator.submit(add_note()).unwrap();
        let job = f.coordinator.job(job_id).unwrap();
        assert_eq!(job.state, JobState::WaitingFence);
        assert_eq!(job.fence, Some(before));

        // New writers on the table are held off while the job is active.
        assert!(matches!(
            f.txns.begin(DB, Some("after"), [ORDERS], 1),
            Err(TxnError::SchemaChangeInProgress { .. })
        ));

        assert_eq!(f.coordinator.step(job_id).await.unwrap(), JobState::WaitingFence);
        assert_eq!(f.replicas.mutation_count(ORDERS, ReplicaId(1)), 0);

        f.txns
            .commit(
                before,
                vec![PartitionCommit {
                    table: ORDERS,
                    partition: P1,
                    replicas: [ReplicaId(1), ReplicaId(2)].into(),
                }],
            )
            .unwrap();
        assert_eq!(f.coordinator.step(job_id).await.unwrap(), JobState::WaitingFence);

        f.txns.publish_once(before).await.unwrap();
        assert_eq!(f.txns.get_state(before).unwrap(), TxnState::Visible);
        assert_eq!(f.coordinator.step(job_id).await.unwrap(), JobState::Finished);

        let table = f.catalog.table(ORDERS).unwrap();
        assert_eq!(table.base.version, 2);
        assert!(table.base.column("note").is_some());

        let after = f.txns.begin(DB, Some("after"), [ORDERS], 1).unwrap();
        let txn = f.txns.transaction(after).unwrap();
        assert_eq!(txn.schema_versions[&ORDERS], 2);
    }

    #[tokio::test]
    async fn conflicting_intent_is_rejected_at_submit() {
        let f = fixture();
        let intent = SchemaChangeIntent::new(
            ORDERS,
            vec![ColumnMutation::add_at(
                Column::value("total", "BIGINT").with_aggregate(AggregateType::Max),
                ColumnPosition::First,
            )],
        );
        assert!(matches!(
            f.coordinator.submit(intent),
            Err(SchemaError::Conflict { .. })
        ));
        assert!(f.store.is_empty());
        // No fence was left behind.
        f.txns.begin(DB, None, [ORDERS], 1).unwrap();
    }

    #[tokio::test]
    async fn one_active_job_per_table() {
        let f = fixture();
        f.coordinator.submit(add_note()).unwrap();
        let err = f.coordinator.submit(add_note().with_rollup("by_id")).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::Txn(TxnError::SchemaChangeInProgress { job: JobId(1), .. })
        ));
    }

    #[tokio::test]
    async fn rejected_mutation_cancels_and_leaves_schema_unchanged() {
        let f = fixture();
        f.replicas.reject_schema_changes(ReplicaId(2), "unsupported type");

        let job_id = f.coordinator.submit(add_note()).unwrap();
        assert_eq!(
            f.coordinator.run_to_completion(job_id).await.unwrap(),
            JobState::Cancelled
        );

        let table = f.catalog.table(ORDERS).unwrap();
        assert_eq!(table.base.version, 1);
        assert!(table.base.column("note").is_none());
        assert!(f
            .coordinator
            .job(job_id)
            .unwrap()
            .cancel_reason
            .unwrap()
            .contains("unsupported type"));
        f.txns.begin(DB, None, [ORDERS], 1).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_replica_is_retried() {
        let f = fixture();
        f.replicas.set_down(ReplicaId(1), true);
        let job_id = f.coordinator.submit(add_note()).unwrap();

        assert_eq!(f.coordinator.step(job_id).await.unwrap(), JobState::Running);
        assert_eq!(f.coordinator.job(job_id).unwrap().applied.len(), 1);

        f.replicas.set_down(ReplicaId(1), false);
        assert_eq!(f.coordinator.step(job_id).await.unwrap(), JobState::Finished);
        assert_eq!(f.replicas.mutation_count(ORDERS, ReplicaId(2)), 1);
    }

    #[tokio::test]
    async fn rollup_change_swaps_only_the_rollup() {
        let f = fixture();
        let intent = SchemaChangeIntent::new(
            ORDERS,
            vec![ColumnMutation::add(Column::value("amount", "BIGINT"))],
        )
        .with_rollup("by_id");
        let job_id = f.coordinator.submit(intent).unwrap();
        f.coordinator.run_to_completion(job_id).await.unwrap();

        let table = f.catalog.table(ORDERS).unwrap();
        assert_eq!(table.base.version, 1);
        assert_eq!(table.rollups["by_id"].version, 2);
        assert_eq!(table.rollups["by_id"].columns.len(), 2);
    }

    #[tokio::test]
    async fn user_cancel_releases_fence() {
        let f = fixture();
        f.txns.begin(DB, None, [ORDERS], 1).unwrap();
        let job_id = f.coordinator.submit(add_note()).unwrap();

        f.coordinator.cancel(job_id, "changed plans").unwrap();
        assert!(matches!(
            f.coordinator.cancel(job_id, "again"),
            Err(SchemaError::InvalidState { .. })
        ));
        f.txns.begin(DB, None, [ORDERS], 1).unwrap();
    }

    #[tokio::test]
    async fn finished_jobs_are_retired_after_retention() {
        let f = fixture();
        let job_id = f.coordinator.submit(add_note()).unwrap();
        f.coordinator.run_to_completion(job_id).await.unwrap();

        assert_eq!(f.coordinator.retire_finished().unwrap(), 0);
        f.time.advance(KernelConfig::default().terminal_retention());
        assert_eq!(f.coordinator.retire_finished().unwrap(), 1);
        assert!(f.coordinator.job(job_id).is_none());
    }

    #[tokio::test]
    async fn pending_job_is_replanned_after_another_change_finishes() {
        let f = fixture();
        // Submit is persisted, the fence record is not.
        f.store.fail_appends_after(1);
        let first = f.coordinator.submit(add_column("a")).unwrap();
        assert_eq!(f.coordinator.job(first).unwrap().state, JobState::Pending);
        f.store.fail_appends(false);

        let second = f.coordinator.submit(add_column("b")).unwrap();
        assert_eq!(
            f.coordinator.run_to_completion(second).await.unwrap(),
            JobState::Finished
        );
        assert_eq!(
            f.coordinator.run_to_completion(first).await.unwrap(),
            JobState::Finished
        );

        let table = f.catalog.table(ORDERS).unwrap();
        assert_eq!(table.base.version, 3);
        assert!(table.base.column("a").is_some());
        assert!(table.base.column("b").is_some());
        let job = f.coordinator.job(first).unwrap();
        assert_eq!(job.base_version, 2);
        assert_eq!(job.schema_version, Some(3));
    }

    #[tokio::test]
    async fn pending_job_that_no_longer_applies_is_cancelled() {
        let f = fixture();
        f.store.fail_appends_after(1);
        let first = f.coordinator.submit(add_note()).unwrap();
        f.store.fail_appends(false);

        let second = f.coordinator.submit(add_note()).unwrap();
        f.coordinator.run_to_completion(second).await.unwrap();

        assert_eq!(f.coordinator.step(first).await.unwrap(), JobState::Cancelled);
        let reason = f.coordinator.job(first).unwrap().cancel_reason.unwrap();
        assert!(reason.contains("already exists"), "{reason}");
        assert_eq!(f.catalog.table(ORDERS).unwrap().base.version, 2);
        f.txns.begin(DB, None, [ORDERS], 1).unwrap();
    }
}
