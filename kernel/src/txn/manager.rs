// Transaction Manager
//
// Drives load transactions from admission to VISIBLE or ABORTED. Every
// transition is checked against the invariants, appended to the state log,
// and only then applied in memory.
//
// Locking, outermost first: per-database admission → transaction map →
// single transaction → state log. The quota ledger is always innermost.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use uuid::Uuid;

use super::publish::Retry;
use super::{PartitionCommit, Transaction, TxnError};
use crate::adapters::ReplicaClient;
use crate::catalog::Catalog;
use crate::clock::{LogicalClock, TimeSource, TokenRegistry};
use crate::config::KernelConfig;
use crate::ids::{DbId, JobId, TableId, TxnId};
use crate::invariants::InvariantEngine;
use crate::log::{SharedLog, StateEvent};
use crate::quota::{QuotaLedger, Reconciliation};
use crate::state::TxnState;

/// Content a label was first used with. A retry must match it exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LoadFingerprint {
    tables: BTreeSet<TableId>,
    estimated_bytes: u64,
}

impl LoadFingerprint {
    fn of(txn: &Transaction) -> Self {
        Self {
            tables: txn.tables.clone(),
            estimated_bytes: txn.estimated_bytes,
        }
    }
}

/// Per-database admission state. Held for the whole of `begin`, so label
/// checks, fence checks and watermark updates are atomic together.
#[derive(Debug, Default)]
struct Admission {
    labels: TokenRegistry<String, LoadFingerprint>,
    /// Highest transaction id admitted per table.
    watermarks: TokenRegistry<TableId, ()>,
    /// Active schema fence per table: stamp id is the job, value the fence.
    fences: TokenRegistry<TableId, TxnId>,
}

pub struct TransactionManager {
    pub(super) config: Arc<KernelConfig>,
    catalog: Arc<Catalog>,
    pub(super) quota: Arc<QuotaLedger>,
    log: SharedLog,
    pub(super) replicas: Arc<dyn ReplicaClient>,
    pub(super) time: Arc<dyn TimeSource>,
    invariants: InvariantEngine,
    txn_ids: LogicalClock,
    pub(super) publish_versions: LogicalClock,
    txns: RwLock<BTreeMap<TxnId, Arc<Mutex<Transaction>>>>,
    admissions: Mutex<HashMap<DbId, Arc<Mutex<Admission>>>>,
    pub(super) retries: Mutex<HashMap<TxnId, Retry>>,
    pub(super) in_flight: Mutex<HashSet<TxnId>>,
    pub(super) publish_wakeup: Arc<Notify>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("last_txn_id", &self.txn_ids.current())
            .field("transactions", &self.txns.read().len())
            .finish()
    }
}

impl TransactionManager {
    pub fn new(
        config: Arc<KernelConfig>,
        catalog: Arc<Catalog>,
        quota: Arc<QuotaLedger>,
        log: SharedLog,
        replicas: Arc<dyn ReplicaClient>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let invariants = InvariantEngine::with_defaults(config.publish_quorum);
        Self {
            config,
            catalog,
            quota,
            log,
            replicas,
            time,
            invariants,
            txn_ids: LogicalClock::new(),
            publish_versions: LogicalClock::new(),
            txns: RwLock::new(BTreeMap::new()),
            admissions: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            publish_wakeup: Arc::new(Notify::new()),
        }
    }

    /// Rebuild in-memory state from recovered records. COMMITTED
    /// transactions are queued for publish; live ones get their quota
    /// reservation back.
    pub(crate) fn restore(
        &self,
        transactions: impl IntoIterator<Item = Transaction>,
        last_txn_id: u64,
        last_publish_version: u64,
    ) {
        self.txn_ids.observe(last_txn_id);
        self.publish_versions.observe(last_publish_version);

        let mut ordered: Vec<_> = transactions.into_iter().collect();
        ordered.sort_by_key(|t| t.id);
        for txn in ordered {
            self.txn_ids.observe(txn.id.0);
            if let Some(version) = txn.publish_version {
                self.publish_versions.observe(version);
            }
            {
                let admission = self.admission(txn.db);
                let mut admission = admission.lock();
                admission
                    .labels
                    .replace(txn.label.clone(), txn.id.0, LoadFingerprint::of(&txn));
                for table in &txn.tables {
                    admission.watermarks.advance(*table, txn.id.0, ());
                }
            }
            if txn.state.is_live() {
                self.quota
                    .restore_reservation(txn.db, txn.id, txn.estimated_bytes);
            }
            if txn.state == TxnState::Committed {
                self.schedule_publish(txn.id);
            }
            self.txns.write().insert(txn.id, Arc::new(Mutex::new(txn)));
        }
        tracing::info!(
            transactions = self.txns.read().len(),
            pending_publish = self.retries.lock().len(),
            last_txn_id = self.txn_ids.current(),
            "transaction state restored"
        );
    }

    fn admission(&self, db: DbId) -> Arc<Mutex<Admission>> {
        Arc::clone(self.admissions.lock().entry(db).or_default())
    }

    pub(super) fn record(&self, txn_id: TxnId) -> Result<Arc<Mutex<Transaction>>, TxnError> {
        self.txns
            .read()
            .get(&txn_id)
            .cloned()
            .ok_or(TxnError::NotFound(txn_id))
    }

    /// Validate, persist, then apply one event to `txn`.
    pub(super) fn transition(
        &self,
        txn: &mut Transaction,
        event: StateEvent,
    ) -> Result<(), TxnError> {
        let mut next = txn.clone();
        next.apply(&event)?;
        self.invariants.evaluate(txn, &event, &next)?;
        if let Err(e) = self.log.lock().append(event) {
            tracing::error!(txn = %txn.id, error = %e, "failed to persist transaction transition");
            return Err(e.into());
        }
        *txn = next;
        Ok(())
    }

    /// Admit a new load transaction.
    ///
    /// Reusing a label with identical content returns the original id
    /// instead of creating a second transaction. A label whose transaction
    /// was aborted may be reused.
    pub fn begin(
        &self,
        db: DbId,
        label: Option<&str>,
        tables: impl IntoIterator<Item = TableId>,
        estimated_bytes: u64,
    ) -> Result<TxnId, TxnError> {
        let database = self
            .catalog
            .database(db)
            .ok_or(TxnError::UnknownDatabase(db))?;
        let tables: BTreeSet<TableId> = tables.into_iter().collect();
        self.check_tables(db, &tables)?;
        let label = match label {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => format!("insert_{}", Uuid::new_v4().simple()),
        };
        let fingerprint = LoadFingerprint {
            tables: tables.clone(),
            estimated_bytes,
        };

        let admission = self.admission(db);
        let mut admission = admission.lock();

        if let Some(held) = admission.labels.get(&label) {
            let existing = TxnId(held.id);
            let state = self
                .txns
                .read()
                .get(&existing)
                .map(|record| record.lock().state);
            match state {
                Some(TxnState::Aborted) | None => {}
                Some(_) if held.value == fingerprint => {
                    tracing::info!(
                        %db,
                        %label,
                        txn = %existing,
                        "duplicate label, returning existing transaction"
                    );
                    return Ok(existing);
                }
                Some(_) => {
                    tracing::info!(
                        %db,
                        %label,
                        txn = %existing,
                        "label reused with different content"
                    );
                    return Err(TxnError::LabelConflict { label, existing });
                }
            }
        }

        for table in &tables {
            if let Some(fence) = admission.fences.get(table) {
                return Err(TxnError::SchemaChangeInProgress {
                    table: *table,
                    job: JobId(fence.id),
                });
            }
        }

        // Read under the admission lock: a finishing schema job swaps the
        // catalog before it lifts its fence.
        let schema_versions = self.check_tables(db, &tables)?;

        self.quota.register(db, database.quota_bytes);
        let txn_id = TxnId(self.txn_ids.tick());
        if !self.quota.admit(db, txn_id, estimated_bytes) {
            let available = self
                .quota
                .snapshot(db)
                .map(|s| s.available_bytes())
                .unwrap_or(0);
            return Err(TxnError::QuotaExceeded {
                db,
                requested: estimated_bytes,
                available,
            });
        }

        let event = StateEvent::TxnBegun {
            txn_id,
            db,
            label: label.clone(),
            tables: tables.clone(),
            schema_versions,
            estimated_bytes,
            created_at_ms: self.time.now_ms(),
        };
        let txn = Transaction::from_event(&event)?;
        if let Err(e) = self.log.lock().append(event) {
            self.quota.release(db, txn_id);
            tracing::error!(%db, %label, error = %e, "failed to persist transaction begin");
            return Err(e.into());
        }

        self.txns.write().insert(txn_id, Arc::new(Mutex::new(txn)));
        admission.labels.replace(label.clone(), txn_id.0, fingerprint);
        for table in &tables {
            admission.watermarks.advance(*table, txn_id.0, ());
        }
        tracing::info!(%db, %label, txn = %txn_id, estimated_bytes, "transaction begun");
        Ok(txn_id)
    }

    /// Schema version of every table, which must all belong to `db`.
    fn check_tables(
        &self,
        db: DbId,
        tables: &BTreeSet<TableId>,
    ) -> Result<BTreeMap<TableId, u64>, TxnError> {
        tables
            .iter()
            .map(|table| match self.catalog.table(*table) {
                Some(t) if t.db == db => Ok((*table, t.base.version)),
                _ => Err(TxnError::UnknownTable { db, table: *table }),
            })
            .collect()
    }

    /// Record the commit manifest and queue the transaction for publish.
    pub fn commit(&self, txn_id: TxnId, manifest: Vec<PartitionCommit>) -> Result<(), TxnError> {
        let record = self.record(txn_id)?;
        let mut txn = record.lock();
        if txn.state != TxnState::Created {
            return Err(TxnError::InvalidState {
                txn: txn_id,
                state: txn.state,
                operation: "commit",
            });
        }
        self.validate_manifest(&txn, &manifest)?;

        let partitions = manifest.len();
        self.transition(
            &mut txn,
            StateEvent::TxnCommitted {
                txn_id,
                manifest,
                committed_at_ms: self.time.now_ms(),
            },
        )?;
        drop(txn);

        self.schedule_publish(txn_id);
        tracing::info!(txn = %txn_id, partitions, "transaction committed");
        Ok(())
    }

    fn validate_manifest(
        &self,
        txn: &Transaction,
        manifest: &[PartitionCommit],
    ) -> Result<(), TxnError> {
        let mismatch = |reason: String| TxnError::PartitionMismatch {
            txn: txn.id,
            reason,
        };
        if manifest.is_empty() {
            return Err(mismatch("manifest has no partitions".into()));
        }
        let mut seen = BTreeSet::new();
        for entry in manifest {
            if !seen.insert(entry.partition) {
                return Err(mismatch(format!("{} listed twice", entry.partition)));
            }
            if !txn.tables.contains(&entry.table) {
                return Err(mismatch(format!(
                    "{} is not a participant of the transaction",
                    entry.table
                )));
            }
            if self.catalog.partition_owner(entry.partition) != Some(entry.table) {
                return Err(mismatch(format!(
                    "{} does not belong to {}",
                    entry.partition, entry.table
                )));
            }
            if entry.replicas.is_empty() {
                return Err(mismatch(format!("{} has no replicas", entry.partition)));
            }
            match self.catalog.partition_replicas(entry.partition) {
                Some(placement) if placement == entry.replicas => {}
                placement => {
                    return Err(mismatch(format!(
                        "{} replicas {:?} do not match placement {:?}",
                        entry.partition,
                        entry.replicas,
                        placement.unwrap_or_default()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Abort a transaction that has not started publishing.
    pub fn abort(&self, txn_id: TxnId, reason: &str) -> Result<(), TxnError> {
        self.abort_with(txn_id, reason, false)
    }

    /// Administrative cancel of a COMMITTED transaction whose publish is
    /// stuck. This is the only way publish is ever abandoned, and only while
    /// no replica has acknowledged the version.
    pub fn cancel_publish(&self, txn_id: TxnId, reason: &str) -> Result<(), TxnError> {
        self.abort_with(txn_id, reason, true)
    }

    fn abort_with(&self, txn_id: TxnId, reason: &str, forced: bool) -> Result<(), TxnError> {
        let record = self.record(txn_id)?;
        let mut txn = record.lock();
        match txn.state {
            TxnState::Created if !forced => {}
            TxnState::Committed if !txn.publish_started() => {}
            TxnState::Committed if forced && !txn.manifest.any_acked() => {}
            TxnState::Committed | TxnState::Visible => {
                return Err(TxnError::AlreadyVisible(txn_id));
            }
            state => {
                return Err(TxnError::InvalidState {
                    txn: txn_id,
                    state,
                    operation: if forced { "cancel publish of" } else { "abort" },
                });
            }
        }
        self.transition(
            &mut txn,
            StateEvent::TxnAborted {
                txn_id,
                reason: reason.into(),
                forced,
                aborted_at_ms: self.time.now_ms(),
            },
        )?;
        let db = txn.db;
        drop(txn);

        self.quota.release(db, txn_id);
        self.retries.lock().remove(&txn_id);
        if forced {
            tracing::warn!(txn = %txn_id, reason, "publish cancelled administratively");
        } else {
            tracing::info!(txn = %txn_id, reason, "transaction aborted");
        }
        Ok(())
    }

    /// Current state. Never waits on publish.
    pub fn get_state(&self, txn_id: TxnId) -> Result<TxnState, TxnError> {
        Ok(self.record(txn_id)?.lock().state)
    }

    pub fn transaction(&self, txn_id: TxnId) -> Option<Transaction> {
        self.record(txn_id).ok().map(|r| r.lock().clone())
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        let records: Vec<_> = self.txns.read().values().cloned().collect();
        records.iter().map(|r| r.lock().clone()).collect()
    }

    /// True while `txn_id` is CREATED or COMMITTED.
    pub fn is_live(&self, txn_id: TxnId) -> bool {
        self.record(txn_id)
            .map(|r| r.lock().state.is_live())
            .unwrap_or(false)
    }

    pub fn last_txn_id(&self) -> TxnId {
        TxnId(self.txn_ids.current())
    }

    /// Block new admissions on `table` and return the fence: the highest
    /// transaction id admitted on it so far.
    pub fn install_fence(&self, db: DbId, table: TableId, job: JobId) -> Result<TxnId, TxnError> {
        match self.catalog.table(table) {
            Some(t) if t.db == db => {}
            _ => return Err(TxnError::UnknownTable { db, table }),
        }
        let admission = self.admission(db);
        let mut admission = admission.lock();
        let fence = TxnId(admission.watermarks.high_water(&table));
        admission
            .fences
            .claim(table, job.0, fence)
            .map_err(|held| TxnError::SchemaChangeInProgress {
                table,
                job: JobId(held.id),
            })?;
        tracing::info!(%table, %job, %fence, "schema fence installed");
        Ok(fence)
    }

    pub(crate) fn restore_fence(&self, db: DbId, table: TableId, job: JobId, fence: TxnId) {
        self.admission(db).lock().fences.replace(table, job.0, fence);
    }

    pub fn release_fence(&self, db: DbId, table: TableId, job: JobId) {
        if self.admission(db).lock().fences.release(&table, job.0) {
            tracing::info!(%table, %job, "schema fence released");
        }
    }

    /// Whether every transaction on `table` with id ≤ `fence` has finished.
    pub fn fence_cleared(&self, table: TableId, fence: TxnId) -> bool {
        let records: Vec<_> = self
            .txns
            .read()
            .range(..=fence)
            .map(|(_, r)| Arc::clone(r))
            .collect();
        records.iter().all(|record| {
            let txn = record.lock();
            !(txn.tables.contains(&table) && txn.state.is_live())
        })
    }

    /// Replace the used bytes of `db` with a fresh measurement and clear
    /// reservations whose transaction is no longer live. Admission on the
    /// database is paused meanwhile, so a reservation taken by an in-flight
    /// `begin` is never mistaken for a stale one.
    pub fn reconcile_quota(&self, db: DbId, used_bytes: u64) -> Reconciliation {
        let admission = self.admission(db);
        let _paused = admission.lock();
        let live: HashSet<TxnId> = self
            .transactions()
            .into_iter()
            .filter(|t| t.db == db && t.state.is_live())
            .map(|t| t.id)
            .collect();
        self.quota.reconcile(db, used_bytes, |txn| live.contains(&txn))
    }

    /// Abort CREATED transactions older than the configured timeout.
    pub fn abort_expired(&self) -> usize {
        let now = self.time.now_ms();
        let timeout = self.config.txn_timeout().as_millis() as u64;
        let expired: Vec<TxnId> = self
            .transactions()
            .into_iter()
            .filter(|t| t.state == TxnState::Created)
            .filter(|t| now.saturating_sub(t.created_at_ms) >= timeout)
            .map(|t| t.id)
            .collect();

        let mut aborted = 0;
        for txn_id in expired {
            match self.abort(txn_id, "transaction timed out before commit") {
                Ok(()) => aborted += 1,
                Err(TxnError::InvalidState { .. } | TxnError::AlreadyVisible(_)) => {}
                Err(e) => tracing::warn!(txn = %txn_id, error = %e, "failed to abort expired transaction"),
            }
        }
        aborted
    }

    /// Drop terminal transactions past the retention period. Their labels
    /// become free again.
    pub fn retire_finished(&self) -> Result<usize, TxnError> {
        let now = self.time.now_ms();
        let retention = self.config.terminal_retention().as_millis() as u64;
        let candidates: Vec<TxnId> = self
            .transactions()
            .into_iter()
            .filter(|t| {
                t.finished_at_ms()
                    .is_some_and(|at| now.saturating_sub(at) >= retention)
            })
            .map(|t| t.id)
            .collect();

        let mut retired = 0;
        for txn_id in candidates {
            let (db, label) = {
                let record = self.record(txn_id)?;
                let txn = record.lock();
                if !txn.state.is_terminal() {
                    continue;
                }
                self.log.lock().append(StateEvent::TxnRetired { txn_id })?;
                (txn.db, txn.label.clone())
            };
            self.txns.write().remove(&txn_id);
            self.admission(db).lock().labels.release(&label, txn_id.0);
            retired += 1;
        }
        if retired > 0 {
            tracing::info!(retired, "retired finished transactions");
        }
        Ok(retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryReplicas;
    use crate::catalog::{Column, Database, Table};
    use crate::clock::ManualTime;
    use crate::ids::{PartitionId, ReplicaId};
    use crate::log::{InMemoryLogStore, StateLog};
    use crate::txn::PublishProgress;
    use proptest::prelude::*;
    use std::time::Duration;

    const DB: DbId = DbId(1);
    const ORDERS: TableId = TableId(10);

    struct Fixture {
        manager: TransactionManager,
        store: InMemoryLogStore,
        quota: Arc<QuotaLedger>,
        time: Arc<ManualTime>,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(Catalog::new());
        catalog.add_database(Database::new(DB, "sales", 1_000));
        catalog
            .add_table(
                Table::new(ORDERS, DB, "orders", vec![Column::key("id", "BIGINT")])
                    .with_partition(PartitionId(100), [ReplicaId(1), ReplicaId(2)]),
            )
            .unwrap();
        let store = InMemoryLogStore::default();
        let log = StateLog::open(Box::new(store.clone())).unwrap().shared();
        let quota = Arc::new(QuotaLedger::new(u64::MAX));
        let time = Arc::new(ManualTime::new(1_000));
        let manager = TransactionManager::new(
            Arc::new(KernelConfig::default()),
            catalog,
            Arc::clone(&quota),
            log,
            Arc::new(InMemoryReplicas::new()),
            time.clone(),
        );
        Fixture {
            manager,
            store,
            quota,
            time,
        }
    }

    fn manifest() -> Vec<PartitionCommit> {
        vec![PartitionCommit {
            table: ORDERS,
            partition: PartitionId(100),
            replicas: [ReplicaId(1), ReplicaId(2)].into(),
        }]
    }

    #[test]
    fn quota_scenario_admit_reject_release_admit() {
        let f = fixture();
        let a = f.manager.begin(DB, Some("A"), [ORDERS], 600).unwrap();

        let err = f.manager.begin(DB, Some("B"), [ORDERS], 500).unwrap_err();
        assert!(matches!(
            err,
            TxnError::QuotaExceeded {
                requested: 500,
                available: 400,
                ..
            }
        ));

        f.manager.abort(a, "client gave up").unwrap();
        assert_eq!(f.quota.snapshot(DB).unwrap().pending_bytes, 0);

        let b = f.manager.begin(DB, Some("B"), [ORDERS], 500).unwrap();
        assert!(b > a);
        assert_eq!(f.manager.get_state(b).unwrap(), TxnState::Created);
    }

    #[test]
    fn same_label_same_content_is_idempotent() {
        let f = fixture();
        let first = f.manager.begin(DB, Some("load-1"), [ORDERS], 10).unwrap();
        let second = f.manager.begin(DB, Some("load-1"), [ORDERS], 10).unwrap();
        assert_eq!(first, second);
        assert_eq!(f.quota.snapshot(DB).unwrap().reservations, 1);
    }

    #[test]
    fn same_label_different_content_conflicts() {
        let f = fixture();
        let first = f.manager.begin(DB, Some("load-1"), [ORDERS], 10).unwrap();
        let err = f.manager.begin(DB, Some("load-1"), [ORDERS], 11).unwrap_err();
        assert!(matches!(err, TxnError::LabelConflict { existing, .. } if existing == first));
    }

    #[test]
    fn aborted_label_can_be_reused() {
        let f = fixture();
        let first = f.manager.begin(DB, Some("load-1"), [ORDERS], 10).unwrap();
        f.manager.abort(first, "retry").unwrap();
        let second = f.manager.begin(DB, Some("load-1"), [ORDERS], 10).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn missing_label_is_generated() {
        let f = fixture();
        let txn = f.manager.begin(DB, None, [ORDERS], 10).unwrap();
        assert!(f.manager.transaction(txn).unwrap().label.starts_with("insert_"));
    }

    #[test]
    fn begin_is_persisted_before_returning() {
        let f = fixture();
        f.manager.begin(DB, Some("x"), [ORDERS], 10).unwrap();
        assert_eq!(f.store.len(), 1);
    }

    #[test]
    fn persistence_failure_surfaces_and_releases_quota() {
        let f = fixture();
        f.store.fail_appends(true);
        let err = f.manager.begin(DB, Some("x"), [ORDERS], 10).unwrap_err();
        assert!(matches!(err, TxnError::Persistence(_)));
        assert_eq!(f.quota.snapshot(DB).unwrap().pending_bytes, 0);
        f.store.fail_appends(false);

        let txn = f.manager.begin(DB, Some("x"), [ORDERS], 10).unwrap();
        f.store.fail_appends(true);
        assert!(f.manager.commit(txn, manifest()).is_err());
        assert_eq!(f.manager.get_state(txn).unwrap(), TxnState::Created);
    }

    #[test]
    fn unknown_table_is_rejected() {
        let f = fixture();
        let err = f.manager.begin(DB, None, [TableId(99)], 1).unwrap_err();
        assert!(matches!(err, TxnError::UnknownTable { .. }));
        let err = f.manager.begin(DbId(42), None, [ORDERS], 1).unwrap_err();
        assert!(matches!(err, TxnError::UnknownDatabase(_)));
    }

    #[test]
    fn commit_validates_state_and_partitions() {
        let f = fixture();
        assert!(matches!(
            f.manager.commit(TxnId(77), manifest()),
            Err(TxnError::NotFound(_))
        ));

        let txn = f.manager.begin(DB, None, [ORDERS], 1).unwrap();
        let foreign = vec![PartitionCommit {
            table: ORDERS,
            partition: PartitionId(555),
            replicas: [ReplicaId(1)].into(),
        }];
        assert!(matches!(
            f.manager.commit(txn, foreign),
            Err(TxnError::PartitionMismatch { .. })
        ));
        assert!(matches!(
            f.manager.commit(txn, Vec::new()),
            Err(TxnError::PartitionMismatch { .. })
        ));

        f.manager.commit(txn, manifest()).unwrap();
        assert!(matches!(
            f.manager.commit(txn, manifest()),
            Err(TxnError::InvalidState {
                state: TxnState::Committed,
                ..
            })
        ));
    }

    #[test]
    fn committed_transaction_can_abort_until_publish_starts() {
        let f = fixture();
        let txn = f.manager.begin(DB, None, [ORDERS], 1).unwrap();
        f.manager.commit(txn, manifest()).unwrap();
        f.manager.abort(txn, "changed my mind").unwrap();
        assert_eq!(f.manager.get_state(txn).unwrap(), TxnState::Aborted);
        assert!(matches!(
            f.manager.abort(txn, "again"),
            Err(TxnError::InvalidState { .. })
        ));
    }

    #[test]
    fn fence_blocks_new_admissions_and_tracks_watermark() {
        let f = fixture();
        let first = f.manager.begin(DB, None, [ORDERS], 1).unwrap();

        let fence = f.manager.install_fence(DB, ORDERS, JobId(1)).unwrap();
        assert_eq!(fence, first);
        assert!(!f.manager.fence_cleared(ORDERS, fence));

        let err = f.manager.begin(DB, None, [ORDERS], 1).unwrap_err();
        assert!(matches!(err, TxnError::SchemaChangeInProgress { job: JobId(1), .. }));
        assert!(matches!(
            f.manager.install_fence(DB, ORDERS, JobId(2)),
            Err(TxnError::SchemaChangeInProgress { job: JobId(1), .. })
        ));

        f.manager.abort(first, "done").unwrap();
        assert!(f.manager.fence_cleared(ORDERS, fence));

        f.manager.release_fence(DB, ORDERS, JobId(1));
        f.manager.begin(DB, None, [ORDERS], 1).unwrap();
    }

    #[test]
    fn reconcile_keeps_live_reservations_only() {
        let f = fixture();
        let live = f.manager.begin(DB, Some("live"), [ORDERS], 100).unwrap();
        f.quota.admit(DB, TxnId(999), 50);

        let outcome = f.manager.reconcile_quota(DB, 300);
        assert_eq!(outcome.cleared_reservations, 1);
        let again = f.manager.reconcile_quota(DB, 300);
        assert_eq!(again.previous_used, 300);

        let snapshot = f.quota.snapshot(DB).unwrap();
        assert_eq!(snapshot.used_bytes, 300);
        assert_eq!(snapshot.pending_bytes, 100);
        assert!(f.manager.is_live(live));
    }

    #[test]
    fn expired_created_transactions_are_aborted() {
        let f = fixture();
        let old = f.manager.begin(DB, None, [ORDERS], 1).unwrap();
        f.time.advance(Duration::from_secs(1_800));
        let young = f.manager.begin(DB, None, [ORDERS], 1).unwrap();
        f.time.advance(Duration::from_secs(1_800));

        assert_eq!(f.manager.abort_expired(), 1);
        assert_eq!(f.manager.get_state(old).unwrap(), TxnState::Aborted);
        assert_eq!(f.manager.get_state(young).unwrap(), TxnState::Created);
    }

    #[test]
    fn finished_transactions_are_retired_after_retention() {
        let f = fixture();
        let txn = f.manager.begin(DB, Some("keep"), [ORDERS], 1).unwrap();
        f.manager.abort(txn, "x").unwrap();

        assert_eq!(f.manager.retire_finished().unwrap(), 0);
        f.time.advance(f.manager.config.terminal_retention());
        assert_eq!(f.manager.retire_finished().unwrap(), 1);

        assert!(matches!(f.manager.get_state(txn), Err(TxnError::NotFound(_))));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Begin(u64),
        Commit(usize),
        Abort(usize),
        Publish(usize),
        Reconcile(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u64..700).prop_map(Op::Begin),
            2 => any::<usize>().prop_map(Op::Commit),
            1 => any::<usize>().prop_map(Op::Abort),
            2 => any::<usize>().prop_map(Op::Publish),
            1 => (0u64..400).prop_map(Op::Reconcile),
        ]
    }

    proptest! {
        #[test]
        fn admitted_loads_never_exceed_quota(ops in prop::collection::vec(op(), 1..60)) {
            let f = fixture();
            f.quota.register(DB, 1_000);
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let mut created: Vec<(TxnId, u64)> = Vec::new();
            let mut committed: Vec<(TxnId, u64)> = Vec::new();

            for op in ops {
                match op {
                    Op::Begin(bytes) => {
                        let before = f.quota.snapshot(DB).unwrap();
                        match f.manager.begin(DB, None, [ORDERS], bytes) {
                            Ok(txn) => {
                                let after = f.quota.snapshot(DB).unwrap();
                                prop_assert!(
                                    after.used_bytes + after.pending_bytes <= after.quota_bytes
                                );
                                created.push((txn, bytes));
                            }
                            Err(TxnError::QuotaExceeded { .. }) => {
                                prop_assert!(
                                    before.used_bytes + before.pending_bytes + bytes
                                        > before.quota_bytes
                                );
                            }
                            Err(e) => prop_assert!(false, "unexpected begin error: {e}"),
                        }
                    }
                    Op::Commit(index) if !created.is_empty() => {
                        let (txn, bytes) = created.remove(index % created.len());
                        f.manager.commit(txn, manifest()).unwrap();
                        committed.push((txn, bytes));
                    }
                    Op::Abort(index) if !created.is_empty() => {
                        let (txn, _) = created.remove(index % created.len());
                        f.manager.abort(txn, "client gave up").unwrap();
                    }
                    Op::Publish(index) if !committed.is_empty() => {
                        let (txn, _) = committed.remove(index % committed.len());
                        let progress = runtime.block_on(f.manager.publish_once(txn)).unwrap();
                        prop_assert_eq!(progress, PublishProgress::Visible);
                    }
                    Op::Reconcile(used) => {
                        f.manager.reconcile_quota(DB, used);
                    }
                    Op::Commit(_) | Op::Abort(_) | Op::Publish(_) => {}
                }

                let live: u64 = created.iter().chain(&committed).map(|(_, b)| b).sum();
                prop_assert_eq!(f.quota.snapshot(DB).unwrap().pending_bytes, live);
            }
        }
    }
}
