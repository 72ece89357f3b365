// Quota Ledger
//
// Per-database storage accounting. Admission reserves an estimate as
// pending; `used` is only ever replaced wholesale by reconciliation from an
// authoritative measurement, never accumulated incrementally.
//
// Each database entry has its own lock, so admission on one database never
// waits on another.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::ids::{DbId, TxnId};

#[derive(Debug)]
struct LedgerEntry {
    quota: u64,
    used: u64,
    /// Outstanding reservations keyed by the owning transaction.
    pending: BTreeMap<TxnId, u64>,
}

impl LedgerEntry {
    fn new(quota: u64) -> Self {
        Self {
            quota,
            used: 0,
            pending: BTreeMap::new(),
        }
    }

    fn pending_bytes(&self) -> u64 {
        self.pending
            .values()
            .fold(0u64, |acc, bytes| acc.saturating_add(*bytes))
    }
}

/// Point-in-time view of one database's ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub quota_bytes: u64,
    pub used_bytes: u64,
    pub pending_bytes: u64,
    pub reservations: usize,
}

impl QuotaSnapshot {
    pub fn available_bytes(&self) -> u64 {
        self.quota_bytes
            .saturating_sub(self.used_bytes.saturating_add(self.pending_bytes))
    }
}

/// Result of one reconciliation pass over a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub previous_used: u64,
    pub used: u64,
    pub cleared_reservations: usize,
}

#[derive(Debug)]
pub struct QuotaLedger {
    entries: RwLock<HashMap<DbId, Arc<Mutex<LedgerEntry>>>>,
    default_quota: u64,
}

impl QuotaLedger {
    pub fn new(default_quota: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_quota,
        }
    }

    fn entry(&self, db: DbId) -> Arc<Mutex<LedgerEntry>> {
        if let Some(entry) = self.entries.read().get(&db) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry(db)
                .or_insert_with(|| Arc::new(Mutex::new(LedgerEntry::new(self.default_quota)))),
        )
    }

    /// Create an entry for `db` with `quota` unless one already exists.
    pub fn register(&self, db: DbId, quota: u64) {
        self.entries
            .write()
            .entry(db)
            .or_insert_with(|| Arc::new(Mutex::new(LedgerEntry::new(quota))));
    }

    /// Change the hard limit. Existing reservations and usage are untouched;
    /// lowering the limit only affects future admissions.
    pub fn set_quota(&self, db: DbId, quota: u64) {
        let entry = self.entry(db);
        let mut entry = entry.lock();
        tracing::info!(%db, old = entry.quota, new = quota, "quota adjusted");
        entry.quota = quota;
    }

    /// Reserve `bytes` for `owner` if `used + pending + bytes <= quota`.
    ///
    /// A second admission for the same owner is a no-op that reports the
    /// original decision.
    pub fn admit(&self, db: DbId, owner: TxnId, bytes: u64) -> bool {
        let entry = self.entry(db);
        let mut entry = entry.lock();
        if entry.pending.contains_key(&owner) {
            return true;
        }
        let pending = entry.pending_bytes();
        let demand = entry.used.saturating_add(pending).saturating_add(bytes);
        if demand > entry.quota {
            tracing::info!(
                %db,
                txn = %owner,
                bytes,
                used = entry.used,
                pending,
                quota = entry.quota,
                "quota admission rejected"
            );
            return false;
        }
        entry.pending.insert(owner, bytes);
        tracing::info!(
            %db,
            txn = %owner,
            bytes,
            used = entry.used,
            pending = pending + bytes,
            quota = entry.quota,
            "quota admission granted"
        );
        true
    }

    /// Re-create a reservation recovered from the log, bypassing the limit.
    pub(crate) fn restore_reservation(&self, db: DbId, owner: TxnId, bytes: u64) {
        self.entry(db).lock().pending.insert(owner, bytes);
    }

    /// Free the reservation held by `owner`. Returns the released bytes.
    pub fn release(&self, db: DbId, owner: TxnId) -> u64 {
        let entry = self.entry(db);
        let released = entry.lock().pending.remove(&owner).unwrap_or(0);
        if released > 0 {
            tracing::debug!(%db, txn = %owner, bytes = released, "quota reservation released");
        }
        released
    }

    /// Replace `used` with a fresh measurement and drop reservations whose
    /// owner is no longer live.
    ///
    /// Both changes happen under the entry lock, so an admission sees either
    /// the old or the new ledger, never a mix.
    pub fn reconcile(
        &self,
        db: DbId,
        true_used: u64,
        is_live: impl Fn(TxnId) -> bool,
    ) -> Reconciliation {
        let entry = self.entry(db);
        let mut entry = entry.lock();
        let previous_used = entry.used;
        let before = entry.pending.len();
        entry.pending.retain(|owner, _| is_live(*owner));
        entry.used = true_used;
        let cleared = before - entry.pending.len();
        if cleared > 0 {
            tracing::warn!(%db, cleared, "cleared stale quota reservations");
        }
        tracing::debug!(%db, previous_used, used = true_used, "quota reconciled");
        Reconciliation {
            previous_used,
            used: true_used,
            cleared_reservations: cleared,
        }
    }

    pub fn snapshot(&self, db: DbId) -> Option<QuotaSnapshot> {
        let entry = Arc::clone(self.entries.read().get(&db)?);
        let entry = entry.lock();
        Some(QuotaSnapshot {
            quota_bytes: entry.quota,
            used_bytes: entry.used,
            pending_bytes: entry.pending_bytes(),
            reservations: entry.pending.len(),
        })
    }
}
