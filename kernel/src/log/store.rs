// State Log Storage Abstraction
//
// Defines the durability contract for the authoritative state log.
// Implementations may persist to local disk, a replicated journal, etc.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{Checkpoint, LogError, LogRecord};

/// Everything needed to rebuild state: the last checkpoint and the records
/// that follow it, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredState {
    pub checkpoint: Option<Checkpoint>,
    pub records: Vec<LogRecord>,
}

/// Storage backend for the state log.
///
/// Properties required from implementations:
/// - Append-only
/// - Ordered
/// - Durable once `append` returns `Ok`
///
/// Implementations MUST NOT:
/// - Reorder records
/// - Mutate existing records
/// - Allow sequence gaps
pub trait StateLogStore: Send + std::fmt::Debug {
    /// Append a record to storage.
    ///
    /// Implementations must enforce `record.seq == last_seq + 1`.
    fn append(&mut self, record: &LogRecord) -> Result<(), LogError>;

    /// Load the checkpoint and all records after it.
    fn load(&self) -> Result<StoredState, LogError>;

    /// Persist `checkpoint` and discard records with `seq <= checkpoint.last_seq`.
    fn install_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), LogError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: StoredState,
    fail_appends: bool,
    /// Appends still allowed before every append fails.
    fail_after: Option<usize>,
}

/// Volatile store. Clones share the same contents, so a test can keep a
/// handle, drop the frontend and reopen on the same "disk".
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl InMemoryLogStore {
    /// Make every subsequent append fail until reset.
    pub fn fail_appends(&self, fail: bool) {
        let mut inner = self.inner.lock();
        inner.fail_appends = fail;
        inner.fail_after = None;
    }

    /// Let the next `successes` appends through, then fail until reset.
    pub fn fail_appends_after(&self, successes: usize) {
        self.inner.lock().fail_after = Some(successes);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().state.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateLogStore for InMemoryLogStore {
    fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if inner.fail_appends || inner.fail_after == Some(0) {
            return Err(LogError::Unavailable("injected append failure".into()));
        }
        let last = inner
            .state
            .records
            .last()
            .map(|r| r.seq)
            .or_else(|| inner.state.checkpoint.as_ref().map(|c| c.last_seq))
            .unwrap_or(0);
        if record.seq != last + 1 {
            return Err(LogError::VersionConflict {
                expected: last + 1,
                actual: record.seq,
            });
        }
        inner.state.records.push(record.clone());
        if let Some(remaining) = inner.fail_after.as_mut() {
            *remaining -= 1;
        }
        Ok(())
    }

    fn load(&self) -> Result<StoredState, LogError> {
        Ok(self.inner.lock().state.clone())
    }

    fn install_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        inner
            .state
            .records
            .retain(|record| record.seq > checkpoint.last_seq);
        inner.state.checkpoint = Some(checkpoint.clone());
        Ok(())
    }
}
