// Storage Usage Measurement
//
// Authoritative used-bytes figure for a database: the physical size of
// every committed partition, summed by the storage layer.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::ids::DbId;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("usage of {0} is unavailable: {1}")]
    Unavailable(DbId, String),
}

pub trait UsageSource: Send + Sync {
    fn used_bytes(&self, db: DbId) -> Result<u64, UsageError>;
}

#[derive(Debug, Default)]
pub struct InMemoryUsage {
    used: Mutex<HashMap<DbId, Result<u64, String>>>,
}

impl InMemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, db: DbId, bytes: u64) {
        self.used.lock().insert(db, Ok(bytes));
    }

    /// Make the next measurements of `db` fail.
    pub fn fail(&self, db: DbId, reason: &str) {
        self.used.lock().insert(db, Err(reason.into()));
    }
}

impl UsageSource for InMemoryUsage {
    fn used_bytes(&self, db: DbId) -> Result<u64, UsageError> {
        match self.used.lock().get(&db) {
            Some(Ok(bytes)) => Ok(*bytes),
            Some(Err(reason)) => Err(UsageError::Unavailable(db, reason.clone())),
            None => Ok(0),
        }
    }
}
