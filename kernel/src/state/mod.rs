// Lifecycle States
//
// Coarse lifecycle of load transactions and schema-change jobs. The
// per-record reducers (`Transaction::apply`, `SchemaJob::apply`) decide
// which log events move a record between these states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a load transaction.
///
/// `Created → Committed → Visible`, with `Aborted` reachable from `Created`
/// and from `Committed` until publish starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnState {
    /// Admitted, data is being written.
    Created,

    /// Durably committed, publish to replicas pending or in progress.
    Committed,

    /// Every partition reached quorum; readers see the data.
    Visible,

    /// Rolled back. Nothing becomes visible.
    Aborted,
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Visible | Self::Aborted)
    }

    /// Still holds a quota reservation and can block a schema fence.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Committed => "COMMITTED",
            Self::Visible => "VISIBLE",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a schema-change job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Accepted, not yet fenced.
    Pending,

    /// Fenced; waiting for earlier transactions on the table to finish.
    WaitingFence,

    /// Replicas are applying the mutation.
    Running,

    Finished,

    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::WaitingFence => "WAITING_FENCE",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Errors produced during state transitions.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
}
