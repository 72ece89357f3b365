// Leader-Only Daemon Scheduler
//
// Periodic maintenance runs only on the leader. Leadership is an injected
// capability checked before every run; a follower's run is a no-op, not an
// error. Each task recomputes from authoritative state on every run, so a
// run cut short by a leadership change leaves nothing half-applied.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug_span, Instrument};

use crate::replay::ReplayError;
use crate::schema::SchemaError;
use crate::txn::TxnError;

pub mod tasks;

pub use tasks::{CompactionTask, PublishRetryTask, QuotaReconcileTask, SchemaJobTask, TxnCleanupTask};

/// "Am I the leader right now?"
pub trait Leadership: Send + Sync + fmt::Debug {
    fn is_leader(&self) -> bool;
}

/// Leadership flipped by whatever election the host process runs.
#[derive(Debug, Default)]
pub struct LeaderFlag(AtomicBool);

impl LeaderFlag {
    pub fn new(leader: bool) -> Self {
        Self(AtomicBool::new(leader))
    }

    pub fn set(&self, leader: bool) {
        let was = self.0.swap(leader, Ordering::SeqCst);
        if was != leader {
            tracing::info!(leader, "leadership changed");
        }
    }
}

impl Leadership for LeaderFlag {
    fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskId {
    QuotaReconcile,
    PublishRetry,
    TxnCleanup,
    SchemaJobs,
    LogCompaction,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::QuotaReconcile => "quota_reconcile",
            Self::PublishRetry => "publish_retry",
            Self::TxnCleanup => "txn_cleanup",
            Self::SchemaJobs => "schema_jobs",
            Self::LogCompaction => "log_compaction",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task {0} is not registered")]
    UnknownTask(TaskId),

    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Replay(#[from] ReplayError),
}

/// A periodic maintenance task.
#[async_trait]
pub trait DaemonTask: Send + Sync {
    fn id(&self) -> TaskId;

    fn interval(&self) -> Duration;

    /// Optional signal that makes the task run before its next tick.
    fn wakeup(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Run once. Returns the number of records acted on.
    async fn run(&self) -> Result<usize, TaskError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Ran(usize),
    NotLeader,
}

pub struct DaemonScheduler {
    leadership: Arc<dyn Leadership>,
    tasks: BTreeMap<TaskId, Arc<dyn DaemonTask>>,
}

impl fmt::Debug for DaemonScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonScheduler")
            .field("leadership", &self.leadership)
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DaemonScheduler {
    pub fn new(leadership: Arc<dyn Leadership>) -> Self {
        Self {
            leadership,
            tasks: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, task: impl DaemonTask + 'static) {
        self.tasks.insert(task.id(), Arc::new(task));
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.keys().copied().collect()
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    /// Run `id` once if this process is the leader.
    pub async fn run_if_leader(&self, id: TaskId) -> Result<RunOutcome, TaskError> {
        let task = self.tasks.get(&id).ok_or(TaskError::UnknownTask(id))?;
        if !self.leadership.is_leader() {
            tracing::trace!(task = %id, "not leader, skipping run");
            return Ok(RunOutcome::NotLeader);
        }
        Ok(RunOutcome::Ran(task.run().await?))
    }

    /// Start one loop per task. Errors are logged and never stop a loop.
    pub fn spawn(self: Arc<Self>) -> DaemonHandle {
        let (shutdown, _) = watch::channel(false);
        let handles = self
            .tasks
            .values()
            .map(|task| {
                let scheduler = Arc::clone(&self);
                let task = Arc::clone(task);
                let mut stop = shutdown.subscribe();
                tokio::spawn(async move {
                    let id = task.id();
                    let wakeup = task.wakeup();
                    let mut interval = interval_with_skipped_ticks(task.interval());
                    loop {
                        tokio::select! {
                            _ = stop.changed() => break,
                            _ = interval.tick() => {}
                            _ = notified(wakeup.as_deref()) => {}
                        }
                        let span = debug_span!("daemon_task", task = %id);
                        match scheduler.run_if_leader(id).instrument(span).await {
                            Ok(RunOutcome::Ran(n)) if n > 0 => {
                                tracing::debug!(task = %id, records = n, "daemon task ran");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(task = %id, error = %e, "daemon task failed"),
                        }
                    }
                    tracing::debug!(task = %id, "daemon task stopped");
                })
            })
            .collect();
        DaemonHandle { shutdown, handles }
    }
}

/// Running daemon loops.
#[derive(Debug)]
pub struct DaemonHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl DaemonHandle {
    /// Stop every loop and wait for in-progress runs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "daemon task panicked");
            }
        }
    }
}

/// Intervals skip missed ticks instead of bursting to catch up.
fn interval_with_skipped_ticks(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn notified(wakeup: Option<&Notify>) {
    match wakeup {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}
