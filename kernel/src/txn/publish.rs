// Publish Driver
//
// Moves COMMITTED transactions to VISIBLE. Publish starts by persisting a
// publish version, the point after which abort is refused. Replica commands
// go out in parallel, bounded by the RPC timeout; every ack is persisted so
// a restart resumes with only the replicas that never confirmed.

use std::time::Duration;

use futures::future::join_all;

use super::{TransactionManager, TxnError};
use crate::adapters::ReplicaError;
use crate::backoff::Backoff;
use crate::clock::InFlight;
use crate::ids::{PartitionId, ReplicaId, TxnId};
use crate::log::StateEvent;
use crate::state::TxnState;

/// Outcome of one publish round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishProgress {
    Visible,
    /// Partitions still short of their quorum.
    Pending { remaining: usize },
    /// Cancelled while the round was in flight.
    Aborted,
}

/// Retry schedule of a transaction awaiting publish.
#[derive(Debug)]
pub(crate) struct Retry {
    backoff: Backoff,
    next_attempt_ms: u64,
}

impl TransactionManager {
    /// Queue `txn_id` for the publish daemon and wake it.
    pub(crate) fn schedule_publish(&self, txn_id: TxnId) {
        let (initial, max) = self.config.publish_backoff();
        self.retries.lock().entry(txn_id).or_insert(Retry {
            backoff: Backoff::new(initial, max),
            next_attempt_ms: 0,
        });
        self.publish_wakeup.notify_one();
    }

    /// Signalled whenever a transaction becomes ready to publish.
    pub fn publish_wakeup(&self) -> std::sync::Arc<tokio::sync::Notify> {
        std::sync::Arc::clone(&self.publish_wakeup)
    }

    /// Transactions waiting for publish.
    pub fn pending_publish(&self) -> Vec<TxnId> {
        let mut pending: Vec<_> = self.retries.lock().keys().copied().collect();
        pending.sort();
        pending
    }

    /// Run one publish round for `txn_id`.
    pub async fn publish_once(&self, txn_id: TxnId) -> Result<PublishProgress, TxnError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight, txn_id) else {
            return self.progress(txn_id);
        };

        let (version, work) = {
            let record = self.record(txn_id)?;
            let mut txn = record.lock();
            match txn.state {
                TxnState::Visible => return Ok(PublishProgress::Visible),
                TxnState::Aborted => return Ok(PublishProgress::Aborted),
                TxnState::Created => {
                    return Err(TxnError::InvalidState {
                        txn: txn_id,
                        state: txn.state,
                        operation: "publish",
                    })
                }
                TxnState::Committed => {}
            }
            let version = match txn.publish_version {
                Some(version) => version,
                None => {
                    let version = self.publish_versions.tick();
                    self.transition(&mut txn, StateEvent::PublishStarted { txn_id, version })?;
                    tracing::info!(txn = %txn_id, version, "publish started");
                    version
                }
            };
            let work: Vec<(PartitionId, ReplicaId)> = txn
                .manifest
                .partitions
                .iter()
                .filter(|p| !p.visible)
                .flat_map(|p| {
                    p.pending_replicas()
                        .into_iter()
                        .map(move |replica| (p.partition, replica))
                })
                .collect();
            (version, work)
        };

        let timeout = self.config.replica_rpc_timeout();
        let results = join_all(work.into_iter().map(|(partition, replica)| async move {
            let outcome = self.send(partition, version, replica, timeout).await;
            (partition, replica, outcome)
        }))
        .await;

        let record = self.record(txn_id)?;
        let mut txn = record.lock();
        if txn.state != TxnState::Committed {
            return Ok(match txn.state {
                TxnState::Visible => PublishProgress::Visible,
                _ => PublishProgress::Aborted,
            });
        }

        for (partition, replica, outcome) in results {
            match outcome {
                Ok(()) => {
                    let acked = txn
                        .manifest
                        .partition(partition)
                        .is_some_and(|p| p.is_acked(replica));
                    if !acked {
                        self.transition(
                            &mut txn,
                            StateEvent::ReplicaAcked {
                                txn_id,
                                partition,
                                replica,
                            },
                        )?;
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        txn = %txn_id,
                        %partition,
                        %replica,
                        error = %e,
                        "publish attempt failed, will retry"
                    );
                }
            }
        }

        let policy = self.config.publish_quorum;
        let ready: Vec<PartitionId> = txn
            .manifest
            .partitions
            .iter()
            .filter(|p| !p.visible && p.quorum_met(policy))
            .map(|p| p.partition)
            .collect();
        for partition in ready {
            self.transition(&mut txn, StateEvent::PartitionVisible { txn_id, partition })?;
        }

        if !txn.manifest.all_visible() {
            let remaining = txn.manifest.partitions.iter().filter(|p| !p.visible).count();
            return Ok(PublishProgress::Pending { remaining });
        }

        self.transition(
            &mut txn,
            StateEvent::TxnVisible {
                txn_id,
                visible_at_ms: self.time.now_ms(),
            },
        )?;
        let db = txn.db;
        drop(txn);

        self.quota.release(db, txn_id);
        self.retries.lock().remove(&txn_id);
        tracing::info!(txn = %txn_id, version, "transaction visible");
        Ok(PublishProgress::Visible)
    }

    async fn send(
        &self,
        partition: PartitionId,
        version: u64,
        replica: ReplicaId,
        timeout: Duration,
    ) -> Result<(), ReplicaError> {
        match tokio::time::timeout(
            timeout,
            self.replicas.publish_partition(partition, version, replica),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ReplicaError::Timeout(replica)),
        }
    }

    fn progress(&self, txn_id: TxnId) -> Result<PublishProgress, TxnError> {
        let txn = self
            .transaction(txn_id)
            .ok_or(TxnError::NotFound(txn_id))?;
        Ok(match txn.state {
            TxnState::Visible => PublishProgress::Visible,
            TxnState::Aborted => PublishProgress::Aborted,
            _ => PublishProgress::Pending {
                remaining: txn.manifest.partitions.iter().filter(|p| !p.visible).count(),
            },
        })
    }

    /// Drive publish until the transaction is VISIBLE or cancelled.
    /// Failed rounds are retried with exponential backoff, indefinitely.
    pub async fn publish(&self, txn_id: TxnId) -> Result<TxnState, TxnError> {
        let (initial, max) = self.config.publish_backoff();
        let mut backoff = Backoff::new(initial, max);
        loop {
            match self.publish_once(txn_id).await? {
                PublishProgress::Visible => return Ok(TxnState::Visible),
                PublishProgress::Aborted => return Ok(TxnState::Aborted),
                PublishProgress::Pending { remaining } => {
                    let delay = backoff.fail(&mut rand::thread_rng());
                    tracing::debug!(txn = %txn_id, remaining, ?delay, "publish incomplete");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One pass of the publish daemon: a round for every transaction whose
    /// retry is due. Returns how many became visible.
    pub async fn publish_pending(&self) -> usize {
        let now = self.time.now_ms();
        let due: Vec<TxnId> = self
            .retries
            .lock()
            .iter()
            .filter(|(_, retry)| retry.next_attempt_ms <= now)
            .map(|(txn_id, _)| *txn_id)
            .collect();
        if due.is_empty() {
            return 0;
        }

        let outcomes = join_all(
            due.into_iter()
                .map(|txn_id| async move { (txn_id, self.publish_once(txn_id).await) }),
        )
        .await;

        let mut visible = 0;
        let mut rng = rand::thread_rng();
        let mut retries = self.retries.lock();
        for (txn_id, outcome) in outcomes {
            match outcome {
                Ok(PublishProgress::Visible) => {
                    visible += 1;
                    retries.remove(&txn_id);
                }
                Ok(PublishProgress::Aborted) | Err(TxnError::NotFound(_)) => {
                    retries.remove(&txn_id);
                }
                Ok(PublishProgress::Pending { .. }) | Err(_) => {
                    if let Err(e) = &outcome {
                        tracing::error!(txn = %txn_id, error = %e, "publish round failed");
                    }
                    if let Some(retry) = retries.get_mut(&txn_id) {
                        let delay = retry.backoff.fail(&mut rng);
                        retry.next_attempt_ms = now + delay.as_millis() as u64;
                        if retry.backoff.failures() % 10 == 0 {
                            tracing::warn!(
                                txn = %txn_id,
                                attempts = retry.backoff.failures(),
                                "publish still incomplete"
                            );
                        }
                    }
                }
            }
        }
        visible
    }
}
