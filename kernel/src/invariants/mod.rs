// Invariant Framework
//
// Invariants are pure rules that must hold across every transaction
// transition. The manager evaluates them before a transition is persisted,
// and replay evaluates them again, so a violation is caught before it can
// reach the log or survive a restart.

use crate::config::QuorumPolicy;
use crate::log::StateEvent;
use crate::state::TxnState;
use crate::txn::Transaction;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(
        &self,
        previous: &Transaction,
        event: &StateEvent,
        next: &Transaction,
    ) -> InvariantResult;
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl std::fmt::Debug for InvariantEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.invariants.iter().map(|i| i.name()))
            .finish()
    }
}

impl InvariantEngine {
    /// Create a new invariant engine.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine preloaded with the transaction lifecycle rules.
    pub fn with_defaults(policy: QuorumPolicy) -> Self {
        let mut engine = Self::new();
        engine.register(NoAbortAfterPublish);
        engine.register(PartitionQuorum { policy });
        engine.register(AtomicVisibility);
        engine.register(FrozenManifest);
        engine
    }

    /// Register an invariant.
    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        previous: &Transaction,
        event: &StateEvent,
        next: &Transaction,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(previous, event, next) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, thiserror::Error)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}

/// Publish is the point of no return: only a forced administrative cancel
/// may abort once it has started, and only before any replica acked.
pub struct NoAbortAfterPublish;

impl Invariant for NoAbortAfterPublish {
    fn name(&self) -> &'static str {
        "no-abort-after-publish"
    }

    fn validate(
        &self,
        previous: &Transaction,
        event: &StateEvent,
        next: &Transaction,
    ) -> InvariantResult {
        if next.state != TxnState::Aborted || !previous.publish_started() {
            return InvariantResult::Pass;
        }
        let forced = matches!(event, StateEvent::TxnAborted { forced: true, .. });
        if !forced {
            InvariantResult::Fail(format!("{} aborted after publish started", next.id))
        } else if previous.manifest.any_acked() {
            InvariantResult::Fail(format!("{} cancelled after a replica acked", next.id))
        } else {
            InvariantResult::Pass
        }
    }
}

/// A partition is marked visible only once its quorum has acked.
pub struct PartitionQuorum {
    pub policy: QuorumPolicy,
}

impl Invariant for PartitionQuorum {
    fn name(&self) -> &'static str {
        "partition-quorum"
    }

    fn validate(
        &self,
        _previous: &Transaction,
        _event: &StateEvent,
        next: &Transaction,
    ) -> InvariantResult {
        match next
            .manifest
            .partitions
            .iter()
            .find(|p| p.visible && !p.quorum_met(self.policy))
        {
            Some(p) => InvariantResult::Fail(format!(
                "{} visible with {}/{} acks",
                p.partition,
                p.acked_count(),
                p.replicas.len()
            )),
            None => InvariantResult::Pass,
        }
    }
}

/// No partial visibility: VISIBLE requires every partition published.
pub struct AtomicVisibility;

impl Invariant for AtomicVisibility {
    fn name(&self) -> &'static str {
        "atomic-visibility"
    }

    fn validate(
        &self,
        _previous: &Transaction,
        _event: &StateEvent,
        next: &Transaction,
    ) -> InvariantResult {
        if next.state == TxnState::Visible && !next.manifest.all_visible() {
            InvariantResult::Fail(format!("{} visible before every partition", next.id))
        } else {
            InvariantResult::Pass
        }
    }
}

/// The set of partitions and replicas is fixed at commit.
pub struct FrozenManifest;

impl Invariant for FrozenManifest {
    fn name(&self) -> &'static str {
        "frozen-manifest"
    }

    fn validate(
        &self,
        previous: &Transaction,
        _event: &StateEvent,
        next: &Transaction,
    ) -> InvariantResult {
        if previous.state != TxnState::Committed {
            return InvariantResult::Pass;
        }
        let layout = |txn: &Transaction| {
            txn.manifest
                .partitions
                .iter()
                .map(|p| (p.partition, p.replicas.clone()))
                .collect::<Vec<_>>()
        };
        if layout(previous) != layout(next) {
            InvariantResult::Fail(format!("manifest of {} changed after commit", next.id))
        } else {
            InvariantResult::Pass
        }
    }
}
