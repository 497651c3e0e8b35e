//! Phase completion barrier.

use stampede_env::SimulatorAddress;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use super::test_phase::TestPhase;

/// How a barrier wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Every expected participant acknowledged (or was released)
    Completed,
    /// The deadline passed; these participants never acknowledged
    TimedOut { missing: Vec<SimulatorAddress> },
    /// The abort condition became true while waiting
    Aborted,
}

type Key = (String, TestPhase);

/// Tracks which workers still owe a completion acknowledgement for a
/// (test, phase) pair.
///
/// Acknowledgements arrive on router tasks while the orchestrator waits,
/// so the wait never blocks their delivery.
#[derive(Default)]
pub struct PhaseBarrier {
    pending: Mutex<HashMap<Key, BTreeSet<SimulatorAddress>>>,
    gone: Mutex<HashSet<SimulatorAddress>>,
    notify: Notify,
}

impl PhaseBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the workers that must acknowledge the phase.
    ///
    /// Workers already known to be gone are left out.
    pub fn expect(
        &self,
        test_id: &str,
        phase: TestPhase,
        participants: impl IntoIterator<Item = SimulatorAddress>,
    ) {
        let gone = self.gone.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let expected: BTreeSet<SimulatorAddress> = participants
            .into_iter()
            .filter(|p| !gone.contains(p))
            .collect();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((test_id.to_string(), phase), expected);
    }

    /// Records a completion. Returns false if the worker was not expected.
    pub fn acknowledge(&self, test_id: &str, phase: TestPhase, participant: SimulatorAddress) -> bool {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&(test_id.to_string(), phase))
            .map_or(false, |set| set.remove(&participant));
        if removed {
            self.notify.notify_waiters();
        } else {
            tracing::debug!(test_id, %phase, %participant, "unexpected phase acknowledgement");
        }
        removed
    }

    /// Stops waiting for one worker in one phase, e.g. after its start request failed.
    pub fn withdraw(&self, test_id: &str, phase: TestPhase, participant: SimulatorAddress) {
        if let Some(set) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&(test_id.to_string(), phase))
        {
            set.remove(&participant);
        }
        self.notify.notify_waiters();
    }

    /// Marks a worker as gone: it is dropped from every pending and future phase.
    pub fn release(&self, participant: SimulatorAddress) {
        self.gone
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(participant);
        for set in self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values_mut()
        {
            set.remove(&participant);
        }
        tracing::info!(%participant, "participant released from barriers");
        self.notify.notify_waiters();
    }

    pub fn is_gone(&self, participant: &SimulatorAddress) -> bool {
        self.gone
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(participant)
    }

    /// Workers that have not acknowledged yet.
    pub fn missing(&self, test_id: &str, phase: TestPhase) -> Vec<SimulatorAddress> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(test_id.to_string(), phase))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Forgets a (test, phase) pair.
    pub fn clear(&self, test_id: &str, phase: TestPhase) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(test_id.to_string(), phase));
    }

    /// Waits until every expected worker acknowledged, the deadline passes,
    /// or `is_aborted` returns true after a change on `abort`.
    pub async fn wait(
        &self,
        test_id: &str,
        phase: TestPhase,
        deadline: Instant,
        abort: &mut watch::Receiver<u64>,
        is_aborted: impl Fn() -> bool,
    ) -> BarrierOutcome {
        let mut abort_open = true;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.missing(test_id, phase).is_empty() {
                return BarrierOutcome::Completed;
            }
            if is_aborted() {
                return BarrierOutcome::Aborted;
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = abort.changed(), if abort_open => {
                    if changed.is_err() {
                        abort_open = false;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let missing = self.missing(test_id, phase);
                    if missing.is_empty() {
                        return BarrierOutcome::Completed;
                    }
                    return BarrierOutcome::TimedOut { missing };
                }
            }
        }
    }
}
