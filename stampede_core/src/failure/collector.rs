//! Coordinator-side failure bookkeeping for a run.

use super::types::{FailureRecord, FailureType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;

/// Counts and listing of a run's failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub total: usize,
    pub critical: usize,
    pub by_type: BTreeMap<FailureType, usize>,
    pub records: Vec<FailureRecord>,
}

/// Collects failures for one run and classifies them against the run's
/// tolerable set.
///
/// Any record whose type is not tolerable is critical. Waiters subscribe to
/// the critical count to abort promptly.
pub struct FailureCollector {
    tolerable: HashSet<FailureType>,
    /// Records with their critical flag, in arrival order
    records: Mutex<Vec<(FailureRecord, bool)>>,
    critical: watch::Sender<u64>,
}

impl FailureCollector {
    pub fn new(tolerable: impl IntoIterator<Item = FailureType>) -> Self {
        let (critical, _) = watch::channel(0);
        Self {
            tolerable: tolerable.into_iter().collect(),
            records: Mutex::new(Vec::new()),
            critical,
        }
    }

    pub fn is_tolerable(&self, failure_type: FailureType) -> bool {
        self.tolerable.contains(&failure_type)
    }

    /// Stores a record, classified against the tolerable set. Returns true
    /// if it is critical.
    pub fn record(&self, record: FailureRecord) -> bool {
        let critical = !self.is_tolerable(record.failure_type);
        self.record_as(record, critical)
    }

    /// Stores a record with an explicit classification.
    pub fn record_as(&self, record: FailureRecord, critical: bool) -> bool {
        if critical {
            tracing::error!(failure = %record, "critical failure");
        } else {
            tracing::info!(failure = %record, "tolerated failure");
        }

        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((record, critical));
        if critical {
            self.critical.send_modify(|count| *count += 1);
        }
        critical
    }

    /// First critical record affecting the test, if any.
    pub fn first_critical(&self, test_id: &str) -> Option<FailureRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(r, critical)| *critical && r.affects_test(test_id))
            .map(|(r, _)| r.clone())
    }

    pub fn has_critical(&self, test_id: &str) -> bool {
        self.first_critical(test_id).is_some()
    }

    /// Watches the number of critical records.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.critical.subscribe()
    }

    pub fn critical_count(&self) -> u64 {
        *self.critical.borrow()
    }

    pub fn records(&self) -> Vec<FailureRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn summary(&self) -> FailureSummary {
        let entries = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut by_type = BTreeMap::new();
        let mut critical = 0;
        let mut records = Vec::with_capacity(entries.len());
        for (record, is_critical) in entries {
            *by_type.entry(record.failure_type).or_insert(0) += 1;
            if is_critical {
                critical += 1;
            }
            records.push(record);
        }
        FailureSummary {
            total: records.len(),
            critical,
            by_type,
            records,
        }
    }
}

/// Slot holding the collector of the run in progress, if any.
#[derive(Default)]
pub struct ActiveCollector {
    slot: RwLock<Option<Arc<FailureCollector>>>,
    unattributed: AtomicU64,
}

impl ActiveCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, collector: Arc<FailureCollector>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(collector);
    }

    pub fn clear(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn get(&self) -> Option<Arc<FailureCollector>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hands the record to the active collector. Records arriving between
    /// runs are logged and counted.
    pub fn record(&self, record: FailureRecord) -> Option<bool> {
        match self.get() {
            Some(collector) => Some(collector.record(record)),
            None => {
                self.unattributed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(failure = %record, "failure outside of a run");
                None
            }
        }
    }

    /// Records that arrived while no run was active.
    pub fn unattributed(&self) -> u64 {
        self.unattributed.load(Ordering::Relaxed)
    }
}
