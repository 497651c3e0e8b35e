//! Outstanding-request bookkeeping.

use crate::error::TransportError;
use crate::protocol::Reply;
use dashmap::DashMap;
use stampede_env::SimulatorAddress;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

type Outcome = Result<Reply, TransportError>;

struct Pending {
    tx: oneshot::Sender<Outcome>,
    destination: SimulatorAddress,
    deadline: Instant,
    timeout: Duration,
}

/// Promises of one router, keyed by correlation id.
///
/// Removing an entry is the single point where a promise is resolved, so
/// each promise is resolved at most once whichever of answer, timeout or
/// sweep gets there first.
#[derive(Default)]
pub struct PromiseTable {
    pending: DashMap<u64, Pending>,
}

impl PromiseTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        self: &Arc<Self>,
        correlation_id: u64,
        destination: SimulatorAddress,
        timeout: Duration,
    ) -> Promise {
        let (tx, rx) = oneshot::channel();
        let created = Instant::now();
        self.pending.insert(
            correlation_id,
            Pending {
                tx,
                destination,
                deadline: created + timeout,
                timeout,
            },
        );
        Promise {
            correlation_id,
            destination,
            created,
            timeout,
            rx,
            table: Arc::clone(self),
        }
    }

    /// Resolves a promise. Returns false if it was already resolved or expired.
    pub fn complete(&self, correlation_id: u64, outcome: Outcome) -> bool {
        match self.pending.remove(&correlation_id) {
            Some((_, pending)) => pending.tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drops a promise without resolving it.
    pub fn remove(&self, correlation_id: u64) -> bool {
        self.pending.remove(&correlation_id).is_some()
    }

    /// Fails every promise whose deadline has passed.
    pub fn expire(&self, now: Instant) -> usize {
        let overdue: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0;
        for correlation_id in overdue {
            if let Some((_, pending)) = self.pending.remove(&correlation_id) {
                tracing::debug!(
                    correlation_id,
                    destination = %pending.destination,
                    "promise expired"
                );
                let _ = pending.tx.send(Err(TransportError::Timeout {
                    correlation_id,
                    after: pending.timeout,
                }));
                expired += 1;
            }
        }
        expired
    }

    /// Fails every outstanding promise with [`TransportError::Closed`].
    pub fn fail_all(&self) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.complete(*id, Err(TransportError::Closed)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A pending response to one request.
pub struct Promise {
    correlation_id: u64,
    destination: SimulatorAddress,
    created: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Outcome>,
    table: Arc<PromiseTable>,
}

impl Promise {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn destination(&self) -> SimulatorAddress {
        self.destination
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Waits for the answer or the deadline, whichever comes first.
    ///
    /// On timeout the promise is removed, so a later answer is dropped.
    pub async fn wait(self) -> Result<Reply, TransportError> {
        let deadline = self.created + self.timeout;
        match tokio::time::timeout_at(deadline, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.table.remove(self.correlation_id);
                Err(TransportError::Timeout {
                    correlation_id: self.correlation_id,
                    after: self.timeout,
                })
            }
        }
    }
}
