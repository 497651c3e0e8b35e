//! Ordered notification queue toward a fixed destination.

use super::Router;
use crate::error::TransportError;
use crate::protocol::Operation;
use stampede_env::{RuntimeContext, SimulatorAddress};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sends fire-and-forget operations to one destination in submission order.
///
/// Failure records and phase completions from a worker share one queue, so
/// the coordinator always sees a test's failure before the completion that
/// follows it. `send` never blocks, which lets synchronous code (failure
/// sinks, workload threads) enqueue.
#[derive(Clone)]
pub struct Upstream {
    destination: SimulatorAddress,
    tx: mpsc::UnboundedSender<Operation>,
}

impl Upstream {
    /// Spawns the drain task on the router's context.
    pub fn spawn<Ctx: RuntimeContext>(router: &Arc<Router<Ctx>>, destination: SimulatorAddress) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Operation>();
        let sender = Arc::clone(router);
        router.context().spawn("upstream", async move {
            while let Some(operation) = rx.recv().await {
                let tag = operation.tag();
                if let Err(e) = sender.fire_and_forget(destination, operation).await {
                    tracing::warn!(%destination, op = tag, error = %e, "upstream notification dropped");
                }
            }
        });
        Self { destination, tx }
    }

    pub fn destination(&self) -> SimulatorAddress {
        self.destination
    }

    pub fn send(&self, operation: Operation) -> Result<(), TransportError> {
        self.tx.send(operation).map_err(|_| TransportError::Closed)
    }
}
