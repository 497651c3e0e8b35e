//! Link abstraction between neighbouring endpoints.
//!
//! A router owns one [`Link`] per neighbour (its parent plus its children)
//! and a single inbox into which every link delivers incoming frames.
//!
//! ```text
//! Coordinator                 Link                    Agent A1
//!   |                           |                        |
//!   |-- send(frame) ----------->|                        |
//!   |                           |-- [latency/sever] ---->| inbox.recv() -> frame
//! ```

use crate::address::SimulatorAddress;
use crate::error::EnvError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// An encoded message on the wire.
pub type Frame = Vec<u8>;

/// Sending half of a router inbox.
pub type InboxSender = mpsc::Sender<Frame>;

/// Receiving half of a router inbox.
pub type InboxReceiver = mpsc::Receiver<Frame>;

/// Default inbox capacity in frames.
pub const DEFAULT_INBOX_CAPACITY: usize = 4096;

/// Creates a bounded inbox.
pub fn inbox(capacity: usize) -> (InboxSender, InboxReceiver) {
    mpsc::channel(capacity)
}

/// One direction of a connection to a neighbouring endpoint.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Queues a frame for delivery to the remote endpoint.
    ///
    /// Success does not guarantee delivery; the remote may die before
    /// processing it.
    async fn send(&self, frame: Frame) -> Result<(), EnvError>;

    /// Address of the endpoint at the other end.
    fn remote(&self) -> SimulatorAddress;

    /// True once the link can no longer carry frames.
    fn is_closed(&self) -> bool;
}

/// Fault injection for in-process links.
pub trait LinkController: Send + Sync {
    /// Drops every subsequent frame with an unreachable error.
    fn sever(&self);

    /// Restores delivery after [`sever`](LinkController::sever).
    fn heal(&self);

    /// Delays every subsequent frame by the given latency.
    fn set_latency(&self, latency: Duration);
}

/// In-process link that pushes frames straight into the peer's inbox.
pub struct ChannelLink {
    remote: SimulatorAddress,
    peer_inbox: InboxSender,
    severed: AtomicBool,
    latency_micros: AtomicU64,
}

impl ChannelLink {
    /// Creates a link delivering into `peer_inbox`, which belongs to `remote`.
    pub fn new(remote: SimulatorAddress, peer_inbox: InboxSender) -> Arc<Self> {
        Arc::new(Self {
            remote,
            peer_inbox,
            severed: AtomicBool::new(false),
            latency_micros: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Link for ChannelLink {
    async fn send(&self, frame: Frame) -> Result<(), EnvError> {
        if self.severed.load(Ordering::Acquire) {
            return Err(EnvError::unreachable(self.remote));
        }

        let latency = self.latency_micros.load(Ordering::Relaxed);
        if latency == 0 {
            return self
                .peer_inbox
                .send(frame)
                .await
                .map_err(|_| EnvError::closed(self.remote));
        }

        if self.peer_inbox.is_closed() {
            return Err(EnvError::closed(self.remote));
        }
        let inbox = self.peer_inbox.clone();
        let remote = self.remote;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_micros(latency)).await;
            if inbox.send(frame).await.is_err() {
                tracing::debug!(%remote, "delayed frame dropped, inbox closed");
            }
        });
        Ok(())
    }

    fn remote(&self) -> SimulatorAddress {
        self.remote
    }

    fn is_closed(&self) -> bool {
        self.peer_inbox.is_closed()
    }
}

impl LinkController for ChannelLink {
    fn sever(&self) {
        tracing::debug!(remote = %self.remote, "link severed");
        self.severed.store(true, Ordering::Release);
    }

    fn heal(&self) {
        self.severed.store(false, Ordering::Release);
    }

    fn set_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.store(micros, Ordering::Relaxed);
    }
}
