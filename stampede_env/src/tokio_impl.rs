//! Production implementation of RuntimeContext using Tokio.

use crate::context::{mix_seed, RuntimeContext};
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::Instrument;

/// Context backed by the Tokio runtime and the system clock.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
    seed: u64,
}

impl TokioContext {
    /// Creates a context with a random master seed.
    pub fn new() -> Self {
        Self::seeded(rand::random())
    }

    /// Creates a context with a fixed master seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            start: Instant::now(),
            seed,
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("task", name = %name);
        tokio::spawn(future.instrument(span));
    }

    fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(mix_seed(self.seed, stream))
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
