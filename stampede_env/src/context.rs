//! Runtime context trait shared by every Stampede component.

use async_trait::async_trait;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// Routers, orchestrators and workers take time, task spawning and
/// randomness from a context instead of reaching for tokio or the OS
/// directly. This keeps a run reproducible from a single seed when the
/// simulation harness drives it.
#[async_trait]
pub trait RuntimeContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for failure timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a named background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Derives an independent random stream from the context seed.
    ///
    /// Identical `(seed, stream)` pairs always produce identical sequences.
    fn derive_rng(&self, stream: u64) -> ChaCha8Rng;

    /// Returns the context's master seed.
    fn seed(&self) -> u64;
}

/// Mixes a master seed with a stream identifier.
pub fn mix_seed(seed: u64, stream: u64) -> u64 {
    seed.wrapping_mul(0x517cc1b727220a95) ^ stream
}
