//! Simulation context implementing ThrongletContext for deterministic testing.

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thronglet_env::ThrongletContext;
use tokio::task::JoinHandle;

/// Wall-clock time that virtual time 0 maps to (2024-01-01 00:00:00 UTC).
pub const SIM_EPOCH_SECS: u64 = 1_704_067_200;

/// Simulation context backed by deterministic time and RNG.
///
/// This implements `ThrongletContext` using:
/// - A virtual clock that only moves when advanced
/// - Seeded ChaCha8 streams derived from the context seed
/// - Simulated sleep that advances virtual time
///
/// Contexts created with [`SimContext::fork`] share the clock but carry their
/// own seed, so every node in a cluster draws from an independent stream.
pub struct SimContext {
    /// Seed for this context's random streams
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(SIM_EPOCH_SECS),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Creates a context on the same clock with a seed derived for `stream`.
    pub fn fork(&self, stream: u64) -> Self {
        Self {
            seed: self.seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ stream,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
        }
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner);
        *time += duration.as_nanos() as u64;
    }

    /// Sets the virtual time to a specific value.
    pub fn set_time(&self, time_ns: u64) {
        let mut time = self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner);
        *time = time_ns;
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl ThrongletContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping advances the shared clock, then yields so other tasks run
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::trace!("spawning sim task {}", name);
        tokio::spawn(future)
    }

    fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        // Combine seed with stream id for an independent sequence
        let combined_seed = self.seed.wrapping_mul(0x517c_c1b7_2722_0a95) ^ stream;
        ChaCha8Rng::seed_from_u64(combined_seed)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_unix_time_starts_at_epoch() {
        let ctx = SimContext::new(1);
        assert_eq!(ctx.unix_time(), SIM_EPOCH_SECS as f64);
        ctx.advance_time(Duration::from_secs(5));
        assert_eq!(ctx.unix_time(), SIM_EPOCH_SECS as f64 + 5.0);
    }

    #[test]
    fn test_sim_context_deterministic_streams() {
        let ctx1 = SimContext::new(42);
        let ctx2 = SimContext::new(42);

        // Same seed + stream = same sequence
        let a: u64 = ctx1.derive_rng(1).gen();
        let b: u64 = ctx2.derive_rng(1).gen();
        assert_eq!(a, b);

        // Different stream = different sequence
        let c: u64 = ctx1.derive_rng(2).gen();
        assert_ne!(a, c);
    }

    #[test]
    fn test_fork_shares_clock_not_seed() {
        let root = SimContext::new(42);
        let fork = root.fork(1);

        root.advance_time(Duration::from_secs(5));
        assert_eq!(fork.now(), Duration::from_secs(5));
        assert_ne!(root.seed(), fork.seed());
        assert_eq!(fork.seed(), root.fork(1).seed());
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));

        // Both should see the same time
        assert_eq!(ctx1.now(), ctx2.now());
    }

    #[tokio::test]
    async fn test_sleep_advances_clock() {
        let ctx = SimContext::new(7);
        ctx.sleep(Duration::from_secs(30)).await;
        assert_eq!(ctx.now(), Duration::from_secs(30));
    }
}
