//! Core environment context trait for Thronglet nodes.

use async_trait::async_trait;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the simulation engine and
/// the peer protocols can run both as a daemon (tokio) and inside the
/// deterministic cluster harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, OS entropy
/// - **Simulation**: `SimContext` - virtual clock, seeded `ChaCha8Rng`
///
/// # Determinism
///
/// Core logic never reads the wall clock or a global RNG directly. Every
/// timestamp comes from `system_time()` and every random stream from
/// `derive_rng()`.
#[async_trait]
pub trait ThrongletContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for message and creature timestamps.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Wall-clock time as fractional seconds since the Unix epoch.
    fn unix_time(&self) -> f64 {
        unix_secs(self.system_time())
    }

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a named background task.
    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static;

    /// Derives an independent random stream.
    ///
    /// Seeded contexts combine the master seed with `stream` so that each
    /// subsystem (simulation, migration, message ids) draws from its own
    /// reproducible sequence. Unseeded contexts return entropy-seeded streams.
    fn derive_rng(&self, stream: u64) -> ChaCha8Rng;

    /// Returns the context's seed (0 when not seeded).
    fn seed(&self) -> u64;
}

/// Converts a `SystemTime` into fractional seconds since the Unix epoch.
///
/// Times before the epoch collapse to 0.0.
pub fn unix_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_secs_epoch() {
        assert_eq!(unix_secs(UNIX_EPOCH), 0.0);
        assert_eq!(unix_secs(UNIX_EPOCH + Duration::from_millis(1500)), 1.5);
    }

    #[test]
    fn test_unix_secs_before_epoch() {
        let before = UNIX_EPOCH - Duration::from_secs(10);
        assert_eq!(unix_secs(before), 0.0);
    }
}
