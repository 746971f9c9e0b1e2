//! Virtual clock for consumer pollers.
//!
//! `sleep` never waits: it moves the shared clock forward and yields, so a
//! poller configured with a ten second delay cycles as fast as the producer
//! gate lets it while still stamping snapshots with plausible times.

use async_trait::async_trait;
use insitu_env::InSituContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct VirtualClock {
    now_ns: AtomicU64,
    sleeps: AtomicU64,
}

/// Context whose clock only moves when someone sleeps. Clones share it.
#[derive(Debug, Clone)]
pub struct SimContext {
    clock: Arc<VirtualClock>,
    epoch: SystemTime,
}

impl SimContext {
    pub fn new() -> Self {
        // 2024-01-01 00:00:00 UTC
        Self::with_epoch(UNIX_EPOCH + Duration::from_secs(1_704_067_200))
    }

    /// Virtual time zero maps to `epoch` in [`InSituContext::system_time`].
    pub fn with_epoch(epoch: SystemTime) -> Self {
        Self {
            clock: Arc::new(VirtualClock::default()),
            epoch,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.clock.now_ns.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn time_ns(&self) -> u64 {
        self.clock.now_ns.load(Ordering::SeqCst)
    }

    /// Number of `sleep` calls so far.
    pub fn sleeps(&self) -> u64 {
        self.clock.sleeps.load(Ordering::SeqCst)
    }
}

impl Default for SimContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InSituContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.clock.sleeps.fetch_add(1, Ordering::SeqCst);
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = %name, at = ?self.now(), "spawning sim task");
        tokio::spawn(future)
    }
}
