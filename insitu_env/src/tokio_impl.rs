//! Production implementation of InSituContext using Tokio.

use crate::{InSituContext, Rank};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Production context backed by the Tokio runtime and the system clock.
///
/// Tasks spawned through the context run inside a span carrying the task
/// name and, if set, the worker label (`"consumer-2"`).
pub struct TokioContext {
    start: Instant,
    worker: Option<String>,
}

impl TokioContext {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            worker: None,
        }
    }

    /// Context for one worker of a group.
    pub fn for_worker(role: &str, rank: Rank) -> Self {
        Self {
            start: Instant::now(),
            worker: Some(format!("{}-{}", role, rank)),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InSituContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!(
            "insitu_task",
            task = %name,
            worker = self.worker.as_deref().unwrap_or("-")
        );
        tokio::spawn(
            async move {
                tracing::debug!("task started");
                future.await;
                tracing::debug!("task finished");
            }
            .instrument(span),
        )
    }
}
