//! Published consumer datasets and the background poller.
//!
//! Every completed pull becomes an immutable [`Snapshot`] swapped into a
//! watch channel. Readers hold an `Arc<Snapshot>` and never observe a grid
//! that is still being filled; a failed background pull leaves the last good
//! snapshot in place.

use crate::bounds::Box3;
use crate::collective::any_rank;
use crate::consumer::{ConsumerConfig, PullClient};
use crate::error::{InSituError, Result};
use crate::grid::{DatasetStats, DomainGrid};
use insitu_env::{ChannelError, ChannelFabric, GroupComm, InSituContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// One complete pull result.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// 0 for the blocking first pull, +1 per published pull.
    pub generation: u64,
    pub grid: DomainGrid,
    /// Context time when the pull completed.
    pub received_at: Duration,
}

impl Snapshot {
    /// Bounds of every owned particle center; empty if nothing is owned.
    pub fn center_bounds(&self) -> Box3 {
        let mut bounds = Box3::empty();
        for block in self.grid.mine() {
            for p in block.layout().positions(block.particles()) {
                bounds.extend(&p);
            }
        }
        bounds
    }

    /// [`Snapshot::center_bounds`] padded by the sphere radius.
    pub fn sphere_bounds(&self, radius: f32) -> Box3 {
        let centers = self.center_bounds();
        if centers.is_empty() {
            centers
        } else {
            centers.grow(radius)
        }
    }

    pub fn stats(&self) -> DatasetStats {
        self.grid.stats()
    }
}

/// Read side of a feed; cheap to clone and hand to render tasks.
#[derive(Debug, Clone)]
pub struct SnapshotFeed {
    rx: watch::Receiver<Arc<Snapshot>>,
}

impl SnapshotFeed {
    /// The most recently published snapshot.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.rx.borrow().clone()
    }

    /// Waits for a newer snapshot. Fails once the feed is gone.
    pub async fn changed(&mut self) -> Result<Arc<Snapshot>> {
        self.rx
            .changed()
            .await
            .map_err(|_| ChannelError::disconnected("snapshot feed closed"))?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

struct Poller<F: ChannelFabric> {
    stop: watch::Sender<bool>,
    done: oneshot::Receiver<PullClient<F>>,
    task: tokio::task::JoinHandle<()>,
}

/// Consumer-side data feed: one pull client, its latest snapshot and an
/// optional background poller.
///
/// Every method is collective over the consumer group.
pub struct InSituFeed<F: ChannelFabric, X: InSituContext> {
    ctx: Arc<X>,
    client: Option<PullClient<F>>,
    snapshot: Arc<watch::Sender<Arc<Snapshot>>>,
    poller: Option<Poller<F>>,
}

impl<F: ChannelFabric, X: InSituContext> InSituFeed<F, X> {
    /// Attaches and blocks for the first dataset.
    ///
    /// Fails with [`InSituError::EmptyDataset`] if the first pull delivers
    /// no particle to any consumer worker.
    pub async fn connect(ctx: Arc<X>, config: ConsumerConfig, fabric: Arc<F>, group: F::Group) -> Result<Self> {
        let mut client = PullClient::new(config, fabric, group)?;
        let grid = client.pull().await?;

        let stats = grid.stats();
        if !any_rank(client.group(), stats.particles > 0).await? {
            return Err(InSituError::EmptyDataset);
        }
        if client.group().is_root() {
            tracing::info!(
                particles = stats.particles,
                ghost = stats.ghost_particles,
                blocks = stats.owned_blocks,
                "Initial dataset received"
            );
        }

        let first = Snapshot {
            generation: 0,
            grid,
            received_at: ctx.now(),
        };
        let (tx, _) = watch::channel(Arc::new(first));

        Ok(Self {
            ctx,
            client: Some(client),
            snapshot: Arc::new(tx),
            poller: None,
        })
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> SnapshotFeed {
        SnapshotFeed {
            rx: self.snapshot.subscribe(),
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_some()
    }

    /// Pulls once in the foreground and publishes the result.
    pub async fn refresh(&mut self) -> Result<Arc<Snapshot>> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| InSituError::config("cannot refresh while the background poller is running"))?;

        let grid = client.pull().await?;
        let next = Arc::new(Snapshot {
            generation: self.snapshot.borrow().generation + 1,
            grid,
            received_at: self.ctx.now(),
        });
        self.snapshot.send_replace(next.clone());
        Ok(next)
    }

    /// Starts pulling every `delay` in a supervised background task.
    pub fn start_polling(&mut self, delay: Duration) -> Result<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| InSituError::config("background poller already running"))?;

        let (stop, stop_rx) = watch::channel(false);
        let (done_tx, done) = oneshot::channel();
        let ctx = self.ctx.clone();
        let snapshot = self.snapshot.clone();

        let task = self.ctx.spawn("insitu-poller", async move {
            let client = poll(ctx, client, snapshot, delay, stop_rx).await;
            let _ = done_tx.send(client);
        });

        self.poller = Some(Poller { stop, done, task });
        Ok(())
    }

    /// Stops the poller and waits for its in-flight pull to finish.
    pub async fn stop_polling(&mut self) -> Result<()> {
        let Some(poller) = self.poller.take() else {
            return Ok(());
        };

        let _ = poller.stop.send(true);
        let client = poller.done.await;
        if let Err(e) = poller.task.await {
            tracing::warn!(error = %e, "Poller task did not exit cleanly");
        }

        match client {
            Ok(client) => {
                self.client = Some(client);
                Ok(())
            }
            Err(_) => Err(ChannelError::disconnected("poller exited without returning its client").into()),
        }
    }

    /// Stops polling and releases the channel.
    pub async fn shutdown(mut self) -> Result<()> {
        self.stop_polling().await?;
        if let Some(mut client) = self.client.take() {
            client.detach();
        }
        Ok(())
    }
}

async fn poll<F, X>(
    ctx: Arc<X>,
    mut client: PullClient<F>,
    snapshot: Arc<watch::Sender<Arc<Snapshot>>>,
    delay: Duration,
    mut stop: watch::Receiver<bool>,
) -> PullClient<F>
where
    F: ChannelFabric,
    X: InSituContext,
{
    loop {
        let woken = tokio::select! {
            _ = ctx.sleep(delay) => false,
            _ = stop.changed() => true,
        };
        let requested = woken || *stop.borrow();

        match any_rank(client.group(), requested).await {
            Ok(false) => {}
            Ok(true) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Poller lost its consumer group");
                break;
            }
        }

        match client.pull().await {
            Ok(grid) => {
                let generation = snapshot.borrow().generation + 1;
                snapshot.send_replace(Arc::new(Snapshot {
                    generation,
                    grid,
                    received_at: ctx.now(),
                }));
                tracing::debug!(generation, "Published snapshot");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Background pull failed, keeping last dataset");
            }
        }
    }
    client
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridDims;
    use crate::particles::ParticleLayout;

    fn snapshot_with(particles: Vec<f32>) -> Snapshot {
        let mut grid = DomainGrid::build(
            GridDims::cube(1),
            Box3::from_corners([0.0; 3], [1.0; 3]),
            0.1,
            0,
            1,
        )
        .unwrap();
        grid.block_mut(0).unwrap().set_particles(particles);
        Snapshot {
            generation: 0,
            grid,
            received_at: Duration::ZERO,
        }
    }

    #[test]
    fn test_center_and_sphere_bounds() {
        let snap = snapshot_with(vec![0.2, 0.3, 0.4, 0.6, 0.1, 0.9]);
        assert_eq!(snap.center_bounds(), Box3::from_corners([0.2, 0.1, 0.4], [0.6, 0.3, 0.9]));
        assert_eq!(snap.sphere_bounds(0.5), snap.center_bounds().grow(0.5));
        assert_eq!(snap.grid.blocks()[0].layout(), ParticleLayout::POSITIONS);
    }

    #[test]
    fn test_empty_snapshot_bounds() {
        let snap = snapshot_with(Vec::new());
        assert!(snap.center_bounds().is_empty());
        assert!(snap.sphere_bounds(1.0).is_empty());
        assert_eq!(snap.stats().particles, 0);
    }

    #[tokio::test]
    async fn test_snapshot_feed_sees_replacement() {
        let (tx, _) = watch::channel(Arc::new(snapshot_with(Vec::new())));
        let mut feed = SnapshotFeed { rx: tx.subscribe() };
        assert_eq!(feed.latest().generation, 0);

        let mut next = snapshot_with(vec![0.5, 0.5, 0.5]);
        next.generation = 1;
        tx.send_replace(Arc::new(next));

        let seen = feed.changed().await.unwrap();
        assert_eq!(seen.generation, 1);
        assert_eq!(seen.stats().particles, 1);

        drop(tx);
        assert!(feed.changed().await.is_err());
    }
}
