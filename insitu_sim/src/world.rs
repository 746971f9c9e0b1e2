//! SimWorld - producer and consumer groups running as tokio tasks.
//!
//! The producer cluster runs the timestep loop of a simulation: every worker
//! owns a [`ParticleSource`], passes the timestep gate, advances its
//! particles and sleeps for one tick. Consumer groups are launched on demand
//! against the cluster's rendezvous address and share its [`LocalFabric`].

use crate::context::SimContext;
use crate::error::{SimError, SimResult};
use crate::network::{FabricController, LocalFabric, LocalGroup};
use crate::source::{ParticleSource, DEFAULT_SPEED};

use insitu_core::collective::any_rank;
use insitu_core::{
    AcceptStats, ConsumerConfig, DatasetStats, DomainGrid, GridConfig, GridDims, InSituFeed, InSituError,
    ParticleLayout, ProducerConfig, ProducerSession, PullClient, TimestepReport,
};
use insitu_env::GroupComm;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Producer workers
    pub producers: usize,

    /// Consumer workers
    pub consumers: usize,

    /// Particles per producer worker
    pub particles: usize,

    /// Consumer block decomposition
    pub dims: GridDims,

    pub ghost_width: f32,

    pub layout: ParticleLayout,

    /// Random-walk jitter per timestep
    pub speed: f32,

    /// Wall-clock time between producer timesteps
    pub tick: Duration,

    /// Pulls per consumer run
    pub rounds: usize,

    /// Background poll delay (virtual time)
    pub poll_delay: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            producers: 3,
            consumers: 2,
            particles: 100,
            dims: GridDims::cube(2),
            ghost_width: GridConfig::default().ghost_width,
            layout: ParticleLayout::POSITIONS,
            speed: DEFAULT_SPEED,
            tick: Duration::from_millis(2),
            rounds: 3,
            poll_delay: Duration::from_secs(10),
        }
    }
}

impl SimConfig {
    /// Random-walk sources, one per producer worker.
    pub fn random_walk_sources(&self) -> Vec<ParticleSource> {
        (0..self.producers)
            .map(|rank| {
                ParticleSource::random_walk(
                    self.seed,
                    rank,
                    self.producers,
                    self.particles,
                    self.layout,
                    self.speed,
                )
            })
            .collect()
    }

    /// Consumer settings pointing at a cluster's rendezvous address.
    pub fn consumer_config(&self, addr: SocketAddr) -> ConsumerConfig {
        ConsumerConfig::default()
            .with_server(addr.ip().to_string(), addr.port())
            .with_grid(
                GridConfig::default()
                    .with_dims(self.dims)
                    .with_ghost_width(self.ghost_width),
            )
            .with_layout(self.layout)
            .with_poll_delay(Some(self.poll_delay))
    }
}

/// Runs `body` on every worker of a fresh group of `size` and collects the
/// per-rank results in rank order.
pub async fn run_group<T, F, Fut>(size: usize, body: F) -> SimResult<Vec<T>>
where
    T: Send + 'static,
    F: Fn(LocalGroup) -> Fut,
    Fut: Future<Output = insitu_core::Result<T>> + Send + 'static,
{
    let tasks: Vec<_> = LocalGroup::create(size)
        .into_iter()
        .map(|group| tokio::spawn(body(group)))
        .collect();

    let mut results = Vec::with_capacity(size);
    for task in tasks {
        results.push(task.await??);
    }
    Ok(results)
}

/// What one producer worker did over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducerWorkerReport {
    pub rank: usize,
    pub timesteps: u64,
    pub requests: usize,
    pub served: usize,
    pub failed: usize,
    pub new_clients: usize,
    pub records_sent: usize,
    /// Client slots ever handed out.
    pub clients: usize,
    pub handshakes: u64,
    /// Leader only.
    pub accept: Option<AcceptStats>,
}

impl ProducerWorkerReport {
    fn absorb(&mut self, step: &TimestepReport) {
        self.requests += step.requests;
        self.served += step.served;
        self.failed += step.failed;
        self.new_clients += step.new_clients;
        self.records_sent += step.records_sent;
    }
}

/// A running producer group.
pub struct ProducerCluster {
    addr: SocketAddr,
    fabric: Arc<LocalFabric>,
    stop: watch::Sender<bool>,
    workers: Vec<JoinHandle<insitu_core::Result<ProducerWorkerReport>>>,
}

impl ProducerCluster {
    /// Starts one worker per source, listening on an ephemeral loopback
    /// port, and waits until the rendezvous socket is bound.
    pub async fn launch(
        fabric: Arc<LocalFabric>,
        sources: Vec<ParticleSource>,
        layout: ParticleLayout,
        tick: Duration,
    ) -> SimResult<Self> {
        if sources.is_empty() {
            return Err(SimError::Launch("no producer workers".to_string()));
        }

        let config = ProducerConfig::default()
            .with_listen_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .with_layout(layout);
        let (stop, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut ready_tx = Some(ready_tx);

        let groups = LocalGroup::create(sources.len());
        let workers = groups
            .into_iter()
            .zip(sources)
            .map(|(group, source)| {
                let worker = ProducerWorker {
                    fabric: fabric.clone(),
                    config: config.clone(),
                    source,
                    tick,
                    stop: stop_rx.clone(),
                    ready: if group.is_root() { ready_tx.take() } else { None },
                };
                tokio::spawn(worker.run(group))
            })
            .collect::<Vec<_>>();

        match ready_rx.await {
            Ok(addr) => {
                tracing::info!(%addr, workers = workers.len(), "Producer cluster running");
                Ok(Self {
                    addr,
                    fabric,
                    stop,
                    workers,
                })
            }
            Err(_) => {
                for worker in workers {
                    if let Ok(Err(e)) = worker.await {
                        return Err(e.into());
                    }
                }
                Err(SimError::Launch("producer leader exited before binding".to_string()))
            }
        }
    }

    /// Rendezvous address of the leader.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn fabric(&self) -> Arc<LocalFabric> {
        self.fabric.clone()
    }

    pub fn controller(&self) -> FabricController {
        self.fabric.controller()
    }

    /// Asks the group to leave its timestep loop and collects the reports.
    pub async fn stop(self) -> SimResult<Vec<ProducerWorkerReport>> {
        self.stop.send_replace(true);

        let mut reports = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            reports.push(worker.await??);
        }
        Ok(reports)
    }
}

struct ProducerWorker {
    fabric: Arc<LocalFabric>,
    config: ProducerConfig,
    source: ParticleSource,
    tick: Duration,
    stop: watch::Receiver<bool>,
    ready: Option<oneshot::Sender<SocketAddr>>,
}

impl ProducerWorker {
    async fn run(mut self, group: LocalGroup) -> insitu_core::Result<ProducerWorkerReport> {
        let rank = group.rank();
        let mut session = ProducerSession::init(self.config, self.fabric, group).await?;

        if let (Some(ready), Some(addr)) = (self.ready.take(), session.local_addr()) {
            let _ = ready.send(addr);
        }

        let mut report = ProducerWorkerReport {
            rank,
            ..ProducerWorkerReport::default()
        };

        loop {
            let step = session.timestep(self.source.records()).await?;
            report.absorb(&step);
            self.source.step();

            let stopping = *self.stop.borrow();
            if any_rank(session.group(), stopping).await? {
                break;
            }
            tokio::time::sleep(self.tick).await;
        }

        report.timesteps = session.timesteps();
        report.clients = session.registry().len();
        report.handshakes = session.registry().handshakes();
        report.accept = session.shutdown().await?;

        tracing::debug!(rank, timesteps = report.timesteps, "Producer worker finished");
        Ok(report)
    }
}

/// Outcome of one pull on one consumer worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRound {
    pub round: usize,
    pub ok: bool,
    pub stats: DatasetStats,
    /// Port name the producer was pointed at.
    pub endpoint: Option<String>,
    pub error: Option<String>,
}

/// Per-rank result of [`pull_rounds`].
#[derive(Debug, Clone)]
pub struct ConsumerWorkerReport {
    pub rank: usize,
    pub rounds: Vec<PullRound>,
    /// Grid of the last successful pull.
    pub grid: Option<DomainGrid>,
}

impl ConsumerWorkerReport {
    pub fn successes(&self) -> usize {
        self.rounds.iter().filter(|r| r.ok).count()
    }
}

/// Runs a consumer group that pulls `rounds` times with one [`PullClient`].
///
/// `between_rounds(round)` runs on the consumer leader while the whole group
/// is parked between pulls. Failed pulls are recorded; only configuration
/// errors abort the run.
pub async fn pull_rounds<H>(
    fabric: Arc<LocalFabric>,
    config: ConsumerConfig,
    consumers: usize,
    rounds: usize,
    between_rounds: H,
) -> SimResult<Vec<ConsumerWorkerReport>>
where
    H: Fn(usize) + Send + Sync + 'static,
{
    let between_rounds = Arc::new(between_rounds);

    run_group(consumers, move |group| {
        let fabric = fabric.clone();
        let config = config.clone();
        let between_rounds = between_rounds.clone();

        async move {
            let rank = group.rank();
            let mut client = PullClient::new(config, fabric, group)?;
            let mut report = ConsumerWorkerReport {
                rank,
                rounds: Vec::with_capacity(rounds),
                grid: None,
            };

            for round in 0..rounds {
                if round > 0 {
                    client.group().barrier().await?;
                    if client.group().is_root() {
                        between_rounds(round);
                    }
                    client.group().barrier().await?;
                }

                match client.pull().await {
                    Ok(grid) => {
                        report.rounds.push(PullRound {
                            round,
                            ok: true,
                            stats: grid.stats(),
                            endpoint: client.endpoint().map(|e| e.to_string()),
                            error: None,
                        });
                        report.grid = Some(grid);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::debug!(rank, round, error = %e, "Pull failed");
                        report.rounds.push(PullRound {
                            round,
                            ok: false,
                            stats: DatasetStats::default(),
                            endpoint: None,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }

            client.detach();
            Ok(report)
        }
    })
    .await
}

/// Per-rank result of [`poll_feed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedWorkerReport {
    pub rank: usize,
    pub first: DatasetStats,
    /// Generations observed through the subscription, in order.
    pub seen: Vec<u64>,
    /// Context time of every observed snapshot.
    pub received_at: Vec<Duration>,
    /// Generation of the foreground refresh after polling stopped.
    pub refreshed: u64,
    pub last: DatasetStats,
}

/// Runs a consumer group through the feed lifecycle: blocking first pull,
/// background polling until `generations` is reached, stop, one foreground
/// refresh, shutdown.
pub async fn poll_feed(
    ctx: Arc<SimContext>,
    fabric: Arc<LocalFabric>,
    config: ConsumerConfig,
    consumers: usize,
    generations: u64,
) -> SimResult<Vec<FeedWorkerReport>> {
    let delay = config.poll_delay.unwrap_or(Duration::from_secs(10));

    run_group(consumers, move |group| {
        let ctx = ctx.clone();
        let fabric = fabric.clone();
        let config = config.clone();

        async move {
            let rank = group.rank();
            let mut feed = InSituFeed::connect(ctx, config, fabric, group).await?;
            let first = feed.snapshot().stats();
            let mut updates = feed.subscribe();

            feed.start_polling(delay)?;
            let mut seen = Vec::new();
            let mut received_at = Vec::new();
            while seen.last().copied().unwrap_or(0) < generations {
                let snapshot = updates.changed().await?;
                seen.push(snapshot.generation);
                received_at.push(snapshot.received_at);
            }
            feed.stop_polling().await?;

            let refreshed = feed.refresh().await?;
            let report = FeedWorkerReport {
                rank,
                first,
                seen,
                received_at,
                refreshed: refreshed.generation,
                last: refreshed.stats(),
            };
            feed.shutdown().await?;
            Ok::<_, InSituError>(report)
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_points_at_cluster() {
        let config = SimConfig {
            dims: GridDims::new(4, 1, 1),
            ghost_width: 0.05,
            ..SimConfig::default()
        };
        let consumer = config.consumer_config("127.0.0.1:4567".parse().unwrap());

        assert_eq!(consumer.server_host, "127.0.0.1");
        assert_eq!(consumer.server_port, 4567);
        assert_eq!(consumer.grid.dims, GridDims::new(4, 1, 1));
        assert_eq!(consumer.grid.ghost_width, 0.05);
        assert!(consumer.validate().is_ok());
    }

    #[test]
    fn test_one_source_per_producer() {
        let config = SimConfig {
            producers: 4,
            particles: 10,
            ..SimConfig::default()
        };
        let sources = config.random_walk_sources();
        assert_eq!(sources.len(), 4);
        assert!(sources.iter().all(|s| s.len() == 10));
    }

    #[tokio::test]
    async fn test_run_group_collects_in_rank_order() {
        let ranks = run_group(3, |group| async move { Ok(group.rank()) }).await.unwrap();
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cluster_stops_cleanly_without_consumers() {
        let config = SimConfig {
            producers: 2,
            particles: 5,
            ..SimConfig::default()
        };
        let cluster = ProducerCluster::launch(
            LocalFabric::shared(),
            config.random_walk_sources(),
            config.layout,
            config.tick,
        )
        .await
        .unwrap();
        assert_ne!(cluster.addr().port(), 0);

        let reports = cluster.stop().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].timesteps, reports[1].timesteps);
        assert!(reports[0].accept.is_some());
        assert!(reports[1].accept.is_none());
        assert_eq!(reports[0].requests, 0);
    }
}
