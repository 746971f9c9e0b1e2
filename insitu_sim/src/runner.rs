//! Scenario runner - executes pull scenarios against an in-process cluster.

use crate::context::SimContext;
use crate::error::SimError;
use crate::network::LocalFabric;
use crate::scenarios::ScenarioId;
use crate::source::ParticleSource;
use crate::world::{
    poll_feed, pull_rounds, run_group, ConsumerWorkerReport, FeedWorkerReport, ProducerCluster,
    ProducerWorkerReport, SimConfig,
};

use insitu_core::{Box3, DomainGrid, GridDims, InSituError, InSituFeed, ParticleLayout};
use insitu_env::{GroupComm, TokioContext};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Why a scenario did not pass.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}")]
    Check(String),

    #[error(transparent)]
    Sim(#[from] SimError),
}

impl From<InSituError> for RunError {
    fn from(e: InSituError) -> Self {
        RunError::Sim(e.into())
    }
}

fn check(condition: bool, reason: impl FnOnce() -> String) -> Result<(), RunError> {
    if condition {
        Ok(())
    } else {
        Err(RunError::Check(reason()))
    }
}

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Last successful grid of every consumer worker
    pub grids: Vec<DomainGrid>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    /// Producer timesteps (leader)
    pub timesteps: u64,

    /// Pull rounds served / abandoned (leader)
    pub rounds_served: usize,
    pub rounds_failed: usize,

    /// Records sent by all producer workers
    pub records_sent: usize,

    /// Group-channel handshakes (leader registry)
    pub handshakes: u64,

    /// Rendezvous connections queued / dropped
    pub rendezvous_accepted: u64,
    pub rendezvous_rejected: u64,

    /// Consumer pulls, summed over workers
    pub pulls_ok: usize,
    pub pulls_failed: usize,

    /// Records received in the last successful pull, summed over workers
    pub particles_received: usize,
    pub ghost_particles: usize,

    /// Snapshots published by background polling (consumer leader)
    pub snapshots: u64,
}

impl ScenarioMetrics {
    fn absorb_producers(&mut self, reports: &[ProducerWorkerReport]) {
        if let Some(leader) = reports.first() {
            self.timesteps = leader.timesteps;
            self.rounds_served = leader.served;
            self.rounds_failed = leader.failed;
            self.handshakes = leader.handshakes;
            if let Some(accept) = leader.accept {
                self.rendezvous_accepted = accept.accepted;
                self.rendezvous_rejected = accept.rejected;
            }
        }
        self.records_sent = reports.iter().map(|r| r.records_sent).sum();
    }

    fn absorb_consumers(&mut self, reports: &[ConsumerWorkerReport]) {
        for report in reports {
            self.pulls_ok += report.successes();
            self.pulls_failed += report.rounds.len() - report.successes();
            if let Some(last) = report.rounds.iter().rev().find(|r| r.ok) {
                self.particles_received += last.stats.particles;
                self.ghost_particles += last.stats.ghost_particles;
            }
        }
    }

    fn absorb_feeds(&mut self, reports: &[FeedWorkerReport]) {
        self.pulls_ok += reports.iter().map(|r| r.refreshed as usize + 1).sum::<usize>();
        self.particles_received += reports.iter().map(|r| r.last.particles).sum::<usize>();
        self.ghost_particles += reports.iter().map(|r| r.last.ghost_particles).sum::<usize>();
        if let Some(leader) = reports.first() {
            self.snapshots = leader.refreshed;
        }
    }
}

/// Runs pull scenarios.
pub struct ScenarioRunner {
    config: SimConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self::from_config(SimConfig {
            seed,
            ..SimConfig::default()
        })
    }

    pub fn from_config(config: SimConfig) -> Self {
        Self { config }
    }

    pub fn with_producers(mut self, producers: usize) -> Self {
        self.config.producers = producers.max(1);
        self
    }

    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.config.consumers = consumers.max(1);
        self
    }

    pub fn with_particles(mut self, particles: usize) -> Self {
        self.config.particles = particles;
        self
    }

    pub fn with_dims(mut self, dims: GridDims) -> Self {
        self.config.dims = dims;
        self
    }

    pub fn with_ghost_width(mut self, ghost_width: f32) -> Self {
        self.config.ghost_width = ghost_width;
        self
    }

    pub fn with_layout(mut self, layout: ParticleLayout) -> Self {
        self.config.layout = layout;
        self
    }

    pub fn with_rounds(mut self, rounds: usize) -> Self {
        self.config.rounds = rounds.max(1);
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.config.seed);
        if scenario.injects_fault() {
            warn!("Fault injection enabled for {}", scenario.name());
        }

        let mut metrics = ScenarioMetrics::default();
        let mut grids = Vec::new();

        let outcome = match scenario {
            ScenarioId::SingleParticle => self.run_single_particle(&mut metrics, &mut grids).await,
            ScenarioId::UnionOfCubes => self.run_union_of_cubes(&mut metrics, &mut grids).await,
            ScenarioId::MalformedRendezvous => self.run_malformed_rendezvous(&mut metrics, &mut grids).await,
            ScenarioId::Reconnect => self.run_reconnect(&mut metrics, &mut grids).await,
            ScenarioId::MultiBlock => self.run_multi_block(&mut metrics, &mut grids).await,
            ScenarioId::BackgroundPoll => self.run_background_poll(&mut metrics).await,
            ScenarioId::RandomWalk => self.run_random_walk(&mut metrics, &mut grids).await,
            ScenarioId::SeverAndRecover => self.run_sever_and_recover(&mut metrics, &mut grids).await,
            ScenarioId::RefusedHandshake => self.run_refused_handshake(&mut metrics, &mut grids).await,
            ScenarioId::EmptyWorld => self.run_empty_world(&mut metrics).await,
        };

        let failure_reason = outcome.err().map(|e| e.to_string());
        ScenarioResult {
            scenario,
            seed: self.config.seed,
            passed: failure_reason.is_none(),
            failure_reason,
            metrics,
            grids,
        }
    }

    async fn launch(&self, config: &SimConfig, sources: Vec<ParticleSource>) -> Result<ProducerCluster, RunError> {
        Ok(ProducerCluster::launch(LocalFabric::shared(), sources, config.layout, config.tick).await?)
    }

    /// Launches producers, pulls `rounds` times, stops the producers.
    async fn pull_scenario<H>(
        &self,
        config: &SimConfig,
        sources: Vec<ParticleSource>,
        between_rounds: impl FnOnce(&ProducerCluster) -> H,
        metrics: &mut ScenarioMetrics,
        grids: &mut Vec<DomainGrid>,
    ) -> Result<(Vec<ProducerWorkerReport>, Vec<ConsumerWorkerReport>), RunError>
    where
        H: Fn(usize) + Send + Sync + 'static,
    {
        let cluster = self.launch(config, sources).await?;
        let hook = between_rounds(&cluster);
        let consumers = pull_rounds(
            cluster.fabric(),
            config.consumer_config(cluster.addr()),
            config.consumers,
            config.rounds,
            hook,
        )
        .await;
        let producers = cluster.stop().await?;
        let consumers = consumers?;

        metrics.absorb_producers(&producers);
        metrics.absorb_consumers(&consumers);
        grids.extend(consumers.iter().filter_map(|c| c.grid.clone()));
        Ok((producers, consumers))
    }

    /// One fixed particle at the origin, one far away.
    async fn run_single_particle(
        &self,
        metrics: &mut ScenarioMetrics,
        grids: &mut Vec<DomainGrid>,
    ) -> Result<(), RunError> {
        let config = SimConfig {
            producers: 1,
            consumers: 1,
            rounds: 1,
            dims: GridDims::cube(2),
            ghost_width: 0.015,
            layout: ParticleLayout::POSITIONS,
            ..self.config.clone()
        };
        let source = ParticleSource::fixed(config.layout, vec![0.0, 0.0, 0.0, 5.0, 5.0, 5.0]);
        let (_, consumers) = self.pull_scenario(&config, vec![source], |_| |_: usize| {}, metrics, grids).await?;

        let grid = consumers[0]
            .grid
            .as_ref()
            .ok_or_else(|| RunError::Check("pull failed".to_string()))?;
        let world = Box3::from_corners([0.0; 3], [5.0; 3]);
        check(grid.world_bounds() == &world, || {
            format!("world bounds {} != {}", grid.world_bounds(), world)
        })?;

        let origin_block = grid
            .mine()
            .find(|b| b.coords == [0, 0, 0])
            .ok_or_else(|| RunError::Check("block (0, 0, 0) not owned".to_string()))?;
        check(origin_block.particles() == [0.0f32, 0.0, 0.0], || {
            format!("origin block holds {:?}", origin_block.particles())
        })?;
        check(grid.particle_count() == 2, || format!("received {} particles", grid.particle_count()))
    }

    /// Three producers, one unit cube each. One consumer worker asks for the
    /// union box and the per-rank answers must add up to every particle, once.
    async fn run_union_of_cubes(
        &self,
        metrics: &mut ScenarioMetrics,
        grids: &mut Vec<DomainGrid>,
    ) -> Result<(), RunError> {
        let config = SimConfig {
            producers: 3,
            consumers: 1,
            particles: 100,
            dims: GridDims::cube(1),
            ghost_width: 0.0,
            rounds: 1,
            ..self.config.clone()
        };
        let sources: Vec<_> = (0..config.producers)
            .map(|rank| {
                let origin = Vector3::new(2.0 * rank as f32, 0.0, 0.0);
                ParticleSource::unit_cube(config.seed, rank, config.particles, origin, config.layout)
            })
            .collect();
        let expected: Vec<Vec<f32>> = sources
            .iter()
            .flat_map(|s| s.records().chunks_exact(s.layout().stride()).map(|r| r.to_vec()))
            .collect();
        let union = sources
            .iter()
            .fold(Box3::empty(), |acc, s| acc.union(&s.bounds()));

        let (producers, consumers) = self.pull_scenario(&config, sources, |_| |_: usize| {}, metrics, grids).await?;
        check(consumers.iter().all(|c| c.successes() == 1), || "a pull failed".to_string())?;

        let grid = grids.first().ok_or_else(|| RunError::Check("no grid received".to_string()))?;
        let query = grid.blocks()[0].ghost_domain;
        check(query == union, || format!("query box {:?} is not the union {:?}", query, union))?;

        let per_rank: Vec<usize> = producers.iter().map(|p| p.records_sent).collect();
        let answered: usize = per_rank.iter().sum();
        check(answered == expected.len(), || {
            format!("per-rank counts {:?} sum to {}, expected {}", per_rank, answered, expected.len())
        })?;
        check(grid.particle_count() == expected.len(), || {
            format!("received {} particles, expected {}", grid.particle_count(), expected.len())
        })?;

        let received = received_records(grids);
        let missing = expected.iter().filter(|r| !received.contains(&record_key(r))).count();
        check(missing == 0, || format!("{} of {} particles missing", missing, expected.len()))
    }

    /// Malformed rendezvous payloads are dropped without stalling the gate.
    async fn run_malformed_rendezvous(
        &self,
        metrics: &mut ScenarioMetrics,
        grids: &mut Vec<DomainGrid>,
    ) -> Result<(), RunError> {
        use tokio::io::AsyncWriteExt;

        let config = SimConfig {
            rounds: 1,
            ..self.config.clone()
        };
        let cluster = self.launch(&config, config.random_walk_sources()).await?;

        let mut oversized = tokio::net::TcpStream::connect(cluster.addr()).await.map_err(SimError::from)?;
        oversized.write_all(&5000i32.to_le_bytes()).await.map_err(SimError::from)?;
        drop(oversized);

        let mut truncated = tokio::net::TcpStream::connect(cluster.addr()).await.map_err(SimError::from)?;
        truncated.write_all(&50i32.to_le_bytes()).await.map_err(SimError::from)?;
        truncated.write_all(b"local://10").await.map_err(SimError::from)?;
        drop(truncated);

        let consumers = pull_rounds(
            cluster.fabric(),
            config.consumer_config(cluster.addr()),
            config.consumers,
            config.rounds,
            |_| {},
        )
        .await;
        let producers = cluster.stop().await?;
        let consumers = consumers?;
        metrics.absorb_producers(&producers);
        metrics.absorb_consumers(&consumers);
        grids.extend(consumers.iter().filter_map(|c| c.grid.clone()));

        check(metrics.pulls_ok == config.consumers, || "pull after garbage failed".to_string())?;
        check(metrics.rendezvous_rejected == 2, || {
            format!("{} payloads rejected", metrics.rendezvous_rejected)
        })?;
        check(metrics.rendezvous_accepted == 1, || {
            format!("{} payloads accepted", metrics.rendezvous_accepted)
        })
    }

    /// Later pulls reuse the first pull's client slot.
    async fn run_reconnect(&self, metrics: &mut ScenarioMetrics, grids: &mut Vec<DomainGrid>) -> Result<(), RunError> {
        let config = SimConfig {
            rounds: self.config.rounds.max(2),
            ..self.config.clone()
        };
        let (producers, consumers) = self
            .pull_scenario(&config, config.random_walk_sources(), |_| |_: usize| {}, metrics, grids)
            .await?;

        for consumer in &consumers {
            check(consumer.successes() == config.rounds, || {
                format!("rank {} completed {} pulls", consumer.rank, consumer.successes())
            })?;
            let endpoints: HashSet<_> = consumer.rounds.iter().map(|r| r.endpoint.clone()).collect();
            check(endpoints.len() == 1, || {
                format!("rank {} used {} endpoints", consumer.rank, endpoints.len())
            })?;
        }
        for producer in &producers {
            check(producer.clients == 1 && producer.handshakes == 1, || {
                format!(
                    "producer {} holds {} clients after {} handshakes",
                    producer.rank, producer.clients, producer.handshakes
                )
            })?;
            check(producer.served == config.rounds, || {
                format!("producer {} served {} rounds", producer.rank, producer.served)
            })?;
        }
        Ok(())
    }

    /// More blocks than consumer workers with a wide ghost margin.
    async fn run_multi_block(&self, metrics: &mut ScenarioMetrics, grids: &mut Vec<DomainGrid>) -> Result<(), RunError> {
        let config = SimConfig {
            consumers: 3,
            dims: GridDims::new(4, 2, 1),
            ghost_width: 0.05,
            speed: 0.0,
            rounds: 1,
            ..self.config.clone()
        };
        let total = config.producers * config.particles;
        let (_, consumers) = self
            .pull_scenario(&config, config.random_walk_sources(), |_| |_: usize| {}, metrics, grids)
            .await?;

        let owned: usize = consumers.iter().map(|c| c.rounds[0].stats.owned_blocks).sum();
        check(owned == config.dims.num_blocks(), || {
            format!("{} blocks owned, expected {}", owned, config.dims.num_blocks())
        })?;

        let interior: usize = consumers.iter().map(|c| c.rounds[0].stats.interior_particles).sum();
        check(interior >= total, || format!("{} interior particles, expected {}", interior, total))?;
        check(metrics.ghost_particles > 0, || "no ghost copies received".to_string())?;

        for grid in grids.iter() {
            for block in grid.mine() {
                let outside = block
                    .positions()
                    .into_iter()
                    .filter(|p| !block.ghost_domain.contains(p))
                    .count();
                check(outside == 0, || format!("block {} holds {} foreign particles", block.id, outside))?;
            }
        }
        Ok(())
    }

    /// Background polling publishes snapshots and hands the client back.
    async fn run_background_poll(&self, metrics: &mut ScenarioMetrics) -> Result<(), RunError> {
        let config = self.config.clone();
        let cluster = self.launch(&config, config.random_walk_sources()).await?;
        let feeds = poll_feed(
            SimContext::shared(),
            cluster.fabric(),
            config.consumer_config(cluster.addr()),
            config.consumers,
            2,
        )
        .await;
        let producers = cluster.stop().await?;
        let feeds = feeds?;
        metrics.absorb_producers(&producers);
        metrics.absorb_feeds(&feeds);

        for feed in &feeds {
            check(feed.first.particles > 0, || format!("rank {} started empty", feed.rank))?;
            check(feed.seen.windows(2).all(|w| w[0] < w[1]), || {
                format!("rank {} saw generations {:?}", feed.rank, feed.seen)
            })?;
            let last_seen = feed.seen.last().copied().unwrap_or(0);
            check(last_seen >= 2 && feed.refreshed > last_seen, || {
                format!("rank {} refreshed to {} after {}", feed.rank, feed.refreshed, last_seen)
            })?;
            check(feed.received_at.windows(2).all(|w| w[0] <= w[1]), || {
                format!("rank {} snapshot times went backwards", feed.rank)
            })?;
        }
        Ok(())
    }

    /// Moving particles; every pull accounts for every particle.
    async fn run_random_walk(&self, metrics: &mut ScenarioMetrics, grids: &mut Vec<DomainGrid>) -> Result<(), RunError> {
        let config = self.config.clone();
        let total = config.producers * config.particles;
        let (producers, consumers) = self
            .pull_scenario(&config, config.random_walk_sources(), |_| |_: usize| {}, metrics, grids)
            .await?;

        for round in 0..config.rounds {
            let ok = consumers.iter().all(|c| c.rounds[round].ok);
            check(ok, || format!("round {} failed", round))?;
            let interior: usize = consumers.iter().map(|c| c.rounds[round].stats.interior_particles).sum();
            check(interior >= total, || {
                format!("round {}: {} interior particles, expected {}", round, interior, total)
            })?;
        }
        check(producers.iter().all(|p| p.timesteps >= config.rounds as u64), || {
            "producers stepped fewer times than pulls".to_string()
        })
    }

    /// Severed links fail one pull everywhere; the next pull re-attaches.
    async fn run_sever_and_recover(
        &self,
        metrics: &mut ScenarioMetrics,
        grids: &mut Vec<DomainGrid>,
    ) -> Result<(), RunError> {
        let config = SimConfig {
            rounds: 3,
            ..self.config.clone()
        };
        let sever = |cluster: &ProducerCluster| {
            let controller = cluster.controller();
            move |round: usize| {
                if round == 1 {
                    controller.sever_links();
                }
            }
        };
        let (producers, consumers) = self
            .pull_scenario(&config, config.random_walk_sources(), sever, metrics, grids)
            .await?;

        for consumer in &consumers {
            let pattern: Vec<bool> = consumer.rounds.iter().map(|r| r.ok).collect();
            check(pattern == [true, false, true], || {
                format!("rank {} pull outcomes {:?}", consumer.rank, pattern)
            })?;
            check(consumer.rounds[0].endpoint != consumer.rounds[2].endpoint, || {
                format!("rank {} reused a severed endpoint", consumer.rank)
            })?;
        }
        for producer in &producers {
            check(producer.failed == 1 && producer.clients == 2, || {
                format!(
                    "producer {}: {} failed rounds, {} clients",
                    producer.rank, producer.failed, producer.clients
                )
            })?;
        }
        Ok(())
    }

    /// The first handshake is refused; the retry attaches normally.
    async fn run_refused_handshake(
        &self,
        metrics: &mut ScenarioMetrics,
        grids: &mut Vec<DomainGrid>,
    ) -> Result<(), RunError> {
        let config = SimConfig {
            rounds: 2,
            ..self.config.clone()
        };
        let refuse = |cluster: &ProducerCluster| {
            cluster.controller().refuse_next_connects(1);
            |_: usize| {}
        };
        let (producers, consumers) = self
            .pull_scenario(&config, config.random_walk_sources(), refuse, metrics, grids)
            .await?;

        for consumer in &consumers {
            let pattern: Vec<bool> = consumer.rounds.iter().map(|r| r.ok).collect();
            check(pattern == [false, true], || {
                format!("rank {} pull outcomes {:?}", consumer.rank, pattern)
            })?;
        }
        for producer in &producers {
            check(producer.failed == 1 && producer.clients == 1 && producer.handshakes == 1, || {
                format!(
                    "producer {}: {} failed rounds, {} clients, {} handshakes",
                    producer.rank, producer.failed, producer.clients, producer.handshakes
                )
            })?;
        }
        Ok(())
    }

    /// No particles anywhere: the first pull is agreed to be empty.
    async fn run_empty_world(&self, metrics: &mut ScenarioMetrics) -> Result<(), RunError> {
        let config = self.config.clone();
        let sources = (0..config.producers)
            .map(|_| ParticleSource::fixed(config.layout, Vec::new()))
            .collect();
        let cluster = self.launch(&config, sources).await?;

        let fabric = cluster.fabric();
        let consumer_config = config.consumer_config(cluster.addr());
        let outcomes = run_group(config.consumers, move |group| {
            let ctx = Arc::new(TokioContext::for_worker("consumer", group.rank()));
            let fabric = fabric.clone();
            let consumer_config = consumer_config.clone();
            async move {
                let connected = InSituFeed::connect(ctx, consumer_config, fabric, group).await;
                Ok(matches!(connected, Err(InSituError::EmptyDataset)))
            }
        })
        .await;
        let producers = cluster.stop().await?;
        let outcomes = outcomes?;
        metrics.absorb_producers(&producers);

        check(outcomes.iter().all(|empty| *empty), || {
            format!("empty dataset reported on {:?}", outcomes)
        })?;
        check(metrics.rounds_served == 1, || {
            format!("{} rounds served", metrics.rounds_served)
        })
    }
}

fn record_key(record: &[f32]) -> Vec<u32> {
    record.iter().map(|v| v.to_bits()).collect()
}

fn received_records(grids: &[DomainGrid]) -> HashSet<Vec<u32>> {
    grids
        .iter()
        .flat_map(|grid| grid.mine())
        .flat_map(|block| {
            let stride = block.layout().stride();
            block
                .particles()
                .chunks_exact(stride)
                .map(record_key)
                .collect::<Vec<_>>()
        })
        .collect()
}
