//! Producer and consumer groups in one process, rendezvous over loopback TCP.

use insitu_core::{DomainGrid, GridDims, InSituError, ParticleLayout, PullClient};
use insitu_sim::scenarios::ScenarioId;
use insitu_sim::{
    pull_rounds, run_group, LocalFabric, ParticleSource, ProducerCluster, ScenarioRunner, SimConfig,
};
use nalgebra::Vector3;

fn runner() -> ScenarioRunner {
    ScenarioRunner::new(42)
        .with_producers(3)
        .with_consumers(2)
        .with_particles(100)
}

async fn assert_passes(scenario: ScenarioId) {
    let result = runner().run(scenario).await;
    assert!(
        result.passed,
        "{} failed: {}",
        scenario,
        result.failure_reason.unwrap_or_default()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_particle_at_origin() {
    assert_passes(ScenarioId::SingleParticle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_union_of_three_cubes_delivers_every_particle() {
    let result = runner().run(ScenarioId::UnionOfCubes).await;
    assert!(result.passed, "{:?}", result.failure_reason);

    assert_eq!(result.grids.len(), 1);
    let world = result.grids[0].world_bounds();
    assert!(world.lower.x > 0.0 && world.upper.x < 5.0);
    assert_eq!(result.grids[0].blocks()[0].ghost_domain, *world);
    assert_eq!(result.metrics.records_sent, 300);
    assert_eq!(result.metrics.particles_received, 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_union_query_counts_sum_across_ranks() {
    let config = SimConfig {
        producers: 3,
        consumers: 1,
        dims: GridDims::cube(1),
        ghost_width: 0.0,
        ..SimConfig::default()
    };
    let sources = (0..config.producers)
        .map(|rank| {
            let origin = Vector3::new(2.0 * rank as f32, 0.0, 0.0);
            ParticleSource::unit_cube(config.seed, rank, 100, origin, config.layout)
        })
        .collect();
    let cluster = ProducerCluster::launch(LocalFabric::shared(), sources, config.layout, config.tick)
        .await
        .unwrap();

    let reports = pull_rounds(
        cluster.fabric(),
        config.consumer_config(cluster.addr()),
        config.consumers,
        1,
        |_| {},
    )
    .await
    .unwrap();
    let producers = cluster.stop().await.unwrap();

    let per_rank: Vec<usize> = producers.iter().map(|p| p.records_sent).collect();
    assert_eq!(per_rank, vec![100, 100, 100]);

    let grid = reports[0].grid.clone().unwrap();
    assert_eq!(grid.particle_count(), 300);
    let mut seen: Vec<[u32; 3]> = grid.blocks()[0]
        .particles()
        .chunks_exact(3)
        .map(|r| [r[0].to_bits(), r[1].to_bits(), r[2].to_bits()])
        .collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_rendezvous_is_skipped() {
    let result = runner().run(ScenarioId::MalformedRendezvous).await;
    assert!(result.passed, "{:?}", result.failure_reason);
    assert_eq!(result.metrics.rendezvous_rejected, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_reuses_one_channel() {
    let result = runner().with_rounds(3).run(ScenarioId::Reconnect).await;
    assert!(result.passed, "{:?}", result.failure_reason);
    assert_eq!(result.metrics.handshakes, 1);
    assert_eq!(result.metrics.rounds_served, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_block_with_ghosts() {
    let result = runner().run(ScenarioId::MultiBlock).await;
    assert!(result.passed, "{:?}", result.failure_reason);
    assert_eq!(result.grids.len(), 3);
    assert!(result.metrics.ghost_particles > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_background_poll_publishes_and_stops() {
    let result = runner().run(ScenarioId::BackgroundPoll).await;
    assert!(result.passed, "{:?}", result.failure_reason);
    assert!(result.metrics.snapshots >= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_walk_with_attributes() {
    let result = runner()
        .with_layout(ParticleLayout::POSITIONS_WITH_ATTRIBUTE)
        .with_dims(GridDims::new(3, 2, 1))
        .run(ScenarioId::RandomWalk)
        .await;
    assert!(result.passed, "{:?}", result.failure_reason);

    for grid in &result.grids {
        for block in grid.mine() {
            assert_eq!(block.attributes().len(), block.particle_count());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sever_and_recover() {
    assert_passes(ScenarioId::SeverAndRecover).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refused_handshake_then_retry() {
    assert_passes(ScenarioId::RefusedHandshake).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_world_is_reported() {
    assert_passes(ScenarioId::EmptyWorld).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_pull_of_static_data_is_identical() {
    let config = SimConfig {
        producers: 2,
        consumers: 2,
        ..SimConfig::default()
    };
    let sources = (0..config.producers)
        .map(|rank| {
            let origin = Vector3::new(rank as f32, 0.0, 0.0);
            ParticleSource::unit_cube(config.seed, rank, 50, origin, config.layout)
        })
        .collect();
    let cluster = ProducerCluster::launch(LocalFabric::shared(), sources, config.layout, config.tick)
        .await
        .unwrap();

    let fabric = cluster.fabric();
    let consumer = config.consumer_config(cluster.addr());
    let pulls = run_group(config.consumers, move |group| {
        let fabric = fabric.clone();
        let consumer = consumer.clone();
        async move {
            let mut client = PullClient::new(consumer, fabric, group)?;
            let first: DomainGrid = client.pull().await?;
            let second = client.pull().await?;
            Ok::<_, InSituError>((first, second))
        }
    })
    .await;
    let producers = cluster.stop().await.unwrap();

    for (first, second) in pulls.unwrap() {
        assert_eq!(first, second);
        assert!(first.particle_count() > 0);
    }
    assert_eq!(producers[0].handshakes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_more_consumers_than_blocks_share_ownership() {
    let config = SimConfig {
        producers: 1,
        consumers: 4,
        dims: GridDims::cube(1),
        rounds: 1,
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

    let reports = pull_rounds(
        cluster.fabric(),
        config.consumer_config(cluster.addr()),
        config.consumers,
        config.rounds,
        |_| {},
    )
    .await;
    cluster.stop().await.unwrap();

    for report in reports.unwrap() {
        assert_eq!(report.successes(), 1);
        let grid = report.grid.unwrap();
        assert_eq!(grid.particle_count(), config.particles);
        assert_eq!(grid.blocks()[0].num_owners, 4);
    }
}
