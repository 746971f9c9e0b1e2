//! The query/response exchange over an established group channel.
//!
//! # Message sequence (one round)
//!
//! ```text
//! producer leader -> every consumer : globalBounds              (box)
//! consumer c -> every producer p    : numQueries, query...      (count, box...)
//! producer p -> consumer c          : per query: count, records (count, floats)
//! ```
//!
//! Producer workers answer consumer ranks in increasing order and finish
//! every query of rank `r` before reading from rank `r + 1`. A consumer reads
//! its owned blocks in id order and, per block, one response from each
//! producer worker in rank order.

use crate::bounds::Box3;
use crate::error::{InSituError, Result};
use crate::grid::{DomainGrid, GridConfig};
use crate::particles::ParticleLayout;
use crate::wire;
use insitu_env::{GroupChannel, GroupComm};
use serde::{Deserialize, Serialize};

/// Largest record count a consumer accepts for one block.
pub const MAX_BLOCK_PARTICLES: usize = 1 << 30;

/// What one producer worker sent during a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerStats {
    pub consumer_ranks: usize,
    pub queries: usize,
    pub records_sent: usize,
}

/// Producer side of a round, from the bounds broadcast onward.
///
/// `records` must hold whole records of `layout`. The leader sends
/// `global_bounds` to the consumer group; every worker then answers every
/// consumer rank's queries from its own records.
pub async fn answer_queries<G, C>(
    group: &G,
    channel: &C,
    layout: ParticleLayout,
    records: &[f32],
    global_bounds: &Box3,
) -> Result<AnswerStats>
where
    G: GroupComm + ?Sized,
    C: GroupChannel + ?Sized,
{
    if group.is_root() {
        channel.broadcast_to_remote(wire::encode_box(global_bounds)).await?;
    }

    let mut stats = AnswerStats::default();
    let mut selected = Vec::new();

    for rank in 0..channel.remote_size() {
        let num_queries = wire::decode_count(&channel.recv(rank).await?)?;

        for _ in 0..num_queries {
            let query = wire::decode_box(&channel.recv(rank).await?)?;

            selected.clear();
            let count = layout.select_into(records, &query, &mut selected);
            channel.send(rank, wire::encode_count(count)?).await?;
            channel.send(rank, wire::encode_floats(&selected)).await?;

            stats.records_sent += count;
        }

        tracing::debug!(
            producer = group.rank(),
            consumer = rank,
            queries = num_queries,
            "Answered consumer queries"
        );
        stats.queries += num_queries;
        stats.consumer_ranks += 1;
    }

    Ok(stats)
}

/// Consumer side of a round: receives the bounds, builds a fresh grid,
/// requests every owned block's ghost domain and fills the blocks.
pub async fn request_blocks<G, C>(
    group: &G,
    channel: &C,
    config: &GridConfig,
    layout: ParticleLayout,
) -> Result<DomainGrid>
where
    G: GroupComm + ?Sized,
    C: GroupChannel + ?Sized,
{
    let world = wire::decode_box(&channel.recv_broadcast(0).await?)?;
    let mut grid = DomainGrid::from_config(config, world, group.rank(), group.size(), layout)?;

    let queries: Vec<(usize, Box3)> = grid.mine().map(|b| (b.id, b.ghost_domain)).collect();
    let producers = channel.remote_size();

    for producer in 0..producers {
        channel.send(producer, wire::encode_count(queries.len())?).await?;
        for (_, query) in &queries {
            channel.send(producer, wire::encode_box(query)).await?;
        }
    }

    let stride = layout.stride();
    for (block_id, _) in &queries {
        let mut particles = Vec::new();
        let mut total = 0usize;

        for producer in 0..producers {
            let count = wire::decode_count(&channel.recv(producer).await?)?;
            let payload = wire::decode_floats(&channel.recv(producer).await?)?;

            if payload.len() != count * stride {
                return Err(InSituError::protocol(format!(
                    "block {}: producer {} announced {} records but sent {} floats",
                    block_id,
                    producer,
                    count,
                    payload.len()
                )));
            }

            total += count;
            if total >= MAX_BLOCK_PARTICLES {
                return Err(InSituError::protocol(format!(
                    "block {} exceeds {} particles",
                    block_id, MAX_BLOCK_PARTICLES
                )));
            }
            particles.extend_from_slice(&payload);
        }

        if let Some(block) = grid.block_mut(*block_id) {
            block.set_particles(particles);
        }
    }

    tracing::debug!(
        rank = group.rank(),
        blocks = queries.len(),
        particles = grid.particle_count(),
        "Received owned blocks"
    );
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridDims;
    use crate::test_support::{pipe, PipeEnd, SoloGroup};

    async fn send_queries(consumer: &PipeEnd, queries: &[Box3]) {
        consumer.send(0, wire::encode_count(queries.len()).unwrap()).await.unwrap();
        for q in queries {
            consumer.send(0, wire::encode_box(q)).await.unwrap();
        }
    }

    async fn read_response(consumer: &PipeEnd) -> (usize, Vec<f32>) {
        let count = wire::decode_count(&consumer.recv(0).await.unwrap()).unwrap();
        let payload = wire::decode_floats(&consumer.recv(0).await.unwrap()).unwrap();
        (count, payload)
    }

    #[tokio::test]
    async fn test_single_particle_query() {
        let (producer, consumer) = pipe();
        let records = [0.0, 0.0, 0.0, 5.0, 5.0, 5.0];
        let world = ParticleLayout::POSITIONS.bounds(&records);

        send_queries(&consumer, &[Box3::from_corners([-1.0; 3], [1.0; 3])]).await;
        let stats = answer_queries(&SoloGroup, &producer, ParticleLayout::POSITIONS, &records, &world)
            .await
            .unwrap();

        assert_eq!(wire::decode_box(&consumer.recv_broadcast(0).await.unwrap()).unwrap(), world);
        assert_eq!(read_response(&consumer).await, (1, vec![0.0, 0.0, 0.0]));
        assert_eq!(stats, AnswerStats { consumer_ranks: 1, queries: 1, records_sent: 1 });
    }

    #[tokio::test]
    async fn test_one_response_per_query_in_order() {
        let (producer, consumer) = pipe();
        let records = [0.1, 0.1, 0.1, 0.9, 0.9, 0.9, 0.5, 0.5, 0.5];
        let world = Box3::from_corners([0.0; 3], [1.0; 3]);

        send_queries(
            &consumer,
            &[
                Box3::from_corners([0.0; 3], [0.5; 3]),
                Box3::from_corners([2.0; 3], [3.0; 3]),
                Box3::from_corners([0.5; 3], [1.0; 3]),
            ],
        )
        .await;
        answer_queries(&SoloGroup, &producer, ParticleLayout::POSITIONS, &records, &world)
            .await
            .unwrap();
        consumer.recv_broadcast(0).await.unwrap();

        assert_eq!(read_response(&consumer).await, (2, vec![0.1, 0.1, 0.1, 0.5, 0.5, 0.5]));
        assert_eq!(read_response(&consumer).await, (0, vec![]));
        assert_eq!(read_response(&consumer).await, (2, vec![0.9, 0.9, 0.9, 0.5, 0.5, 0.5]));
    }

    #[tokio::test]
    async fn test_round_trip_fills_owned_blocks() {
        let (producer, consumer) = pipe();
        let layout = ParticleLayout::POSITIONS_WITH_ATTRIBUTE;
        let records = vec![0.1, 0.1, 0.1, 1.0, 0.9, 0.9, 0.9, 2.0];
        let world = layout.bounds(&records);
        let config = GridConfig::default().with_dims(GridDims::new(2, 1, 1)).with_ghost_width(0.0);

        let consumer_side = tokio::spawn(async move {
            let grid = request_blocks(&SoloGroup, &consumer, &config, layout).await;
            (grid, consumer)
        });
        answer_queries(&SoloGroup, &producer, layout, &records, &world)
            .await
            .unwrap();

        let (grid, _consumer) = consumer_side.await.unwrap();
        let grid = grid.unwrap();
        assert_eq!(grid.world_bounds(), &world);
        assert_eq!(grid.blocks()[0].particles(), &[0.1, 0.1, 0.1, 1.0]);
        assert_eq!(grid.blocks()[1].attributes(), vec![2.0]);
        assert_eq!(grid.particle_count(), 2);
    }

    #[tokio::test]
    async fn test_repeated_round_is_byte_identical() {
        let records: Vec<f32> = (0..60).map(|i| (i as f32 * 0.37).fract()).collect();
        let world = ParticleLayout::POSITIONS.bounds(&records);
        let query = Box3::from_corners([0.2; 3], [0.8; 3]);

        let mut responses = Vec::new();
        for _ in 0..2 {
            let (producer, consumer) = pipe();
            send_queries(&consumer, &[query]).await;
            answer_queries(&SoloGroup, &producer, ParticleLayout::POSITIONS, &records, &world)
                .await
                .unwrap();
            consumer.recv_broadcast(0).await.unwrap();
            let count = consumer.recv(0).await.unwrap();
            let payload = consumer.recv(0).await.unwrap();
            responses.push((count, payload));
        }
        assert_eq!(responses[0], responses[1]);
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_protocol_error() {
        let (producer, consumer) = pipe();
        let config = GridConfig::default().with_dims(GridDims::cube(1));

        producer
            .broadcast_to_remote(wire::encode_box(&Box3::from_corners([0.0; 3], [1.0; 3])))
            .await
            .unwrap();
        producer.send(0, wire::encode_count(2).unwrap()).await.unwrap();
        producer.send(0, wire::encode_floats(&[0.5, 0.5, 0.5])).await.unwrap();

        let err = request_blocks(&SoloGroup, &consumer, &config, ParticleLayout::POSITIONS)
            .await
            .unwrap_err();
        assert!(matches!(err, InSituError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_closed_channel_fails_round() {
        let (producer, consumer) = pipe();
        drop(consumer);
        let result = answer_queries(
            &SoloGroup,
            &producer,
            ParticleLayout::POSITIONS,
            &[],
            &Box3::zero(),
        )
        .await;
        assert!(matches!(result, Err(InSituError::Channel(_))));
    }
}
