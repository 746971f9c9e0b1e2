//! In-situ particle pulls between a producer group and a consumer group.
//!
//! A running simulation (the producer group) serves spatial subsets of its
//! particles to an independently launched consumer group on demand:
//!
//! 1. The consumer leader connects to the producer's rendezvous socket and
//!    publishes the name of a group-channel port ([`rendezvous`]).
//! 2. The producer leader's [`accept_loop`] queues the name; at its next
//!    timestep gate the producer group connects to the port, or reuses the
//!    channel it already holds for that name ([`registry`], [`producer`]).
//! 3. The producer reduces the world bounds, the consumer decomposes them into
//!    a [`grid::DomainGrid`], requests the ghost domain of every block it
//!    owns, and receives the matching particles ([`pull`], [`consumer`]).
//! 4. Completed pulls are published as immutable snapshots, optionally
//!    refreshed by a background poller ([`feed`]).
//!
//! The group plumbing is abstracted by `insitu_env`; `insitu_sim` provides an
//! in-process fabric for tests and the simulation harness.

pub mod accept_loop;
pub mod bounds;
pub mod collective;
pub mod consumer;
pub mod error;
pub mod feed;
pub mod grid;
pub mod particles;
pub mod producer;
pub mod pull;
pub mod registry;
pub mod rendezvous;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use accept_loop::{AcceptLoopHandle, AcceptStats, PendingAttachments};
pub use bounds::Box3;
pub use consumer::{ConsumerConfig, PullClient};
pub use error::{InSituError, Result};
pub use feed::{InSituFeed, Snapshot, SnapshotFeed};
pub use grid::{Block, DatasetStats, DomainGrid, GridConfig, GridDims};
pub use particles::ParticleLayout;
pub use producer::{ProducerConfig, ProducerSession, RoundOutcome, TimestepReport};
pub use pull::{AnswerStats, MAX_BLOCK_PARTICLES};
pub use registry::{ClientId, ClientRegistry, ClientResolution};
pub use rendezvous::DEFAULT_PORT;
