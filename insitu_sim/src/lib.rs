//! In-process harness for in-situ pulls.
//!
//! Producer and consumer groups run as tokio tasks inside one process. The
//! group collectives and group channels come from [`network`]; the
//! rendezvous socket is a real loopback TCP listener, so the accept loop and
//! wire framing run exactly as in a deployment.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          LocalFabric                          │
//! │   ┌──────────────────┐    group channel    ┌───────────────┐  │
//! │   │ ProducerCluster  │◄───────────────────►│ consumer group│  │
//! │   │  rank 0..P       │                     │  rank 0..C    │  │
//! │   │  ParticleSource  │                     │  PullClient / │  │
//! │   └────────▲─────────┘                     │  InSituFeed   │  │
//! │            │ rendezvous (TCP, loopback)    └───────┬───────┘  │
//! │            └───────────────────────────────────────┘          │
//! │                 FabricController (fault injection)            │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use insitu_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42).with_producers(3).with_consumers(2);
//! let result = runner.run(ScenarioId::Reconnect).await;
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod exporter;
mod network;
mod runner;
mod source;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use error::{SimError, SimResult};
pub use exporter::{BlockExport, ConsumerExport, DatasetExport};
pub use network::{FabricController, LocalChannel, LocalFabric, LocalGroup};
pub use runner::{RunError, ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use source::{ParticleSource, DEFAULT_SPEED};
pub use world::{
    poll_feed, pull_rounds, run_group, ConsumerWorkerReport, FeedWorkerReport, ProducerCluster,
    ProducerWorkerReport, PullRound, SimConfig,
};
