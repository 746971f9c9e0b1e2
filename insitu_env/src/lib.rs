//! In-Situ Environment Abstraction Layer
//!
//! This crate holds the seams between the pull protocol and whatever
//! actually moves bytes between workers:
//! - Intra-group collectives (`GroupComm`: barrier, broadcast, all-reduce)
//! - Group-to-group channels (`GroupChannel`: point-to-point + one-way broadcast)
//! - Channel establishment (`ChannelFabric`: open port, accept, connect)
//! - Time and task spawning (`InSituContext`)
//!
//! The producer and consumer logic in `insitu_core` is generic over these
//! traits, so the same code runs against an MPI-style cluster fabric or the
//! in-process fabric in `insitu_sim`.
//!
//! # Example
//!
//! ```ignore
//! use insitu_env::{ChannelError, ChannelFabric, GroupChannel};
//!
//! async fn hello<F: ChannelFabric>(fabric: &F, group: &F::Group) -> Result<(), ChannelError> {
//!     let port = fabric.open_port(group).await?;
//!     let channel = fabric.accept(&port, group).await?;
//!     let greeting = channel.recv_broadcast(0).await?;
//!     fabric.close_port(&port, group).await
//! }
//! ```

mod channel;
mod comm;
mod context;
mod error;
mod tokio_impl;
mod types;

pub use channel::{ChannelFabric, GroupChannel};
pub use comm::{GroupComm, ReduceOp};
pub use context::InSituContext;
pub use error::ChannelError;
pub use tokio_impl::TokioContext;
pub use types::{PortName, Rank};
