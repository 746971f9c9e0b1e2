//! Error types for the in-situ environment abstraction.

use thiserror::Error;

/// Errors raised by communicators, group channels and channel fabrics.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer's endpoint went away (dropped, severed, shut down)
    #[error("Peer disconnected: {0}")]
    Disconnected(String),

    /// No open port with this name exists on the fabric
    #[error("Unknown port: {0}")]
    UnknownPort(String),

    /// Group-channel establishment failed on the connecting side
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connecting side gave up on a port this group is accepting on
    #[error("Connection refused on port {0}")]
    Refused(String),

    /// A rank outside the addressed group
    #[error("Invalid rank {rank} for group of size {size}")]
    InvalidRank { rank: usize, size: usize },

    /// Workers disagreed on the shape of a collective
    #[error("Collective mismatch: {0}")]
    CollectiveMismatch(String),
}

impl ChannelError {
    /// Creates a disconnection error.
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Creates a handshake error.
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    /// Checks `rank` against a group of `size` workers.
    pub fn check_rank(rank: usize, size: usize) -> Result<(), Self> {
        if rank < size {
            Ok(())
        } else {
            Err(Self::InvalidRank { rank, size })
        }
    }
}
