//! Group-to-group channel abstraction.

use async_trait::async_trait;
use crate::comm::GroupComm;
use crate::error::ChannelError;
use crate::types::{PortName, Rank};

/// A direct channel between every worker of this group and every worker of
/// a remote group, established after rendezvous.
///
/// # Packet Flow
///
/// ```text
/// Producer rank p              Channel              Consumer rank c
///   |                             |                        |
///   |-- send(c, bytes) ---------->|                        |
///   |                             |-- FIFO per (p, c) ---->|-- recv(p)
///   |<----------------------------|<-- send(p, bytes) -----|
/// ```
///
/// Messages between one (source, destination) pair arrive in send order.
/// Nothing is guaranteed across different pairs.
#[async_trait]
pub trait GroupChannel: Send + Sync + 'static {
    /// This worker's rank in its own group.
    fn local_rank(&self) -> Rank;

    /// Number of workers in the remote group.
    fn remote_size(&self) -> usize;

    /// Sends one message to remote worker `dest`.
    async fn send(&self, dest: Rank, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Receives the next message from remote worker `source`.
    async fn recv(&self, source: Rank) -> Result<Vec<u8>, ChannelError>;

    /// Root side of a one-way broadcast: every remote worker receives
    /// `payload`.
    async fn broadcast_to_remote(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        for dest in 0..self.remote_size() {
            self.send(dest, payload.clone()).await?;
        }
        Ok(())
    }

    /// Receiving side of [`GroupChannel::broadcast_to_remote`].
    async fn recv_broadcast(&self, root: Rank) -> Result<Vec<u8>, ChannelError> {
        self.recv(root).await
    }
}

/// Establishes group channels between independently launched groups.
///
/// The accepting group opens a port and publishes its name out of band; the
/// connecting group connects to that name. All four operations are
/// collective over the calling group.
#[async_trait]
pub trait ChannelFabric: Send + Sync + 'static {
    /// Intra-group communicator used for the collective parts.
    type Group: GroupComm;

    /// Channel produced by a successful accept/connect.
    type Channel: GroupChannel;

    /// Opens a port; the root's port name is returned on every worker.
    async fn open_port(&self, group: &Self::Group) -> Result<PortName, ChannelError>;

    /// Waits for a connecting group on `port`.
    async fn accept(&self, port: &PortName, group: &Self::Group) -> Result<Self::Channel, ChannelError>;

    /// Connects to the group accepting on `port`.
    ///
    /// Only the root's `port` is significant. Implementations must report
    /// the same outcome on every worker so a failed handshake never leaves
    /// the group half-connected.
    async fn connect(&self, port: &PortName, group: &Self::Group) -> Result<Self::Channel, ChannelError>;

    /// Closes a port opened with [`ChannelFabric::open_port`]. Established
    /// channels stay usable.
    async fn close_port(&self, port: &PortName, group: &Self::Group) -> Result<(), ChannelError>;
}
