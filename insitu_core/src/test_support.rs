//! Single-worker group and a one-to-one channel pair for unit tests.

use async_trait::async_trait;
use insitu_env::{ChannelError, GroupChannel, GroupComm, Rank, ReduceOp};
use tokio::sync::{mpsc, Mutex};

/// A group of one.
pub struct SoloGroup;

#[async_trait]
impl GroupComm for SoloGroup {
    fn rank(&self) -> Rank {
        0
    }

    fn size(&self) -> usize {
        1
    }

    async fn barrier(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn broadcast(&self, root: Rank, payload: Vec<u8>) -> Result<Vec<u8>, ChannelError> {
        ChannelError::check_rank(root, 1)?;
        Ok(payload)
    }

    async fn all_reduce(&self, values: Vec<f32>, _op: ReduceOp) -> Result<Vec<f32>, ChannelError> {
        Ok(values)
    }
}

/// One end of a channel between two single-worker groups.
pub struct PipeEnd {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

pub fn pipe() -> (PipeEnd, PipeEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        PipeEnd {
            tx: a_tx,
            rx: Mutex::new(b_rx),
        },
        PipeEnd {
            tx: b_tx,
            rx: Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl GroupChannel for PipeEnd {
    fn local_rank(&self) -> Rank {
        0
    }

    fn remote_size(&self) -> usize {
        1
    }

    async fn send(&self, dest: Rank, payload: Vec<u8>) -> Result<(), ChannelError> {
        ChannelError::check_rank(dest, 1)?;
        self.tx
            .send(payload)
            .map_err(|_| ChannelError::disconnected("pipe closed"))
    }

    async fn recv(&self, source: Rank) -> Result<Vec<u8>, ChannelError> {
        ChannelError::check_rank(source, 1)?;
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ChannelError::disconnected("pipe closed"))
    }
}
