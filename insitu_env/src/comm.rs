//! Intra-group communicator abstraction.

use async_trait::async_trait;
use crate::error::ChannelError;
use crate::types::Rank;

/// Element-wise reduction applied by [`GroupComm::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
}

impl ReduceOp {
    /// Combines two values.
    pub fn apply(&self, a: f32, b: f32) -> f32 {
        match self {
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }

    /// Combines `incoming` into `acc` element by element.
    pub fn fold_into(&self, acc: &mut [f32], incoming: &[f32]) -> Result<(), ChannelError> {
        if acc.len() != incoming.len() {
            return Err(ChannelError::CollectiveMismatch(format!(
                "all_reduce over {} values met a contribution of {}",
                acc.len(),
                incoming.len()
            )));
        }
        for (a, b) in acc.iter_mut().zip(incoming) {
            *a = self.apply(*a, *b);
        }
        Ok(())
    }
}

/// Communication among the workers of one process group.
///
/// Every method is a blocking, group-wide collective: all workers must call
/// the same collectives in the same order, the same number of times. A
/// worker that skips one stalls the rest of its group.
///
/// # Implementations
///
/// - **In-process**: `insitu_sim::LocalGroup` (tokio channels between tasks)
/// - **Cluster**: an MPI intra-communicator wrapper
#[async_trait]
pub trait GroupComm: Send + Sync + 'static {
    /// This worker's rank in `0..size()`.
    fn rank(&self) -> Rank;

    /// Number of workers in the group.
    fn size(&self) -> usize;

    /// True on the group's leader (rank 0).
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Blocks until every worker of the group has entered the barrier.
    async fn barrier(&self) -> Result<(), ChannelError>;

    /// Broadcasts `payload` from `root` to every worker.
    ///
    /// Non-root workers pass anything (typically an empty vector); every
    /// worker returns the root's payload.
    async fn broadcast(&self, root: Rank, payload: Vec<u8>) -> Result<Vec<u8>, ChannelError>;

    /// Reduces `values` element-wise across the group; every worker
    /// receives the result.
    async fn all_reduce(&self, values: Vec<f32>, op: ReduceOp) -> Result<Vec<f32>, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_ops() {
        assert_eq!(ReduceOp::Min.apply(1.0, -2.0), -2.0);
        assert_eq!(ReduceOp::Max.apply(1.0, -2.0), 1.0);
    }

    #[test]
    fn test_fold_into_rejects_length_mismatch() {
        let mut acc = vec![0.0, 0.0];
        assert!(ReduceOp::Max.fold_into(&mut acc, &[1.0]).is_err());

        ReduceOp::Max.fold_into(&mut acc, &[1.0, -1.0]).unwrap();
        assert_eq!(acc, vec![1.0, 0.0]);
    }
}
