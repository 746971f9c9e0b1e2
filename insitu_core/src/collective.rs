//! Typed helpers over the byte-level intra-group collectives.

use crate::bounds::Box3;
use crate::error::Result;
use crate::wire;
use insitu_env::{GroupComm, PortName, Rank, ReduceOp};

/// Broadcasts an `i32` from `root`. Non-root values are ignored.
pub async fn broadcast_i32<G: GroupComm + ?Sized>(group: &G, root: Rank, value: i32) -> Result<i32> {
    let payload = if group.rank() == root {
        wire::encode_i32(value)
    } else {
        Vec::new()
    };
    let data = group.broadcast(root, payload).await?;
    wire::decode_i32(&data)
}

/// Broadcasts a count from `root`. Non-root values are ignored.
pub async fn broadcast_count<G: GroupComm + ?Sized>(group: &G, root: Rank, count: usize) -> Result<usize> {
    let payload = if group.rank() == root {
        wire::encode_count(count)?
    } else {
        Vec::new()
    };
    let data = group.broadcast(root, payload).await?;
    wire::decode_count(&data)
}

/// Broadcasts the root's port name.
pub async fn broadcast_port<G: GroupComm + ?Sized>(group: &G, root: Rank, port: &PortName) -> Result<PortName> {
    let payload = if group.rank() == root {
        port.as_str().as_bytes().to_vec()
    } else {
        Vec::new()
    };
    let data = group.broadcast(root, payload).await?;
    String::from_utf8(data)
        .map(PortName::from)
        .map_err(|e| crate::InSituError::protocol(format!("broadcast port name is not UTF-8: {}", e)))
}

/// Component-wise min of lowers and max of uppers across the group.
pub async fn all_reduce_bounds<G: GroupComm + ?Sized>(group: &G, local: &Box3) -> Result<Box3> {
    let lower = group
        .all_reduce(local.lower.iter().copied().collect(), ReduceOp::Min)
        .await?;
    let upper = group
        .all_reduce(local.upper.iter().copied().collect(), ReduceOp::Max)
        .await?;

    if lower.len() != 3 || upper.len() != 3 {
        return Err(crate::InSituError::protocol(format!(
            "bounds reduction returned {} and {} components",
            lower.len(),
            upper.len()
        )));
    }
    Ok(Box3::from_corners(
        [lower[0], lower[1], lower[2]],
        [upper[0], upper[1], upper[2]],
    ))
}

/// True on every worker if `flag` is true on any worker.
///
/// Used to turn a rank-local failure into a group-wide decision before the
/// group diverges from its collective sequence.
pub async fn any_rank<G: GroupComm + ?Sized>(group: &G, flag: bool) -> Result<bool> {
    let reduced = group
        .all_reduce(vec![if flag { 1.0 } else { 0.0 }], ReduceOp::Max)
        .await?;
    Ok(reduced.first().copied().unwrap_or(0.0) > 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SoloGroup;

    #[tokio::test]
    async fn test_solo_broadcasts() {
        let group = SoloGroup;
        assert_eq!(broadcast_i32(&group, 0, -1).await.unwrap(), -1);
        assert_eq!(broadcast_count(&group, 0, 7).await.unwrap(), 7);

        let port = PortName::from("local://x");
        assert_eq!(broadcast_port(&group, 0, &port).await.unwrap(), port);
    }

    #[tokio::test]
    async fn test_any_rank_and_bounds() {
        let group = SoloGroup;
        assert!(any_rank(&group, true).await.unwrap());
        assert!(!any_rank(&group, false).await.unwrap());

        let local = Box3::from_corners([0.0, 1.0, 2.0], [3.0, 4.0, 5.0]);
        assert_eq!(all_reduce_bounds(&group, &local).await.unwrap(), local);
        assert!(all_reduce_bounds(&group, &Box3::empty()).await.unwrap().is_empty());
    }
}
