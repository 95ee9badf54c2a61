//! Collective communication primitives consumed by the embedding protocol.
//!
//! Every operation here is a blocking barrier over the given group: a device that reaches it
//! waits until every other member has reached the same operation. Groups are slices of global
//! ordinals ordered by rank within the group; contributions are always placed in that order.

mod local;

pub use local::*;

use core::fmt;

use ndarray::ArrayD;

use crate::error::CollectiveError;

/// The collective operations a device can execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectiveOp {
    /// Concatenation of every member's tensor along an axis.
    AllGather {
        /// Gather axis.
        axis: usize,
    },
    /// Element-wise sum of every member's buffer.
    AllReduceSum,
}

impl fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveOp::AllGather { axis } => write!(f, "all_gather(axis={axis})"),
            CollectiveOp::AllReduceSum => write!(f, "all_reduce_sum"),
        }
    }
}

/// Message-passing collective backend.
///
/// Devices share no memory; the only exchange of data between them goes through these
/// operations. [`LocalCollective`] connects threads of one process.
pub trait Collective: Send + Sync {
    /// Global rank of this device.
    fn rank(&self) -> usize;

    /// Total number of devices.
    fn world_size(&self) -> usize;

    /// Concatenates every member's `tensor` along `axis`.
    ///
    /// The result's size along `axis` is the input size times `group.len()`, with each
    /// member's contribution at the offset of its rank within `group`. Every member must pass
    /// tensors of the same shape.
    fn all_gather(
        &self,
        tensor: ArrayD<f32>,
        axis: usize,
        group: &[usize],
    ) -> Result<ArrayD<f32>, CollectiveError>;

    /// Replaces `buf` with the element-wise sum of every member's buffer.
    ///
    /// Contributions are summed in group order, so every member obtains bit-identical results.
    fn all_reduce_sum(&self, buf: &mut [f32], group: &[usize]) -> Result<(), CollectiveError>;
}

/// Index of `rank` within `group`.
pub(crate) fn group_position(rank: usize, group: &[usize]) -> Result<usize, CollectiveError> {
    group
        .iter()
        .position(|&member| member == rank)
        .ok_or_else(|| CollectiveError::NotInGroup {
            rank,
            group: group.to_vec(),
        })
}
