//! Synchronous gradient averaging for replicated parameters.

use ndarray::ArrayViewMutD;

use crate::collective::Collective;
use crate::error::CollectiveError;
use crate::topology::TopologyConfig;

/// Parameters whose gradients can be averaged across devices.
///
/// Implementors must visit their gradients in the same order on every call and on every
/// device.
pub trait GradientBuffers {
    /// Calls `f` on every gradient buffer.
    fn visit_grads(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f32>));
}

/// Averages gradients over a fixed group with one flattened all-reduce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataParallelReplicator {
    group: Vec<usize>,
}

impl DataParallelReplicator {
    /// Replicator over an explicit group of ordinals.
    pub fn new(group: Vec<usize>) -> Self {
        Self { group }
    }

    /// Replicator over every device, for parameters replicated on the whole world.
    pub fn world(world_size: usize) -> Self {
        Self::new((0..world_size).collect())
    }

    /// Replicator over the data-parallel group of `topology`, for parameters sharded by table.
    pub fn data_group(topology: &TopologyConfig) -> Self {
        Self::new(topology.data_group().ranks().to_vec())
    }

    /// Member ordinals.
    pub fn group(&self) -> &[usize] {
        &self.group
    }

    /// Replaces every gradient with its mean over the group.
    pub fn average<B: GradientBuffers + ?Sized>(
        &self,
        collective: &dyn Collective,
        buffers: &mut B,
    ) -> Result<(), CollectiveError> {
        if self.group.len() <= 1 {
            return Ok(());
        }

        let mut flat = Vec::new();
        buffers.visit_grads(&mut |grad| flat.extend(grad.iter().copied()));

        self.all_reduce_mean(collective, &mut flat)?;

        let mut offset = 0;
        buffers.visit_grads(&mut |mut grad| {
            for (dst, src) in grad.iter_mut().zip(&flat[offset..]) {
                *dst = *src;
            }
            offset += grad.len();
        });

        Ok(())
    }

    /// Replaces `values` with their element-wise mean over the group.
    pub fn all_reduce_mean(
        &self,
        collective: &dyn Collective,
        values: &mut [f32],
    ) -> Result<(), CollectiveError> {
        collective.all_reduce_sum(values, &self.group)?;
        let scale = 1.0 / self.group.len() as f32;
        values.iter_mut().for_each(|v| *v *= scale);
        Ok(())
    }
}
