//! Forward half of the hybrid protocol: gather, reorder and narrow.

use ndarray::Axis;

use crate::collective::Collective;
use crate::embedding::LocalEmbeddings;
use crate::error::DistributedError;
use crate::partition::TablePartition;
use crate::tensor::{ShardedTensor, narrow, stack_tables, unstack_tables};
use crate::topology::TopologyConfig;

/// Rebuilds, for every table, the embedding rows of this device's batch slice.
///
/// Each position contributes its `L = ceil(T / G)` full-batch tensors. After an all-gather over
/// the model-parallel group every device holds all `G * L` tensors in device-major order,
/// restores table order with the [`ReorderPermutation`](crate::partition::ReorderPermutation)
/// and keeps only its own rows of the batch.
#[derive(Clone, Copy, Debug)]
pub struct CollectiveSynchronizer<'a> {
    topology: &'a TopologyConfig,
    partition: &'a TablePartition,
}

impl<'a> CollectiveSynchronizer<'a> {
    /// Synchronizer for the device described by `topology`.
    pub fn new(topology: &'a TopologyConfig, partition: &'a TablePartition) -> Self {
        Self {
            topology,
            partition,
        }
    }

    /// Returns one `(B / G, D)` tensor per table, in table order.
    ///
    /// Blocks until every member of the model-parallel group has contributed.
    pub fn synchronize(
        &self,
        collective: &dyn Collective,
        local: &LocalEmbeddings,
    ) -> Result<Vec<ShardedTensor>, DistributedError> {
        let global_batch = local.global_batch();
        let embedding_dim = local.embedding_dim();
        let global_shape = [global_batch, embedding_dim];
        let slice = self.topology.batch_slice(global_batch)?;
        let spec = self.topology.local_batch_spec();

        if self.topology.is_degenerate() {
            return local
                .outputs()
                .iter()
                .map(|output| {
                    ShardedTensor::new(output.clone(), spec, global_shape)
                        .map_err(DistributedError::from)
                })
                .collect();
        }

        let group_len = self.partition.group_len();
        let local_count = self.partition.local_table_count();

        let stacked = stack_tables(&local.contributions())?.insert_axis(Axis(0));
        let gathered =
            collective.all_gather(stacked, 0, self.topology.model_group().ranks())?;
        let tensors = unstack_tables(
            &gathered,
            "gathered embeddings",
            &[group_len, local_count, global_batch, embedding_dim],
        )?;

        let ordered = self.partition.reorder().apply(&tensors)?;
        log::debug!(
            "Ordinal {} gathered {} embedding tensors, keeping rows {:?} of {} tables",
            self.topology.ordinal(),
            tensors.len(),
            slice.range(),
            ordered.len()
        );

        ordered
            .iter()
            .map(|tensor| {
                let rows = narrow(tensor, 0, slice.start(), slice.len())?;
                ShardedTensor::new(rows, spec, global_shape).map_err(DistributedError::from)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalCollective;
    use crate::embedding::{EmbeddingTable, LocalEmbeddingExecutor, SparseFeature};
    use crate::topology::ParallelMode;
    use ndarray::{Array2, array};

    #[test]
    fn test_single_device_is_identity() {
        let topology = TopologyConfig::new(0, 1, 1, ParallelMode::Hybrid).unwrap();
        let partition = TablePartition::for_topology(2, &topology).unwrap();
        let tables = vec![
            EmbeddingTable::from_weight(array![[1.0], [2.0]]),
            EmbeddingTable::from_weight(array![[3.0], [4.0]]),
        ];
        let features = vec![
            SparseFeature::from_bags([vec![0], vec![1]]),
            SparseFeature::from_bags([vec![1], vec![0, 1]]),
        ];
        let local = LocalEmbeddingExecutor::new(&partition, 1)
            .run(&tables, &features)
            .unwrap();

        let world = LocalCollective::world(1);
        let synced = CollectiveSynchronizer::new(&topology, &partition)
            .synchronize(&world[0], &local)
            .unwrap();

        let outputs: Vec<Array2<f32>> = synced.into_iter().map(|t| t.into_local()).collect();
        assert_eq!(outputs, local.outputs());
        assert_eq!(outputs[1], array![[4.0], [7.0]]);
    }
}
