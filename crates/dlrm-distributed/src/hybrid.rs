//! The embedding layer of one device in a hybrid data/model-parallel world.

use ndarray::{Array2, ArrayViewMutD};

use crate::collective::Collective;
use crate::embedding::{
    EmbeddingBag, EmbeddingTable, LocalEmbeddingExecutor, LocalEmbeddings, SparseFeature,
};
use crate::error::{ConfigError, DistributedError, InvariantViolation};
use crate::partition::TablePartition;
use crate::replicator::GradientBuffers;
use crate::router::GradientRouter;
use crate::sync::CollectiveSynchronizer;
use crate::tensor::ShardedTensor;
use crate::topology::TopologyConfig;

/// Result of [`HybridEmbedding::forward`].
#[derive(Clone, Debug)]
pub struct EmbeddingForward {
    local: Vec<ShardedTensor>,
    full_batch: LocalEmbeddings,
    owned_features: Vec<SparseFeature>,
}

impl EmbeddingForward {
    /// This device's batch rows of every table, in table order.
    pub fn local(&self) -> &[ShardedTensor] {
        &self.local
    }

    /// Local shards as plain tensors, for the interaction stage.
    pub fn local_tensors(&self) -> Vec<Array2<f32>> {
        self.local.iter().map(|t| t.local().clone()).collect()
    }

    /// Full-batch outputs of the owned tables, retained for gradient routing.
    pub fn full_batch(&self) -> &LocalEmbeddings {
        &self.full_batch
    }
}

/// Owns this device's embedding tables and drives the forward and backward collectives.
#[derive(Clone, Debug)]
pub struct HybridEmbedding {
    topology: TopologyConfig,
    partition: TablePartition,
    embedding_dim: usize,
    tables: Vec<EmbeddingTable>,
}

impl HybridEmbedding {
    /// Creates the tables owned by this device.
    ///
    /// `table_sizes[i]` is the row count of table `i`. Table `i` is initialized from
    /// `seed + i`, so the union of all devices' tables does not depend on the group length.
    pub fn new(
        topology: TopologyConfig,
        table_sizes: &[usize],
        embedding_dim: usize,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        let partition = TablePartition::for_topology(table_sizes.len(), &topology)?;
        let tables = partition
            .owned_tables()
            .iter()
            .map(|&table| {
                EmbeddingTable::init(
                    table_sizes[table],
                    embedding_dim,
                    seed.wrapping_add(table as u64),
                )
            })
            .collect();

        Ok(Self {
            topology,
            partition,
            embedding_dim,
            tables,
        })
    }

    /// The device topology.
    pub fn topology(&self) -> &TopologyConfig {
        &self.topology
    }

    /// The table partition of this device.
    pub fn partition(&self) -> &TablePartition {
        &self.partition
    }

    /// Width of every table.
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Owned tables, in the order of [`TablePartition::owned_tables`].
    pub fn tables(&self) -> &[EmbeddingTable] {
        &self.tables
    }

    /// Owned table with global index `table`, if this device owns it.
    pub fn table(&self, table: usize) -> Option<&EmbeddingTable> {
        self.local_index(table).map(|k| &self.tables[k])
    }

    /// Replaces the owned tables, e.g. when restoring a checkpoint.
    pub fn replace_tables(&mut self, tables: Vec<EmbeddingTable>) -> Result<(), InvariantViolation> {
        if tables.len() != self.tables.len() {
            return Err(InvariantViolation::TableCount {
                expected: self.tables.len(),
                got: tables.len(),
            });
        }
        if let Some(table) = tables
            .iter()
            .find(|t| t.embedding_dim() != self.embedding_dim)
        {
            return Err(InvariantViolation::UnexpectedShape {
                context: "restored embedding table",
                expected: vec![table.num_embeddings(), self.embedding_dim],
                got: table.weight().shape().to_vec(),
            });
        }
        self.tables = tables;
        Ok(())
    }

    /// Looks up the owned tables and exchanges the results over the model-parallel group.
    ///
    /// `features` holds the full global batch of all `T` tables. The returned local tensors
    /// hold this device's batch slice of every table.
    pub fn forward(
        &self,
        collective: &dyn Collective,
        features: &[SparseFeature],
    ) -> Result<EmbeddingForward, DistributedError> {
        let full_batch = LocalEmbeddingExecutor::new(&self.partition, self.embedding_dim)
            .run(&self.tables, features)?;
        let local = CollectiveSynchronizer::new(&self.topology, &self.partition)
            .synchronize(collective, &full_batch)?;
        let owned_features = full_batch
            .tables()
            .iter()
            .map(|&table| features[table].clone())
            .collect();

        Ok(EmbeddingForward {
            local,
            full_batch,
            owned_features,
        })
    }

    /// Routes the `T` local-batch gradients to the owning devices and accumulates them into the
    /// owned tables' gradients.
    pub fn backward(
        &mut self,
        collective: &dyn Collective,
        forward: &EmbeddingForward,
        grads: &[Array2<f32>],
    ) -> Result<(), DistributedError> {
        let routed = GradientRouter::new(&self.topology, &self.partition).route(
            collective,
            grads,
            &forward.full_batch,
        )?;

        for (k, routed) in routed.iter().enumerate() {
            self.tables[k].backward(&forward.owned_features[k], &routed.grad)?;
        }
        Ok(())
    }

    /// Clears every owned table's gradient.
    pub fn zero_grad(&mut self) {
        self.tables.iter_mut().for_each(EmbeddingTable::zero_grad);
    }

    /// Applies one SGD step to every owned table.
    pub fn sgd_step(&mut self, lr: f32) {
        self.tables.iter_mut().for_each(|t| t.sgd_step(lr));
    }

    fn local_index(&self, table: usize) -> Option<usize> {
        self.partition.owned_tables().binary_search(&table).ok()
    }
}

impl GradientBuffers for HybridEmbedding {
    fn visit_grads(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f32>)) {
        for table in self.tables.iter_mut() {
            f(table.grad_mut().view_mut().into_dyn());
        }
    }
}
